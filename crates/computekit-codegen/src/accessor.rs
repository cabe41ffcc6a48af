//! Captured-value accessors and their cache.
//!
//! An [`Accessor`] reads the current value of one [`CapturedMember`] out of a
//! host instance at dispatch time. Accessors are built once per member
//! identity and shared by every kernel that captures the same member.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::capture::{CapturedMember, ErasedGetter, HostValue};
use crate::types::ShaderType;

/// Errors that can occur while building or reading an accessor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessorError {
    /// The member claims both a field and a property backing.
    #[error("member `{member}` has both a field and a property backing")]
    ConflictingBacking { member: String },

    /// The member has neither a field nor a property backing.
    #[error("member `{member}` has no field or property backing")]
    MissingBacking { member: String },

    /// An instance member was read without an instance.
    #[error("instance of `{owner}` required to read an instance member")]
    MissingInstance { owner: &'static str },

    /// The instance passed in is not of the owning type.
    #[error("instance is not a `{expected}`")]
    InstanceTypeMismatch { expected: &'static str },

    /// The getter produced a value that does not fit the declared type.
    #[error("member `{member}` produced a value that is not a `{expected}`")]
    ValueShapeMismatch { member: String, expected: String },

    /// The member was captured earlier with a different declared type.
    #[error("member `{member}` is already captured as `{cached}`, not `{requested}`")]
    DeclaredTypeMismatch {
        member: String,
        cached: String,
        requested: String,
    },
}

/// Shared reading machinery behind every accessor variant.
#[derive(Clone)]
pub struct MemberReader {
    member: String,
    ty: ShaderType,
    is_static: bool,
    getter: ErasedGetter,
}

impl MemberReader {
    fn read(&self, instance: Option<&dyn Any>) -> Result<HostValue, AccessorError> {
        // Statics ignore whatever instance the caller has at hand.
        let instance = if self.is_static { None } else { instance };
        let value = (self.getter)(instance)?;
        if !value.matches(&self.ty) {
            return Err(AccessorError::ValueShapeMismatch {
                member: self.member.clone(),
                expected: self.ty.to_hlsl(),
            });
        }
        Ok(value)
    }
}

impl fmt::Debug for MemberReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberReader")
            .field("member", &self.member)
            .field("ty", &self.ty)
            .field("is_static", &self.is_static)
            .finish()
    }
}

/// Typed reader for one captured member.
///
/// The variant is chosen from the member's declared type when the accessor is
/// built, so dispatch never inspects types again.
#[derive(Debug, Clone)]
pub enum Accessor {
    /// By-value scalar.
    Scalar(MemberReader),
    /// By-value vector or matrix.
    Vector(MemberReader),
    /// By-value struct.
    Aggregate(MemberReader),
    /// Buffer handle.
    Resource(MemberReader),
}

impl Accessor {
    /// Build an accessor for a member.
    pub fn build(member: &CapturedMember) -> Result<Self, AccessorError> {
        let getter = match member.backings() {
            (Some(field), None) => field.clone(),
            (None, Some(property)) => property.clone(),
            (Some(_), Some(_)) => {
                return Err(AccessorError::ConflictingBacking {
                    member: member.id().to_string(),
                })
            }
            (None, None) => {
                return Err(AccessorError::MissingBacking {
                    member: member.id().to_string(),
                })
            }
        };

        let reader = MemberReader {
            member: member.id().to_string(),
            ty: member.ty().clone(),
            is_static: member.is_static(),
            getter,
        };

        Ok(match member.ty() {
            ShaderType::Scalar(_) => Accessor::Scalar(reader),
            ShaderType::Vector(..) | ShaderType::Matrix(..) => Accessor::Vector(reader),
            ShaderType::Struct(_) => Accessor::Aggregate(reader),
            ShaderType::Buffer { .. } => Accessor::Resource(reader),
            ShaderType::Void => {
                return Err(AccessorError::ValueShapeMismatch {
                    member: member.id().to_string(),
                    expected: "a value type".to_string(),
                })
            }
        })
    }

    fn reader(&self) -> &MemberReader {
        match self {
            Accessor::Scalar(r)
            | Accessor::Vector(r)
            | Accessor::Aggregate(r)
            | Accessor::Resource(r) => r,
        }
    }

    /// Read the current value. Static members ignore `instance`.
    pub fn read(&self, instance: Option<&dyn Any>) -> Result<HostValue, AccessorError> {
        self.reader().read(instance)
    }

    /// Identity of the member this accessor reads.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.reader().member
    }

    /// Declared type of the member.
    #[must_use]
    pub fn ty(&self) -> &ShaderType {
        &self.reader().ty
    }

    /// Whether this accessor yields a buffer handle.
    #[must_use]
    pub fn is_resource(&self) -> bool {
        matches!(self, Accessor::Resource(_))
    }
}

/// Accessor cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessorCacheStats {
    /// Published accessors.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Accessors built (including duplicates lost to a concurrent first use).
    pub builds: u64,
}

impl fmt::Display for AccessorCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccessorCache: {} entries, {} hits, {} builds",
            self.entries, self.hits, self.builds
        )
    }
}

/// Process-scoped map from member identity to accessor.
///
/// Entries are never removed. Concurrent first use of the same member may build
/// more than once; the first published accessor wins and later builds are
/// dropped, so every caller observes the same `Arc`.
#[derive(Default)]
pub struct AccessorCache {
    entries: RwLock<HashMap<String, Arc<Accessor>>>,
    hits: AtomicU64,
    builds: AtomicU64,
}

impl AccessorCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the accessor for a member, building it on first use.
    ///
    /// An identity already cached with a different declared type is rejected
    /// with [`AccessorError::DeclaredTypeMismatch`].
    pub fn get_accessor(&self, member: &CapturedMember) -> Result<Arc<Accessor>, AccessorError> {
        if let Some(existing) = self.entries.read().get(member.id()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Self::check_declared(existing, member);
        }

        // Build outside the lock so a slow build never blocks readers.
        let built = Arc::new(Accessor::build(member)?);
        self.builds.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.write();
        let published = entries
            .entry(member.id().to_string())
            .or_insert_with(|| built);
        tracing::debug!(member = %member.id(), "accessor published");
        Self::check_declared(published, member)
    }

    fn check_declared(
        accessor: &Arc<Accessor>,
        member: &CapturedMember,
    ) -> Result<Arc<Accessor>, AccessorError> {
        if accessor.ty() != member.ty() {
            tracing::debug!(
                member = %member.id(),
                cached = %accessor.ty(),
                requested = %member.ty(),
                "member captured with a different type"
            );
            return Err(AccessorError::DeclaredTypeMismatch {
                member: member.id().to_string(),
                cached: accessor.ty().to_hlsl(),
                requested: member.ty().to_hlsl(),
            });
        }
        Ok(Arc::clone(accessor))
    }

    /// Number of cached accessors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> AccessorCacheStats {
        AccessorCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for AccessorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MemberBuilder, ResourceHandle};
    use crate::types::ScalarKind;
    use std::thread;

    struct Simulation {
        counter: u32,
        origin: [f32; 3],
        output: ResourceHandle,
    }

    impl Simulation {
        fn new() -> Self {
            Self {
                counter: 1,
                origin: [0.0, 1.0, 2.0],
                output: ResourceHandle(42),
            }
        }
    }

    fn counter_member() -> CapturedMember {
        CapturedMember::field::<Simulation, _>("counter", ShaderType::UINT, |s| {
            s.counter.into()
        })
    }

    #[test]
    fn test_accessor_idempotence() {
        let cache = AccessorCache::new();
        let first = cache.get_accessor(&counter_member()).unwrap();
        let second = cache.get_accessor(&counter_member()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_redeclared_type_rejected() {
        let cache = AccessorCache::new();
        cache.get_accessor(&counter_member()).unwrap();

        let as_float =
            CapturedMember::field::<Simulation, _>("counter", ShaderType::FLOAT, |s| {
                HostValue::Float(s.counter as f32)
            });
        let err = cache.get_accessor(&as_float).unwrap_err();
        assert!(matches!(
            err,
            AccessorError::DeclaredTypeMismatch { ref cached, ref requested, .. }
                if cached == "uint" && requested == "float"
        ));
        assert_eq!(cache.len(), 1);
        assert!(cache.get_accessor(&counter_member()).is_ok());
    }

    #[test]
    fn test_accessor_observes_mutation() {
        let cache = AccessorCache::new();
        let accessor = cache.get_accessor(&counter_member()).unwrap();

        let mut sim = Simulation::new();
        assert_eq!(accessor.read(Some(&sim)).unwrap(), HostValue::UInt(1));
        sim.counter = 9;
        assert_eq!(accessor.read(Some(&sim)).unwrap(), HostValue::UInt(9));
    }

    #[test]
    fn test_variant_selection() {
        let origin = CapturedMember::property::<Simulation, _>(
            "origin",
            ShaderType::Vector(ScalarKind::Float, 3),
            |s| HostValue::float_vector(&s.origin),
        );
        let output = CapturedMember::field::<Simulation, _>(
            "output",
            ShaderType::read_write_buffer(ShaderType::FLOAT),
            |s| s.output.into(),
        );

        assert!(matches!(
            Accessor::build(&counter_member()).unwrap(),
            Accessor::Scalar(_)
        ));
        assert!(matches!(
            Accessor::build(&origin).unwrap(),
            Accessor::Vector(_)
        ));
        let output = Accessor::build(&output).unwrap();
        assert!(output.is_resource());
        assert_eq!(
            output.read(Some(&Simulation::new())).unwrap(),
            HostValue::Resource(ResourceHandle(42))
        );
    }

    #[test]
    fn test_conflicting_backing_rejected() {
        let cache = AccessorCache::new();
        let member = MemberBuilder::<Simulation>::new("counter", ShaderType::UINT)
            .with_field(|s| s.counter.into())
            .with_property(|s| (s.counter + 1).into())
            .build();
        assert!(matches!(
            cache.get_accessor(&member),
            Err(AccessorError::ConflictingBacking { .. })
        ));

        let member = MemberBuilder::<Simulation>::new("counter", ShaderType::UINT).build();
        assert!(matches!(
            cache.get_accessor(&member),
            Err(AccessorError::MissingBacking { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_instance_checks() {
        let accessor = Accessor::build(&counter_member()).unwrap();

        assert!(matches!(
            accessor.read(None),
            Err(AccessorError::MissingInstance { .. })
        ));
        assert!(matches!(
            accessor.read(Some(&17u32)),
            Err(AccessorError::InstanceTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_static_ignores_instance() {
        let member =
            CapturedMember::static_field::<Simulation, _>("gravity", ShaderType::FLOAT, || {
                9.81f32.into()
            });
        let accessor = Accessor::build(&member).unwrap();
        assert_eq!(accessor.read(None).unwrap(), HostValue::Float(9.81));
        assert_eq!(accessor.read(Some(&5u8)).unwrap(), HostValue::Float(9.81));
    }

    #[test]
    fn test_value_shape_checked() {
        let member = CapturedMember::field::<Simulation, _>("counter", ShaderType::FLOAT, |s| {
            s.counter.into()
        });
        let accessor = Accessor::build(&member).unwrap();
        assert!(matches!(
            accessor.read(Some(&Simulation::new())),
            Err(AccessorError::ValueShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_concurrent_first_use_publishes_one() {
        let cache = Arc::new(AccessorCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get_accessor(&counter_member()).unwrap())
            })
            .collect();

        let accessors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for accessor in &accessors[1..] {
            assert!(Arc::ptr_eq(&accessors[0], accessor));
        }
        assert_eq!(cache.len(), 1);
    }
}
