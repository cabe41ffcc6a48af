//! Captured host values.
//!
//! A kernel closes over host state: scalars, vectors, matrices, structs and
//! GPU buffers. Each captured member is described by a [`CapturedMember`],
//! which names the member, declares its shader type and carries a typed getter
//! that reads the current value out of an owning instance.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::accessor::AccessorError;
use crate::types::{ScalarKind, ShaderType};

/// Opaque handle to a GPU buffer owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

/// A value read from host memory, ready to be packed or bound.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Float(f32),
    Double(f64),
    Int(i32),
    UInt(u32),
    Bool(bool),
    /// Vector components, each a scalar of `kind`.
    Vector {
        kind: ScalarKind,
        components: Vec<HostValue>,
    },
    /// Matrix components in row-major order.
    Matrix {
        kind: ScalarKind,
        rows: u8,
        cols: u8,
        data: Vec<HostValue>,
    },
    /// Struct fields in declaration order.
    Struct(Vec<HostValue>),
    /// A bound GPU buffer.
    Resource(ResourceHandle),
}

impl HostValue {
    /// A `float` vector.
    pub fn float_vector(components: &[f32]) -> Self {
        HostValue::Vector {
            kind: ScalarKind::Float,
            components: components.iter().copied().map(HostValue::Float).collect(),
        }
    }

    /// A `uint` vector.
    pub fn uint_vector(components: &[u32]) -> Self {
        HostValue::Vector {
            kind: ScalarKind::UInt,
            components: components.iter().copied().map(HostValue::UInt).collect(),
        }
    }

    /// An `int` vector.
    pub fn int_vector(components: &[i32]) -> Self {
        HostValue::Vector {
            kind: ScalarKind::Int,
            components: components.iter().copied().map(HostValue::Int).collect(),
        }
    }

    /// A row-major `float` matrix. `data.len()` must be `rows * cols`.
    pub fn float_matrix(rows: u8, cols: u8, data: &[f32]) -> Self {
        HostValue::Matrix {
            kind: ScalarKind::Float,
            rows,
            cols,
            data: data.iter().copied().map(HostValue::Float).collect(),
        }
    }

    /// Scalar kind of a scalar value.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            HostValue::Float(_) => Some(ScalarKind::Float),
            HostValue::Double(_) => Some(ScalarKind::Double),
            HostValue::Int(_) => Some(ScalarKind::Int),
            HostValue::UInt(_) => Some(ScalarKind::UInt),
            HostValue::Bool(_) => Some(ScalarKind::Bool),
            _ => None,
        }
    }

    /// Check the value against a declared shader type.
    pub fn matches(&self, ty: &ShaderType) -> bool {
        match (self, ty) {
            (value, ShaderType::Scalar(kind)) => value.scalar_kind() == Some(*kind),
            (HostValue::Vector { kind, components }, ShaderType::Vector(k, n)) => {
                kind == k
                    && components.len() == *n as usize
                    && components.iter().all(|c| c.scalar_kind() == Some(*k))
            }
            (
                HostValue::Matrix {
                    kind,
                    rows,
                    cols,
                    data,
                },
                ShaderType::Matrix(k, r, c),
            ) => {
                kind == k
                    && rows == r
                    && cols == c
                    && data.len() == (*r as usize) * (*c as usize)
                    && data.iter().all(|d| d.scalar_kind() == Some(*k))
            }
            (HostValue::Struct(values), ShaderType::Struct(s)) => {
                values.len() == s.fields.len()
                    && values
                        .iter()
                        .zip(&s.fields)
                        .all(|(v, f)| v.matches(&f.ty))
            }
            (HostValue::Resource(_), ShaderType::Buffer { .. }) => true,
            _ => false,
        }
    }

    /// Resource handle of a resource value.
    pub fn as_resource(&self) -> Option<ResourceHandle> {
        match self {
            HostValue::Resource(handle) => Some(*handle),
            _ => None,
        }
    }
}

impl From<f32> for HostValue {
    fn from(v: f32) -> Self {
        HostValue::Float(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Double(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Int(v)
    }
}

impl From<u32> for HostValue {
    fn from(v: u32) -> Self {
        HostValue::UInt(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<ResourceHandle> for HostValue {
    fn from(v: ResourceHandle) -> Self {
        HostValue::Resource(v)
    }
}

/// Type-erased member read: given the owning instance (or none for statics),
/// produce the current value.
pub(crate) type ErasedGetter =
    Arc<dyn Fn(Option<&dyn Any>) -> Result<HostValue, AccessorError> + Send + Sync>;

/// How a member is stored on its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// A stored field.
    Field,
    /// A computed getter.
    Property,
}

/// Name and shader type of one capture, the input to layout planning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureDecl {
    /// Identifier used for the capture inside the kernel body.
    pub name: String,
    /// Declared shader type.
    pub ty: ShaderType,
}

impl CaptureDecl {
    /// Create a capture declaration.
    pub fn new(name: impl Into<String>, ty: ShaderType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A host member captured by a kernel.
///
/// The identity is `"{owner}::{member}"` where `owner` is the Rust type name of
/// the owning type. Two members with the same identity are the same member,
/// regardless of which kernel captured them.
#[derive(Clone)]
pub struct CapturedMember {
    id: String,
    owner: &'static str,
    name: String,
    ty: ShaderType,
    is_static: bool,
    field: Option<ErasedGetter>,
    property: Option<ErasedGetter>,
}

impl CapturedMember {
    /// An instance field of `O`.
    pub fn field<O, F>(name: &str, ty: ShaderType, read: F) -> Self
    where
        O: Any,
        F: Fn(&O) -> HostValue + Send + Sync + 'static,
    {
        MemberBuilder::<O>::new(name, ty).with_field(read).build()
    }

    /// An instance property (computed getter) of `O`.
    pub fn property<O, F>(name: &str, ty: ShaderType, read: F) -> Self
    where
        O: Any,
        F: Fn(&O) -> HostValue + Send + Sync + 'static,
    {
        MemberBuilder::<O>::new(name, ty).with_property(read).build()
    }

    /// A static field associated with `O`; reads ignore the instance.
    pub fn static_field<O, F>(name: &str, ty: ShaderType, read: F) -> Self
    where
        O: Any,
        F: Fn() -> HostValue + Send + Sync + 'static,
    {
        let mut member = MemberBuilder::<O>::new(name, ty).build();
        member.is_static = true;
        member.field = Some(erase_static(read));
        member
    }

    /// A static property associated with `O`; reads ignore the instance.
    pub fn static_property<O, F>(name: &str, ty: ShaderType, read: F) -> Self
    where
        O: Any,
        F: Fn() -> HostValue + Send + Sync + 'static,
    {
        let mut member = MemberBuilder::<O>::new(name, ty).build();
        member.is_static = true;
        member.property = Some(erase_static(read));
        member
    }

    /// Stable, process-unique identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning type name.
    #[must_use]
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    /// Member name, also the capture's identifier in the kernel body.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared shader type.
    #[must_use]
    pub fn ty(&self) -> &ShaderType {
        &self.ty
    }

    /// Whether reads ignore the instance.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Field or property, when exactly one backing is present.
    #[must_use]
    pub fn kind(&self) -> Option<MemberKind> {
        match (&self.field, &self.property) {
            (Some(_), None) => Some(MemberKind::Field),
            (None, Some(_)) => Some(MemberKind::Property),
            _ => None,
        }
    }

    /// Layout declaration for this capture.
    pub fn decl(&self) -> CaptureDecl {
        CaptureDecl::new(self.name.clone(), self.ty.clone())
    }

    pub(crate) fn backings(&self) -> (Option<&ErasedGetter>, Option<&ErasedGetter>) {
        (self.field.as_ref(), self.property.as_ref())
    }
}

impl fmt::Debug for CapturedMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedMember")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("is_static", &self.is_static)
            .field("has_field", &self.field.is_some())
            .field("has_property", &self.property.is_some())
            .finish()
    }
}

/// Builder for [`CapturedMember`] with explicit backings.
///
/// Most callers use [`CapturedMember::field`] or [`CapturedMember::property`].
/// The builder exists for reflective hosts that discover backings at runtime
/// and may hand over both or neither; the accessor cache rejects those.
pub struct MemberBuilder<O> {
    name: String,
    ty: ShaderType,
    field: Option<ErasedGetter>,
    property: Option<ErasedGetter>,
    _owner: std::marker::PhantomData<fn(&O)>,
}

impl<O: Any> MemberBuilder<O> {
    /// Start describing member `name` of `O`.
    pub fn new(name: &str, ty: ShaderType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            field: None,
            property: None,
            _owner: std::marker::PhantomData,
        }
    }

    /// Set the field backing.
    pub fn with_field<F>(mut self, read: F) -> Self
    where
        F: Fn(&O) -> HostValue + Send + Sync + 'static,
    {
        self.field = Some(erase(read));
        self
    }

    /// Set the property backing.
    pub fn with_property<F>(mut self, read: F) -> Self
    where
        F: Fn(&O) -> HostValue + Send + Sync + 'static,
    {
        self.property = Some(erase(read));
        self
    }

    /// Finish the member.
    pub fn build(self) -> CapturedMember {
        let owner = type_name::<O>();
        CapturedMember {
            id: format!("{}::{}", owner, self.name),
            owner,
            name: self.name,
            ty: self.ty,
            is_static: false,
            field: self.field,
            property: self.property,
        }
    }
}

fn erase<O, F>(read: F) -> ErasedGetter
where
    O: Any,
    F: Fn(&O) -> HostValue + Send + Sync + 'static,
{
    Arc::new(move |instance: Option<&dyn Any>| -> Result<HostValue, AccessorError> {
        let instance = instance.ok_or(AccessorError::MissingInstance {
            owner: type_name::<O>(),
        })?;
        let owner = instance
            .downcast_ref::<O>()
            .ok_or(AccessorError::InstanceTypeMismatch {
                expected: type_name::<O>(),
            })?;
        Ok(read(owner))
    })
}

fn erase_static<F>(read: F) -> ErasedGetter
where
    F: Fn() -> HostValue + Send + Sync + 'static,
{
    Arc::new(move |_: Option<&dyn Any>| -> Result<HostValue, AccessorError> { Ok(read()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Particle {
        mass: f32,
    }

    #[test]
    fn test_member_identity() {
        let member = CapturedMember::field::<Particle, _>("mass", ShaderType::FLOAT, |p| {
            p.mass.into()
        });
        assert!(member.id().ends_with("Particle::mass"));
        assert_eq!(member.kind(), Some(MemberKind::Field));
        assert!(!member.is_static());
    }

    #[test]
    fn test_builder_allows_conflicting_backings() {
        let member = MemberBuilder::<Particle>::new("mass", ShaderType::FLOAT)
            .with_field(|p| p.mass.into())
            .with_property(|p| (p.mass * 2.0).into())
            .build();
        assert_eq!(member.kind(), None);

        let member = MemberBuilder::<Particle>::new("mass", ShaderType::FLOAT).build();
        assert_eq!(member.kind(), None);
    }

    #[test]
    fn test_value_shapes() {
        let float3 = ShaderType::Vector(ScalarKind::Float, 3);
        assert!(HostValue::float_vector(&[1.0, 2.0, 3.0]).matches(&float3));
        assert!(!HostValue::float_vector(&[1.0, 2.0]).matches(&float3));
        assert!(!HostValue::UInt(1).matches(&ShaderType::FLOAT));

        let float2x2 = ShaderType::Matrix(ScalarKind::Float, 2, 2);
        assert!(HostValue::float_matrix(2, 2, &[1.0, 0.0, 0.0, 1.0]).matches(&float2x2));

        let buffer = ShaderType::read_only_buffer(ShaderType::FLOAT);
        assert!(HostValue::Resource(ResourceHandle(7)).matches(&buffer));
    }
}
