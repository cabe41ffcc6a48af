//! Kernel sources, compiled kernel definitions and the kernel definition cache.
//!
//! A [`KernelSource`] is what a caller hands over: a closure body plus the
//! members it captures. Compiling it plans the layout and emits HLSL into a
//! [`KernelDefinition`]. The [`KernelCache`] keeps one definition per kernel
//! shape (body tokens, capture names and types, thread group size), so
//! repeated dispatches of the same kernel never re-run emission.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use quote::ToTokens;
use sha2::{Digest, Sha256};

use crate::capture::{CaptureDecl, CapturedMember};
use crate::emitter::{emit, KernelBody};
use crate::layout::{plan_layout, BufferLayout};
use crate::validation::ValidationError;
use crate::{parse_kernel, CompileError, Result};

/// Maximum threads along x or y of one thread group.
const MAX_GROUP_XY: u32 = 1024;
/// Maximum threads along z of one thread group.
const MAX_GROUP_Z: u32 = 64;
/// Maximum threads in one thread group.
const MAX_GROUP_THREADS: u64 = 1024;

/// `[numthreads(x, y, z)]` of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadGroupSize {
    /// Threads along x.
    pub x: u32,
    /// Threads along y.
    pub y: u32,
    /// Threads along z.
    pub z: u32,
}

impl ThreadGroupSize {
    /// Create a thread group size.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// A one-dimensional group of `x` threads.
    pub const fn linear(x: u32) -> Self {
        Self::new(x, 1, 1)
    }

    /// Threads per group.
    #[must_use]
    pub fn total(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    /// Check the size against Direct3D 12 compute limits.
    pub fn validate(&self) -> Result<()> {
        let within_axes = (1..=MAX_GROUP_XY).contains(&self.x)
            && (1..=MAX_GROUP_XY).contains(&self.y)
            && (1..=MAX_GROUP_Z).contains(&self.z);
        if !within_axes || self.total() > MAX_GROUP_THREADS {
            return Err(CompileError::Validation(ValidationError::InvalidSignature(
                format!(
                    "thread group {self} exceeds compute limits \
                     ({MAX_GROUP_XY}x{MAX_GROUP_XY}x{MAX_GROUP_Z}, {MAX_GROUP_THREADS} threads)"
                ),
            )));
        }
        Ok(())
    }
}

impl Default for ThreadGroupSize {
    fn default() -> Self {
        Self::linear(64)
    }
}

impl fmt::Display for ThreadGroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A kernel as written by the caller.
#[derive(Clone)]
pub struct KernelSource {
    name: String,
    body: KernelBody,
    captures: Vec<CapturedMember>,
    thread_group: ThreadGroupSize,
}

impl KernelSource {
    /// Create a kernel from a parsed closure.
    pub fn new(name: impl Into<String>, body: KernelBody) -> Self {
        Self {
            name: name.into(),
            body,
            captures: Vec::new(),
            thread_group: ThreadGroupSize::default(),
        }
    }

    /// Parse a kernel closure from source text.
    pub fn parse(name: impl Into<String>, body: &str) -> Result<Self> {
        Ok(Self::new(name, parse_kernel(body)?))
    }

    /// Add a capture. Declaration order is layout order.
    pub fn with_capture(mut self, member: CapturedMember) -> Self {
        self.captures.push(member);
        self
    }

    /// Add several captures.
    pub fn with_captures(mut self, members: impl IntoIterator<Item = CapturedMember>) -> Self {
        self.captures.extend(members);
        self
    }

    /// Set the thread group size.
    pub fn with_thread_group(mut self, thread_group: ThreadGroupSize) -> Self {
        self.thread_group = thread_group;
        self
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Closure body.
    #[must_use]
    pub fn body(&self) -> &KernelBody {
        &self.body
    }

    /// Captured members in declaration order.
    #[must_use]
    pub fn captures(&self) -> &[CapturedMember] {
        &self.captures
    }

    /// Thread group size.
    #[must_use]
    pub fn thread_group(&self) -> ThreadGroupSize {
        self.thread_group
    }

    /// Layout declarations of the captures.
    pub fn decls(&self) -> Vec<CaptureDecl> {
        self.captures.iter().map(CapturedMember::decl).collect()
    }

    /// Hash of everything that influences compilation.
    ///
    /// The diagnostic name and the capture owners do not take part: two
    /// kernels with the same body over same-shaped captures share a definition.
    pub fn shape_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body.to_token_stream().to_string().as_bytes());
        for decl in self.decls() {
            hasher.update(format!("\n{}:{:?}", decl.name, decl.ty).as_bytes());
        }
        hasher.update(format!("\n{}", self.thread_group).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSource")
            .field("name", &self.name)
            .field("body", &self.body.to_token_stream().to_string())
            .field("captures", &self.captures)
            .field("thread_group", &self.thread_group)
            .finish()
    }
}

/// Identity of a compiled kernel.
///
/// SHA-256 over the entry point, the canonical layout description and the
/// emitted source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(String);

impl KernelId {
    /// Compute the identity of a kernel.
    pub fn compute(entry_point: &str, layout_description: &str, source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entry_point.as_bytes());
        hasher.update([0]);
        hasher.update(layout_description.as_bytes());
        hasher.update([0]);
        hasher.update(source.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A compiled kernel: emitted HLSL plus the layout it binds against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDefinition {
    /// Kernel identity.
    pub id: KernelId,
    /// Name of the source that first produced this definition.
    pub name: String,
    /// Entry point function.
    pub entry_point: String,
    /// `[numthreads]` dimensions.
    pub thread_group: ThreadGroupSize,
    /// Capture layout.
    pub layout: BufferLayout,
    /// Emitted HLSL.
    pub source: String,
}

/// Compile a kernel source into a definition.
///
/// Every error is tagged with the kernel name (see [`CompileError::in_kernel`]).
pub fn compile_kernel(source: &KernelSource) -> Result<KernelDefinition> {
    compile_untagged(source).map_err(|err| err.in_kernel(&source.name))
}

fn compile_untagged(source: &KernelSource) -> Result<KernelDefinition> {
    source.thread_group.validate()?;
    let layout = plan_layout(&source.decls())?;
    let emitted = emit(&source.body, &layout, source.thread_group)?;
    let id = KernelId::compute(&emitted.entry_point, &layout.describe(), &emitted.source);

    tracing::debug!(
        kernel = %source.name,
        id = %id.short(),
        constant_bytes = layout.constant_size(),
        "kernel emitted"
    );

    Ok(KernelDefinition {
        id,
        name: source.name.clone(),
        entry_point: emitted.entry_point,
        thread_group: source.thread_group,
        layout,
        source: emitted.source,
    })
}

/// Kernel cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCacheStats {
    /// Cached definitions.
    pub entries: usize,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Successful compilations.
    pub compiles: u64,
    /// Failed compilations.
    pub failures: u64,
}

impl fmt::Display for KernelCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KernelCache: {} entries, {} hits, {} compiles, {} failures",
            self.entries, self.hits, self.compiles, self.failures
        )
    }
}

/// Shape-keyed cache of kernel definitions.
///
/// Failed compilations are never cached; the next request compiles again.
#[derive(Default)]
pub struct KernelCache {
    entries: RwLock<HashMap<String, Arc<KernelDefinition>>>,
    hits: AtomicU64,
    compiles: AtomicU64,
    failures: AtomicU64,
}

impl KernelCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the definition for a kernel, compiling it on first use.
    pub fn get_or_compile(&self, source: &KernelSource) -> Result<Arc<KernelDefinition>> {
        let key = source.shape_key();
        if let Some(existing) = self.entries.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(kernel = %source.name(), id = %existing.id.short(), "kernel cache hit");
            return Ok(Arc::clone(existing));
        }

        let compiled = match compile_kernel(source) {
            Ok(definition) => Arc::new(definition),
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(kernel = %source.name(), error = %err, "kernel compilation failed");
                return Err(err);
            }
        };
        self.compiles.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.write();
        let published = entries.entry(key).or_insert_with(|| compiled);
        Ok(Arc::clone(published))
    }

    /// Number of cached definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every cached definition.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> KernelCacheStats {
        KernelCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{HostValue, ResourceHandle};
    use crate::types::ShaderType;
    use std::thread;

    struct Scaler {
        scale: f32,
    }

    fn scale_kernel(name: &str) -> KernelSource {
        KernelSource::parse(name, "|id| { data[id.x] = data[id.x] * scale; }")
            .unwrap()
            .with_capture(CapturedMember::field::<Scaler, _>(
                "scale",
                ShaderType::FLOAT,
                |s| HostValue::Float(s.scale),
            ))
            .with_capture(CapturedMember::static_field::<Scaler, _>(
                "data",
                ShaderType::read_write_buffer(ShaderType::FLOAT),
                || ResourceHandle(7).into(),
            ))
    }

    #[test]
    fn test_thread_group_limits() {
        assert_eq!(ThreadGroupSize::default(), ThreadGroupSize::new(64, 1, 1));
        assert!(ThreadGroupSize::new(8, 8, 16).validate().is_ok());
        assert!(ThreadGroupSize::new(0, 1, 1).validate().is_err());
        assert!(ThreadGroupSize::new(1, 1, 65).validate().is_err());
        assert!(ThreadGroupSize::new(64, 32, 1).validate().is_err());
    }

    #[test]
    fn test_compile_kernel() {
        let definition = compile_kernel(&scale_kernel("scale")).unwrap();

        assert_eq!(definition.entry_point, "CSMain");
        assert_eq!(definition.layout.constant_size(), 16);
        assert_eq!(definition.id.as_str().len(), 64);
        assert!(definition.source.contains("float scale : packoffset(c0.x);"));
        assert_eq!(definition.source.matches(" : register(").count(), 2);
    }

    #[test]
    fn test_shape_key_ignores_name_but_not_shape() {
        let a = scale_kernel("first");
        let b = scale_kernel("second");
        assert_eq!(a.shape_key(), b.shape_key());

        let c = scale_kernel("third").with_thread_group(ThreadGroupSize::linear(128));
        assert_ne!(a.shape_key(), c.shape_key());

        let d = scale_kernel("fourth").with_capture(CapturedMember::static_field::<Scaler, _>(
            "bias",
            ShaderType::FLOAT,
            || HostValue::Float(0.5),
        ));
        assert_ne!(a.shape_key(), d.shape_key());
    }

    #[test]
    fn test_kernel_id_is_deterministic() {
        let a = compile_kernel(&scale_kernel("a")).unwrap();
        let b = compile_kernel(&scale_kernel("b")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.source, b.source);
        assert_eq!(a.id.short().len(), 12);
    }

    #[test]
    fn test_cache_hits() {
        let cache = KernelCache::new();
        let first = cache.get_or_compile(&scale_kernel("a")).unwrap();
        let second = cache.get_or_compile(&scale_kernel("b")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.compiles, 1);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = KernelCache::new();
        let broken = KernelSource::parse("broken", "|id| { 'a: loop { break 'a; } }").unwrap();

        assert!(cache.get_or_compile(&broken).is_err());
        assert!(cache.get_or_compile(&broken).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().failures, 2);
    }

    #[test]
    fn test_errors_name_their_kernel() {
        let read_only = KernelSource::parse("write_scale", "|id| { scale = 2.0; }")
            .unwrap()
            .with_captures(scale_kernel("scale").captures().iter().cloned());
        let err = compile_kernel(&read_only).unwrap_err();
        assert_eq!(err.kernel(), Some("write_scale"));
        assert!(matches!(err.root(), CompileError::ReadOnlyCapture(name) if name == "scale"));

        let bad_vector = KernelSource::parse("wide", "|id| { }")
            .unwrap()
            .with_capture(CapturedMember::static_field::<Scaler, _>(
                "v",
                ShaderType::Vector(crate::types::ScalarKind::Float, 7),
                || HostValue::float_vector(&[0.0; 7]),
            ));
        let err = compile_kernel(&bad_vector).unwrap_err();
        assert_eq!(err.kernel(), Some("wide"));
        assert!(matches!(err.root(), CompileError::UnsupportedCapture { .. }));

        let cache = KernelCache::new();
        let err = cache.get_or_compile(&bad_vector).unwrap_err();
        assert!(err.to_string().starts_with("Kernel `wide`: "));
    }

    #[test]
    fn test_concurrent_first_use_publishes_one_definition() {
        let cache = KernelCache::new();
        let results: Vec<Arc<KernelDefinition>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let cache = &cache;
                    s.spawn(move || cache.get_or_compile(&scale_kernel(&format!("k{i}"))).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(cache.len(), 1);
        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
    }

    #[test]
    fn test_cache_clear() {
        let cache = KernelCache::new();
        cache.get_or_compile(&scale_kernel("a")).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
