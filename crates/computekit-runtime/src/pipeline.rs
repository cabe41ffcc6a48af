//! Pipeline object cache.
//!
//! One native compute pipeline per [`KernelId`]. Bytecode comes from the disk
//! cache when present, otherwise from the device's shader compiler. Disk
//! bytecode the device refuses is evicted and the kernel is recompiled. Concurrent
//! first use of the same kernel may compile more than once, but only one
//! pipeline is published and every caller receives that one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use computekit_codegen::{CompileError, KernelDefinition, KernelId};
use parking_lot::RwLock;

use crate::error::{NativeError, NativeResult, Result, RuntimeError};
use crate::native::NativeDevice;
use crate::shader_cache::ShaderBytecodeCache;

/// A native compute pipeline built from one kernel definition.
pub struct Pipeline<D: NativeDevice> {
    id: KernelId,
    entry_point: String,
    native: D::Pipeline,
    from_disk: bool,
}

impl<D: NativeDevice> Pipeline<D> {
    /// Kernel identity.
    pub fn id(&self) -> &KernelId {
        &self.id
    }

    /// Entry point.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Native pipeline object.
    pub fn native(&self) -> &D::Pipeline {
        &self.native
    }

    /// Whether the bytecode was loaded from the disk cache.
    pub fn from_disk(&self) -> bool {
        self.from_disk
    }
}

impl<D: NativeDevice> fmt::Debug for Pipeline<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id.short())
            .field("entry_point", &self.entry_point)
            .field("from_disk", &self.from_disk)
            .finish()
    }
}

/// Pipeline cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    /// Live pipelines.
    pub entries: usize,
    /// Lookups served from memory.
    pub hits: u64,
    /// Shader compilations.
    pub compiles: u64,
    /// Bytecode loads from the disk cache.
    pub disk_hits: u64,
    /// Disk entries discarded, by the header checks or by the device.
    pub disk_rejects: u64,
    /// Shader compilations rejected by the compiler.
    pub failures: u64,
}

impl fmt::Display for PipelineCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipelineCache: {} entries, {} hits, {} compiles, {} disk hits, {} disk rejects, {} failures",
            self.entries,
            self.hits,
            self.compiles,
            self.disk_hits,
            self.disk_rejects,
            self.failures
        )
    }
}

/// Kernel-id keyed cache of native pipelines.
pub struct PipelineCache<D: NativeDevice> {
    device: Arc<D>,
    profile: String,
    bytecode: ShaderBytecodeCache,
    entries: RwLock<HashMap<KernelId, Arc<Pipeline<D>>>>,
    lost: RwLock<Option<String>>,
    hits: AtomicU64,
    compiles: AtomicU64,
    disk_hits: AtomicU64,
    disk_rejects: AtomicU64,
    failures: AtomicU64,
}

impl<D: NativeDevice> PipelineCache<D> {
    /// Create a cache compiling with `profile`.
    pub fn new(device: Arc<D>, profile: impl Into<String>, bytecode: ShaderBytecodeCache) -> Self {
        Self {
            device,
            profile: profile.into(),
            bytecode,
            entries: RwLock::new(HashMap::new()),
            lost: RwLock::new(None),
            hits: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            disk_rejects: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Get the pipeline for a kernel, building it on first use.
    pub fn get_or_create(&self, definition: &KernelDefinition) -> Result<Arc<Pipeline<D>>> {
        self.check_lost()?;

        if let Some(existing) = self.entries.read().get(&definition.id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kernel = %definition.id.short(), "pipeline cache hit");
            return Ok(Arc::clone(existing));
        }

        let (native, from_disk) = match self.load(definition) {
            Some(bytecode) => match self.create(definition, &bytecode) {
                Ok(native) => (native, true),
                Err(err @ NativeError::DeviceRemoved(_)) => return Err(self.native_failure(err)),
                Err(err) => {
                    // The device refused bytecode that passed the header checks.
                    self.disk_rejects.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        kernel = %definition.id.short(),
                        error = %err,
                        "cached bytecode rejected by device, recompiling"
                    );
                    if let Err(err) = self.bytecode.evict(&definition.id) {
                        tracing::warn!(kernel = %definition.id.short(), error = %err, "failed to evict bytecode");
                    }
                    (self.compile_and_create(definition)?, false)
                }
            },
            None => (self.compile_and_create(definition)?, false),
        };
        let built = Arc::new(Pipeline {
            id: definition.id.clone(),
            entry_point: definition.entry_point.clone(),
            native,
            from_disk,
        });

        let mut entries = self.entries.write();
        // Loss may have been signaled while compiling; never publish into a dead cache.
        if let Some(reason) = self.lost.read().clone() {
            return Err(RuntimeError::DeviceLost(reason));
        }
        let published = entries
            .entry(definition.id.clone())
            .or_insert_with(|| built);
        tracing::debug!(
            kernel = %definition.id.short(),
            name = %definition.name,
            from_disk,
            "pipeline created"
        );
        Ok(Arc::clone(published))
    }

    fn load(&self, definition: &KernelDefinition) -> Option<Vec<u8>> {
        match self.bytecode.load(definition, &self.profile) {
            Ok(Some(bytecode)) => {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                Some(bytecode)
            }
            Ok(None) => None,
            Err(err) if err.is_rejected_entry() => {
                self.disk_rejects.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kernel = %definition.id.short(), error = %err, "cached bytecode discarded");
                None
            }
            Err(err) => {
                tracing::warn!(kernel = %definition.id.short(), error = %err, "bytecode cache read failed");
                None
            }
        }
    }

    fn create(&self, definition: &KernelDefinition, bytecode: &[u8]) -> NativeResult<D::Pipeline> {
        self.device
            .create_pipeline(bytecode, &definition.entry_point, &definition.layout)
    }

    fn compile_and_create(&self, definition: &KernelDefinition) -> Result<D::Pipeline> {
        let bytecode = self
            .device
            .compile_shader(&definition.source, &definition.entry_point, &self.profile)
            .map_err(|err| match err {
                NativeError::CompilationFailed(message) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        kernel = %definition.id.short(),
                        name = %definition.name,
                        message = %message,
                        "shader compiler rejected kernel"
                    );
                    RuntimeError::Compile(CompileError::ShaderCompiler {
                        kernel: definition.id.to_string(),
                        message,
                    })
                }
                other => self.native_failure(other),
            })?;
        self.compiles.fetch_add(1, Ordering::Relaxed);

        let native = self
            .create(definition, &bytecode)
            .map_err(|err| self.native_failure(err))?;
        if let Err(err) = self.bytecode.store(definition, &self.profile, &bytecode) {
            tracing::warn!(kernel = %definition.id.short(), error = %err, "failed to cache bytecode");
        }
        Ok(native)
    }

    fn native_failure(&self, err: NativeError) -> RuntimeError {
        let err = RuntimeError::from(err);
        if let RuntimeError::DeviceLost(reason) = &err {
            self.invalidate(reason);
        }
        err
    }

    fn check_lost(&self) -> Result<()> {
        if let Some(reason) = self.lost.read().clone() {
            return Err(RuntimeError::DeviceLost(reason));
        }
        if let Some(reason) = self.device.removed_reason() {
            self.invalidate(&reason);
            return Err(RuntimeError::DeviceLost(reason));
        }
        Ok(())
    }

    /// Drop every pipeline and refuse further lookups.
    pub fn invalidate(&self, reason: &str) {
        let mut lost = self.lost.write();
        if lost.is_none() {
            *lost = Some(reason.to_string());
        }
        drop(lost);

        let dropped = {
            let mut entries = self.entries.write();
            let count = entries.len();
            entries.clear();
            count
        };
        tracing::info!(dropped, reason, "pipeline cache invalidated");
    }

    /// Whether the cache was invalidated by device loss.
    pub fn is_lost(&self) -> bool {
        self.lost.read().is_some()
    }

    /// Drop every pipeline.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of live pipelines.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no pipeline is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> PipelineCacheStats {
        PipelineCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            disk_rejects: self.disk_rejects.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl<D: NativeDevice> fmt::Debug for PipelineCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("profile", &self.profile)
            .field("lost", &*self.lost.read())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use computekit_codegen::{
        compile_kernel, CapturedMember, KernelSource, ResourceHandle, ShaderType,
    };
    use std::thread;
    use tempfile::TempDir;

    struct Host;

    fn definition(body: &str) -> KernelDefinition {
        let source = KernelSource::parse("double", body)
            .unwrap()
            .with_capture(CapturedMember::static_field::<Host, _>(
                "data",
                ShaderType::read_write_buffer(ShaderType::FLOAT),
                || ResourceHandle(1).into(),
            ));
        compile_kernel(&source).unwrap()
    }

    fn doubling() -> KernelDefinition {
        definition("|id| { data[id.x] = data[id.x] * 2.0; }")
    }

    fn cache(device: &HeadlessDevice) -> PipelineCache<HeadlessDevice> {
        PipelineCache::new(
            Arc::new(device.clone()),
            "cs_6_0",
            ShaderBytecodeCache::disabled(),
        )
    }

    #[test]
    fn test_one_compile_per_kernel() {
        let device = HeadlessDevice::new();
        let cache = cache(&device);
        let kernel = doubling();

        let first = cache.get_or_create(&kernel).unwrap();
        let second = cache.get_or_create(&kernel).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.entry_point(), "CSMain");
        assert_eq!(device.compile_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.compiles, 1);
    }

    #[test]
    fn test_distinct_kernels_get_distinct_pipelines() {
        let device = HeadlessDevice::new();
        let cache = cache(&device);

        let a = cache.get_or_create(&doubling()).unwrap();
        let b = cache
            .get_or_create(&definition("|id| { data[id.x] = data[id.x] + 1.0; }"))
            .unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_first_use_publishes_one_pipeline() {
        let device = HeadlessDevice::new();
        let cache = cache(&device);
        let kernel = doubling();

        let pipelines: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| cache.get_or_create(&kernel).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for pipeline in &pipelines[1..] {
            assert!(Arc::ptr_eq(&pipelines[0], pipeline));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_compiler_rejection_leaves_no_entry() {
        let device = HeadlessDevice::new();
        device.reject_sources_containing("* 2.0");
        let cache = cache(&device);
        let kernel = doubling();

        let err = cache.get_or_create(&kernel).unwrap_err();
        match err {
            RuntimeError::Compile(CompileError::ShaderCompiler { kernel: id, message }) => {
                assert_eq!(id, kernel.id.to_string());
                assert!(message.contains("* 2.0"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(cache.is_empty());
        assert_eq!(cache.stats().failures, 1);

        // No negative caching: the next request compiles again.
        assert!(cache.get_or_create(&kernel).is_err());
        assert_eq!(cache.stats().failures, 2);
    }

    #[test]
    fn test_device_loss_clears_and_refuses() {
        let device = HeadlessDevice::new();
        let cache = cache(&device);
        let kernel = doubling();
        cache.get_or_create(&kernel).unwrap();

        device.remove("hung");
        let err = cache.get_or_create(&kernel).unwrap_err();
        assert_eq!(err, RuntimeError::DeviceLost("hung".to_string()));
        assert!(cache.is_empty());
        assert!(cache.is_lost());
    }

    #[test]
    fn test_invalidate_refuses_cached_pipeline() {
        let device = HeadlessDevice::new();
        let cache = cache(&device);
        let kernel = doubling();
        cache.get_or_create(&kernel).unwrap();

        cache.invalidate("reset requested");
        assert!(cache
            .get_or_create(&kernel)
            .unwrap_err()
            .is_device_lost());
    }

    #[test]
    fn test_bytecode_loaded_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let kernel = doubling();

        let device = HeadlessDevice::new();
        let first = PipelineCache::new(
            Arc::new(device.clone()),
            "cs_6_0",
            ShaderBytecodeCache::with_dir(temp_dir.path()).unwrap(),
        );
        assert!(!first.get_or_create(&kernel).unwrap().from_disk());
        assert_eq!(device.compile_count(), 1);

        let second = PipelineCache::new(
            Arc::new(device.clone()),
            "cs_6_0",
            ShaderBytecodeCache::with_dir(temp_dir.path()).unwrap(),
        );
        let pipeline = second.get_or_create(&kernel).unwrap();
        assert!(pipeline.from_disk());
        assert_eq!(device.compile_count(), 1);
        assert_eq!(second.stats().disk_hits, 1);
        assert_eq!(second.stats().compiles, 0);
    }

    #[test]
    fn test_bytecode_refused_by_device_is_recompiled() {
        let temp_dir = TempDir::new().unwrap();
        let kernel = doubling();
        let disk = ShaderBytecodeCache::with_dir(temp_dir.path()).unwrap();
        // Intact entry whose payload the device cannot build a pipeline from.
        disk.store(&kernel, "cs_6_0", b"not shader bytecode").unwrap();

        let device = HeadlessDevice::new();
        let cache = PipelineCache::new(Arc::new(device.clone()), "cs_6_0", disk);
        let pipeline = cache.get_or_create(&kernel).unwrap();

        assert!(!pipeline.from_disk());
        assert_eq!(device.compile_count(), 1);
        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.disk_rejects, 1);
        assert_eq!(stats.compiles, 1);

        let reopened = ShaderBytecodeCache::with_dir(temp_dir.path()).unwrap();
        let rewritten = reopened.load(&kernel, "cs_6_0").unwrap().unwrap();
        assert!(rewritten.starts_with(b"DXBC"));
    }

    #[test]
    fn test_corrupted_entry_is_recompiled() {
        let temp_dir = TempDir::new().unwrap();
        let kernel = doubling();
        let disk = ShaderBytecodeCache::with_dir(temp_dir.path()).unwrap();
        let path = disk.entry_path(&kernel.id, "cs_6_0").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"CKSB").unwrap();

        let device = HeadlessDevice::new();
        let cache = PipelineCache::new(Arc::new(device.clone()), "cs_6_0", disk);
        assert!(!cache.get_or_create(&kernel).unwrap().from_disk());
        assert_eq!(cache.stats().disk_rejects, 1);
        assert_eq!(cache.stats().disk_hits, 0);
        assert!(path.exists());
    }
}
