//! Long-lived compute context.
//!
//! A [`ComputeContext`] owns every cache and the command list machinery for one
//! device. Kernels are compiled once per shape, pipelines are built once per
//! kernel identity, and each dispatch runs
//! `acquire -> record -> close -> submit -> reclaim` against the pool.
//!
//! Device loss is sticky: once observed (from any native call, or signaled
//! through [`ComputeContext::notify_device_lost`]) the pipeline cache and the
//! pool are invalidated and every later device operation fails with
//! [`RuntimeError::DeviceLost`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use computekit_codegen::{
    Accessor, AccessorCache, AccessorCacheStats, BufferLayout, HostValue, KernelCache,
    KernelCacheStats, KernelDefinition, KernelId, KernelSource, ThreadGroupSize,
};
use parking_lot::RwLock;

use crate::command_list::CompiledCommandList;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::fence::{CompletionToken, FenceTracker};
use crate::native::NativeDevice;
use crate::pipeline::{Pipeline, PipelineCache, PipelineCacheStats};
use crate::pool::{CommandListPool, PoolStats};
use crate::shader_cache::ShaderBytecodeCache;

/// Number of threads to launch along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchSize {
    /// Threads along x.
    pub x: u32,
    /// Threads along y.
    pub y: u32,
    /// Threads along z.
    pub z: u32,
}

impl DispatchSize {
    /// Create a dispatch size.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// A one-dimensional dispatch.
    pub const fn linear(x: u32) -> Self {
        Self::new(x, 1, 1)
    }

    /// Thread groups needed to cover this size, rounding up per axis.
    pub fn groups(&self, thread_group: ThreadGroupSize) -> Result<(u32, u32, u32)> {
        if self.x == 0 || self.y == 0 || self.z == 0 {
            return Err(RuntimeError::InvalidDispatch(format!(
                "dispatch size ({}, {}, {}) has an empty axis",
                self.x, self.y, self.z
            )));
        }
        Ok((
            self.x.div_ceil(thread_group.x),
            self.y.div_ceil(thread_group.y),
            self.z.div_ceil(thread_group.z),
        ))
    }
}

impl From<u32> for DispatchSize {
    fn from(x: u32) -> Self {
        Self::linear(x)
    }
}

/// A kernel ready to dispatch: definition, pipeline and capture accessors.
pub struct CompiledKernel<D: NativeDevice> {
    definition: Arc<KernelDefinition>,
    pipeline: Arc<Pipeline<D>>,
    accessors: Vec<Arc<Accessor>>,
}

impl<D: NativeDevice> CompiledKernel<D> {
    /// Kernel identity.
    pub fn id(&self) -> &KernelId {
        &self.definition.id
    }

    /// Kernel name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Compiled definition.
    pub fn definition(&self) -> &Arc<KernelDefinition> {
        &self.definition
    }

    /// Native pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline<D>> {
        &self.pipeline
    }

    /// Accessors, one per capture in declaration order.
    pub fn accessors(&self) -> &[Arc<Accessor>] {
        &self.accessors
    }

    /// Buffer layout.
    pub fn layout(&self) -> &BufferLayout {
        &self.definition.layout
    }

    /// Emitted HLSL.
    pub fn source(&self) -> &str {
        &self.definition.source
    }

    /// Thread group size.
    pub fn thread_group(&self) -> ThreadGroupSize {
        self.definition.thread_group
    }

    /// Read every capture's current value.
    pub fn read_values(&self, instance: Option<&dyn Any>) -> Result<Vec<HostValue>> {
        self.accessors
            .iter()
            .map(|accessor| accessor.read(instance).map_err(RuntimeError::from))
            .collect()
    }
}

impl<D: NativeDevice> Clone for CompiledKernel<D> {
    fn clone(&self) -> Self {
        Self {
            definition: Arc::clone(&self.definition),
            pipeline: Arc::clone(&self.pipeline),
            accessors: self.accessors.clone(),
        }
    }
}

impl<D: NativeDevice> fmt::Debug for CompiledKernel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("id", &self.definition.id.short())
            .field("name", &self.definition.name)
            .field("thread_group", &self.definition.thread_group)
            .field("captures", &self.accessors.len())
            .finish()
    }
}

/// Snapshot of every cache and the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    /// Accessor cache.
    pub accessors: AccessorCacheStats,
    /// Kernel definition cache.
    pub kernels: KernelCacheStats,
    /// Pipeline cache.
    pub pipelines: PipelineCacheStats,
    /// Command list pool.
    pub pool: PoolStats,
    /// Last completion token issued.
    pub last_issued: u64,
    /// Last completion token known complete.
    pub last_completed: u64,
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.accessors)?;
        writeln!(f, "{}", self.kernels)?;
        writeln!(f, "{}", self.pipelines)?;
        writeln!(f, "{}", self.pool)?;
        write!(
            f,
            "Fence: issued {}, completed {}",
            self.last_issued, self.last_completed
        )
    }
}

/// Owner of every cache, the pool and the fence for one device.
pub struct ComputeContext<D: NativeDevice> {
    config: RuntimeConfig,
    device: Arc<D>,
    queue: Arc<D::Queue>,
    accessors: AccessorCache,
    kernels: KernelCache,
    pipelines: PipelineCache<D>,
    tracker: Arc<FenceTracker>,
    pool: CommandListPool<D>,
    lost: RwLock<Option<String>>,
}

impl<D: NativeDevice> ComputeContext<D> {
    /// Create a context driving `device`.
    pub fn new(device: D, config: RuntimeConfig) -> Result<Self> {
        let device = Arc::new(device);
        let queue = Arc::new(device.create_queue()?);
        let tracker = Arc::new(FenceTracker::new(config.fence_timeout));

        let bytecode = if config.bytecode_cache {
            let cache = match &config.bytecode_cache_dir {
                Some(dir) => ShaderBytecodeCache::with_dir(dir),
                None => ShaderBytecodeCache::new(),
            };
            cache.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "bytecode cache unavailable, continuing without it");
                ShaderBytecodeCache::disabled()
            })
        } else {
            ShaderBytecodeCache::disabled()
        };
        let disk_cache = bytecode.is_enabled();

        let pipelines = PipelineCache::new(
            Arc::clone(&device),
            config.shader_profile.clone(),
            bytecode,
        );
        let pool = CommandListPool::new(
            Arc::clone(&device),
            Arc::clone(&queue),
            Arc::clone(&tracker),
            config.max_in_flight,
            config.acquire_timeout,
        );

        tracing::info!(
            device = %device.name(),
            max_in_flight = config.max_in_flight,
            profile = %config.shader_profile,
            disk_cache,
            "compute context created"
        );

        Ok(Self {
            config,
            device,
            queue,
            accessors: AccessorCache::new(),
            kernels: KernelCache::new(),
            pipelines,
            tracker,
            pool,
            lost: RwLock::new(None),
        })
    }

    /// Configuration the context was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The queue.
    pub fn queue(&self) -> &D::Queue {
        &self.queue
    }

    /// Accessor cache.
    pub fn accessor_cache(&self) -> &AccessorCache {
        &self.accessors
    }

    /// Kernel definition cache.
    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernels
    }

    /// Pipeline cache.
    pub fn pipeline_cache(&self) -> &PipelineCache<D> {
        &self.pipelines
    }

    /// Command list pool.
    pub fn pool(&self) -> &CommandListPool<D> {
        &self.pool
    }

    /// Fence tracker.
    pub fn tracker(&self) -> &FenceTracker {
        &self.tracker
    }

    /// Compile a kernel, resolve its accessors and build its pipeline.
    pub fn compile(&self, source: &KernelSource) -> Result<CompiledKernel<D>> {
        self.check_lost()?;

        let definition = self.kernels.get_or_compile(source)?;
        let accessors = source
            .captures()
            .iter()
            .map(|member| self.accessors.get_accessor(member))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let pipeline = self.observe(self.pipelines.get_or_create(&definition))?;

        tracing::debug!(
            kernel = %definition.id.short(),
            name = %definition.name,
            captures = accessors.len(),
            "kernel ready"
        );
        Ok(CompiledKernel {
            definition,
            pipeline,
            accessors,
        })
    }

    /// Record one dispatch of `kernel` into an open list.
    ///
    /// Capture values are read now, so the dispatch sees the instance as it is
    /// at record time.
    pub fn record_dispatch(
        &self,
        list: &mut CompiledCommandList<D>,
        kernel: &CompiledKernel<D>,
        instance: Option<&dyn Any>,
        size: DispatchSize,
    ) -> Result<()> {
        let (x, y, z) = size.groups(kernel.thread_group())?;
        let values = kernel.read_values(instance)?;
        let layout = kernel.layout();
        let constants = layout.pack_constants(&values)?;
        let bindings = layout.resource_bindings(&values)?;

        list.set_pipeline(&self.device, &kernel.pipeline)?;
        if layout.has_constants() {
            list.set_constants(&self.device, &constants)?;
        }
        for (field, handle) in bindings {
            list.bind_resource(&self.device, field.slot, field.access, handle)?;
        }
        list.dispatch(&self.device, x, y, z)
    }

    /// Record, submit and reclaim a single dispatch.
    pub fn dispatch(
        &self,
        kernel: &CompiledKernel<D>,
        instance: Option<&dyn Any>,
        size: impl Into<DispatchSize>,
    ) -> Result<CompletionToken> {
        let size = size.into();
        size.groups(kernel.thread_group())?;

        let mut list = self.acquire()?;
        let recorded = self
            .record_dispatch(&mut list, kernel, instance, size)
            .and_then(|()| list.close(&self.device));
        if let Err(err) = recorded {
            self.release_after_failure(list);
            return Err(self.observe_err(err));
        }

        let token = match self.submit(&mut list) {
            Ok(token) => token,
            Err(err) => {
                self.release_after_failure(list);
                return Err(err);
            }
        };
        self.reclaim(list, token)?;

        tracing::trace!(
            kernel = %kernel.id().short(),
            token = token.value(),
            "dispatch submitted"
        );
        Ok(token)
    }

    fn release_after_failure(&self, list: CompiledCommandList<D>) {
        if let Err(err) = self.pool.release(list) {
            tracing::debug!(error = %err, "could not return command list after failure");
        }
    }

    /// Take a reset command list from the pool.
    pub fn acquire(&self) -> Result<CompiledCommandList<D>> {
        self.check_lost()?;
        self.observe(self.pool.acquire())
    }

    /// Submit a closed list and return its completion token.
    pub fn submit(&self, list: &mut CompiledCommandList<D>) -> Result<CompletionToken> {
        self.check_lost()?;
        self.observe(self.pool.submit(list))
    }

    /// Return a submitted list to the pool.
    pub fn reclaim(&self, list: CompiledCommandList<D>, token: CompletionToken) -> Result<()> {
        self.observe(self.pool.reclaim(list, token))
    }

    /// Return an unsubmitted list to the pool.
    pub fn release(&self, list: CompiledCommandList<D>) -> Result<()> {
        self.observe(self.pool.release(list))
    }

    /// Reset a list in place. Fails while its last submission is pending.
    pub fn reset(&self, list: &mut CompiledCommandList<D>) -> Result<()> {
        self.check_lost()?;
        self.observe(list.reset(&self.device, &self.tracker, &self.queue))
    }

    /// Whether the GPU has reached a token.
    pub fn is_complete(&self, token: CompletionToken) -> Result<bool> {
        self.observe(self.tracker.is_complete(&*self.queue, token))
    }

    /// Block until the GPU reaches a token.
    pub fn wait(&self, token: CompletionToken) -> Result<()> {
        self.observe(self.tracker.wait(&*self.queue, token))
    }

    /// Block until every submission completed.
    pub fn wait_idle(&self) -> Result<()> {
        self.observe(self.tracker.wait_idle(&*self.queue))
    }

    /// Mark the device lost and drop every native object.
    ///
    /// Kernel definitions and accessors are device independent and survive.
    pub fn notify_device_lost(&self, reason: &str) {
        {
            let mut lost = self.lost.write();
            if lost.is_some() {
                return;
            }
            *lost = Some(reason.to_string());
        }
        tracing::info!(device = %self.device.name(), reason, "device lost");
        self.pipelines.invalidate(reason);
        self.pool.invalidate(reason);
    }

    /// Whether device loss was observed.
    pub fn is_device_lost(&self) -> bool {
        self.lost.read().is_some()
    }

    fn check_lost(&self) -> Result<()> {
        match &*self.lost.read() {
            Some(reason) => Err(RuntimeError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.observe_err(err))
    }

    fn observe_err(&self, err: RuntimeError) -> RuntimeError {
        if let RuntimeError::DeviceLost(reason) = &err {
            self.notify_device_lost(reason);
        }
        err
    }

    /// Get statistics for every cache and the pool.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            accessors: self.accessors.stats(),
            kernels: self.kernels.stats(),
            pipelines: self.pipelines.stats(),
            pool: self.pool.stats(),
            last_issued: self.tracker.last_issued(),
            last_completed: self.tracker.last_completed(),
        }
    }

    /// Wait for outstanding work and tear the context down.
    pub fn shutdown(self) -> Result<()> {
        let result = if self.is_device_lost() {
            Ok(())
        } else {
            self.wait_idle()
        };
        tracing::info!(
            device = %self.device.name(),
            submitted = self.tracker.last_issued(),
            "compute context shut down"
        );
        result
    }
}

impl<D: NativeDevice> fmt::Debug for ComputeContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.device.name())
            .field("config", &self.config)
            .field("lost", &*self.lost.read())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDevice, RecordedCommand};
    use computekit_codegen::{AccessMode, CapturedMember, ResourceHandle, ShaderType};

    struct Particles {
        scale: f32,
        data: ResourceHandle,
    }

    fn scale_source() -> KernelSource {
        KernelSource::parse("scale", "|id| { data[id.x] = data[id.x] * scale; }")
            .unwrap()
            .with_capture(CapturedMember::field::<Particles, _>(
                "scale",
                ShaderType::FLOAT,
                |p| HostValue::Float(p.scale),
            ))
            .with_capture(CapturedMember::field::<Particles, _>(
                "data",
                ShaderType::read_write_buffer(ShaderType::FLOAT),
                |p| p.data.into(),
            ))
    }

    fn context() -> (HeadlessDevice, ComputeContext<HeadlessDevice>) {
        let device = HeadlessDevice::new();
        let ctx = ComputeContext::new(device.clone(), RuntimeConfig::default()).unwrap();
        (device, ctx)
    }

    #[test]
    fn test_dispatch_size_groups() {
        let tg = ThreadGroupSize::new(64, 4, 1);
        assert_eq!(DispatchSize::linear(64).groups(tg).unwrap(), (1, 1, 1));
        assert_eq!(DispatchSize::new(65, 9, 3).groups(tg).unwrap(), (2, 3, 3));
        assert!(matches!(
            DispatchSize::new(8, 0, 1).groups(tg),
            Err(RuntimeError::InvalidDispatch(_))
        ));
    }

    #[test]
    fn test_dispatch_records_expected_commands() {
        let (device, ctx) = context();
        let kernel = ctx.compile(&scale_source()).unwrap();
        let particles = Particles {
            scale: 2.5,
            data: ResourceHandle(42),
        };

        let token = ctx.dispatch(&kernel, Some(&particles), 100).unwrap();
        assert_eq!(token.value(), 1);
        assert!(ctx.is_complete(token).unwrap());

        let batches = device.executed();
        assert_eq!(batches.len(), 1);
        let commands = &batches[0].commands;
        assert_eq!(commands.len(), 4);
        assert_eq!(
            commands[0],
            RecordedCommand::SetPipeline(kernel.pipeline().native().id.clone())
        );

        let mut constants = vec![0u8; 16];
        constants[..4].copy_from_slice(&2.5f32.to_le_bytes());
        assert_eq!(commands[1], RecordedCommand::SetConstants(constants));
        assert_eq!(
            commands[2],
            RecordedCommand::BindResource {
                slot: 0,
                access: AccessMode::ReadWrite,
                handle: ResourceHandle(42),
            }
        );
        assert_eq!(commands[3], RecordedCommand::Dispatch { x: 2, y: 1, z: 1 });
    }

    #[test]
    fn test_compile_reuses_every_cache() {
        let (device, ctx) = context();
        let a = ctx.compile(&scale_source()).unwrap();
        let b = ctx.compile(&scale_source()).unwrap();

        assert!(Arc::ptr_eq(a.definition(), b.definition()));
        assert!(Arc::ptr_eq(a.pipeline(), b.pipeline()));
        assert!(Arc::ptr_eq(&a.accessors()[0], &b.accessors()[0]));
        assert_eq!(device.compile_count(), 1);

        let stats = ctx.stats();
        assert_eq!(stats.kernels.compiles, 1);
        assert_eq!(stats.pipelines.entries, 1);
        assert_eq!(stats.accessors.entries, 2);
    }

    #[test]
    fn test_missing_instance_fails_before_submission() {
        let (device, ctx) = context();
        let kernel = ctx.compile(&scale_source()).unwrap();

        let err = ctx.dispatch(&kernel, None, 64).unwrap_err();
        assert!(matches!(err, RuntimeError::Accessor(_)));
        assert!(device.executed().is_empty());
        assert_eq!(ctx.stats().pool.lent, 0);
    }

    #[test]
    fn test_zero_dispatch_is_rejected() {
        let (_device, ctx) = context();
        let kernel = ctx.compile(&scale_source()).unwrap();
        let particles = Particles {
            scale: 1.0,
            data: ResourceHandle(1),
        };

        let err = ctx
            .dispatch(&kernel, Some(&particles), DispatchSize::new(0, 1, 1))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidDispatch(_)));
        assert_eq!(ctx.stats().pool.acquires, 0);
    }

    #[test]
    fn test_observed_device_loss_is_sticky() {
        let (device, ctx) = context();
        let kernel = ctx.compile(&scale_source()).unwrap();
        let particles = Particles {
            scale: 1.0,
            data: ResourceHandle(1),
        };

        device.remove("TDR");
        assert!(ctx
            .dispatch(&kernel, Some(&particles), 64)
            .unwrap_err()
            .is_device_lost());
        assert!(ctx.is_device_lost());
        assert!(ctx.pipeline_cache().is_empty());
        assert!(ctx.compile(&scale_source()).unwrap_err().is_device_lost());
        assert_eq!(ctx.kernel_cache().len(), 1);
    }

    #[test]
    fn test_shutdown_waits_for_work() {
        let (_device, ctx) = context();
        let kernel = ctx.compile(&scale_source()).unwrap();
        let particles = Particles {
            scale: 1.0,
            data: ResourceHandle(1),
        };
        for _ in 0..5 {
            ctx.dispatch(&kernel, Some(&particles), 256).unwrap();
        }
        assert_eq!(ctx.stats().last_issued, 5);
        ctx.shutdown().unwrap();
    }
}
