//! Command list lifecycle management for ComputeKit.
//!
//! This crate takes kernel definitions produced by `computekit-codegen` and
//! drives them on a device with low per-dispatch overhead:
//!
//! - [`PipelineCache`] builds one native pipeline per kernel identity, with an
//!   optional on-disk [`ShaderBytecodeCache`].
//! - [`CommandListPool`] rotates a bounded set of command allocator/list pairs
//!   and never resets an allocator the GPU may still read.
//! - [`FenceTracker`] issues [`CompletionToken`]s and tracks completion.
//! - [`ComputeContext`] owns all of the above for one device.
//!
//! The graphics API is reached only through the [`NativeDevice`] and
//! [`NativeQueue`] traits. [`HeadlessDevice`] implements them in software.
//!
//! # Example
//!
//! ```ignore
//! use computekit_runtime::{ComputeContext, HeadlessDevice, RuntimeConfig};
//!
//! let ctx = ComputeContext::new(HeadlessDevice::new(), RuntimeConfig::default())?;
//! let kernel = ctx.compile(&source)?;
//! let token = ctx.dispatch(&kernel, Some(&particles), 4096)?;
//! ctx.wait(token)?;
//! ```

#![warn(missing_docs)]

mod command_list;
mod config;
mod context;
mod error;
mod fence;
pub mod headless;
pub mod native;
mod pipeline;
mod pool;
mod shader_cache;

pub use command_list::{CompiledCommandList, LifecycleViolation, ListState};
pub use config::{RuntimeConfig, RuntimeConfigBuilder, DEFAULT_SHADER_PROFILE};
pub use context::{CompiledKernel, ComputeContext, ContextStats, DispatchSize};
pub use error::{NativeError, NativeResult, Result, RuntimeError};
pub use fence::{CompletionToken, FenceTracker};
pub use headless::{CompletionMode, HeadlessDevice};
pub use native::{Command, NativeDevice, NativeQueue};
pub use pipeline::{Pipeline, PipelineCache, PipelineCacheStats};
pub use pool::{CommandListPool, PoolStats};
pub use shader_cache::{
    ShaderBytecodeCache, ShaderCacheError, ShaderCacheResult, ShaderCacheStats, CACHE_DIR_ENV,
    FORMAT_VERSION,
};
