//! # ComputeKit
//!
//! Write a GPU compute kernel as an ordinary Rust closure, dispatch it many
//! times with almost no per-dispatch overhead.
//!
//! ComputeKit has two halves:
//!
//! - **Kernel compiler** (`computekit-codegen`): turns a closure body over the
//!   dispatch thread id into HLSL, plans the constant buffer and resource
//!   registers for its captures, and caches the result per kernel shape.
//! - **Command list lifecycle** (`computekit-runtime`): caches one pipeline per
//!   kernel, rotates a bounded pool of command allocators and lists, and tracks
//!   completion with fence tokens so no allocator is reset while the GPU may
//!   still read it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use computekit::prelude::*;
//!
//! struct Particles {
//!     scale: f32,
//!     positions: ResourceHandle,
//! }
//!
//! let ctx = ComputeContext::new(HeadlessDevice::new(), RuntimeConfig::default())?;
//!
//! let source = KernelSource::parse(
//!     "scale",
//!     "|id| { positions[id.x] = positions[id.x] * scale; }",
//! )?
//! .with_capture(CapturedMember::field::<Particles, _>(
//!     "scale",
//!     ShaderType::FLOAT,
//!     |p| p.scale.into(),
//! ))
//! .with_capture(CapturedMember::field::<Particles, _>(
//!     "positions",
//!     ShaderType::read_write_buffer(ShaderType::FLOAT),
//!     |p| p.positions.into(),
//! ));
//!
//! let kernel = ctx.compile(&source)?;
//! let particles = Particles { scale: 2.0, positions: ResourceHandle(1) };
//! let token = ctx.dispatch(&kernel, Some(&particles), 4096)?;
//! ctx.wait(token)?;
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! dispatch ─▶ layout ─▶ emit HLSL ─▶ pipeline ─▶ acquire ─▶ record ─▶ submit ─▶ reclaim
//!             (cached per kernel shape)  (per id)    (pool)              (fence token)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use computekit_codegen as codegen;
pub use computekit_runtime as runtime;

pub use computekit_codegen::{
    compile_kernel, emit, plan_layout, Accessor, AccessorCache, AccessorError, BufferField,
    BufferLayout, CaptureDecl, CapturedMember, CompileError, HostValue, KernelCache,
    KernelDefinition, KernelId, KernelSource, PackError, ResourceHandle, ShaderType,
    ThreadGroupSize,
};
pub use computekit_runtime::{
    CompiledCommandList, CompiledKernel, CompletionMode, CompletionToken, ComputeContext,
    DispatchSize, HeadlessDevice, LifecycleViolation, NativeDevice, NativeQueue, RuntimeConfig,
    RuntimeConfigBuilder, RuntimeError,
};

/// Result type for ComputeKit operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::Result;
    pub use computekit_codegen::{
        AccessMode, CapturedMember, CompileError, HostValue, KernelSource, ResourceHandle,
        ScalarKind, ShaderType, StructType, ThreadGroupSize,
    };
    pub use computekit_runtime::{
        CompiledKernel, CompletionToken, ComputeContext, DispatchSize, HeadlessDevice,
        NativeDevice, RuntimeConfig, RuntimeConfigBuilder, RuntimeError,
    };
}
