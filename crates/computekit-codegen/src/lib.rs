//! HLSL compute kernel generation for ComputeKit.
//!
//! This crate turns a kernel body, written as an ordinary Rust closure over the
//! dispatch thread id, into an HLSL compute shader plus the constant-buffer and
//! resource-binding layout the host needs to feed it.
//!
//! # Overview
//!
//! - Captures are declared as [`CapturedMember`]s. Values are read on every
//!   dispatch through cached [`Accessor`]s.
//! - [`plan_layout`] packs value captures into a `cbuffer` with HLSL packing
//!   rules and assigns `t#`/`u#` registers to buffer captures.
//! - [`emit`] validates the body and emits HLSL against that layout.
//! - [`KernelCache`] memoizes the whole pipeline per kernel shape.
//!
//! # Example
//!
//! ```ignore
//! use computekit_codegen::{compile_kernel, CapturedMember, KernelSource, ResourceHandle, ShaderType};
//!
//! struct Scaler { scale: f32 }
//!
//! let source = KernelSource::parse("scale", "|id| { data[id.x] = data[id.x] * scale; }")?
//!     .with_capture(CapturedMember::field::<Scaler, _>("scale", ShaderType::FLOAT, |s| s.scale.into()))
//!     .with_capture(CapturedMember::static_field::<Scaler, _>(
//!         "data",
//!         ShaderType::read_write_buffer(ShaderType::FLOAT),
//!         || ResourceHandle(1).into(),
//!     ));
//!
//! let kernel = compile_kernel(&source)?;
//! println!("{}", kernel.source);
//! ```

mod accessor;
mod capture;
mod emitter;
mod intrinsics;
mod kernel;
mod layout;
mod loops;
mod types;
mod validation;

pub use accessor::{Accessor, AccessorCache, AccessorCacheStats, AccessorError};
pub use capture::{CaptureDecl, CapturedMember, HostValue, MemberBuilder, MemberKind, ResourceHandle};
pub use emitter::{emit, EmittedKernel, HlslEmitter, KernelBody, CONSTANT_BUFFER_NAME, ENTRY_POINT};
pub use intrinsics::{HlslIntrinsic, IntrinsicRegistry};
pub use kernel::{
    compile_kernel, KernelCache, KernelCacheStats, KernelDefinition, KernelId, KernelSource,
    ThreadGroupSize,
};
pub use layout::{
    packoffset, plan_layout, BufferField, BufferLayout, ConstantField, PackError, ResourceField,
    MAX_CONSTANT_BUFFER_SIZE, REGISTER_SIZE,
};
pub use loops::{LoopPattern, RangeInfo};
pub use types::{AccessMode, ScalarKind, ShaderType, StructField, StructType, TypeMapper};
pub use validation::{validate_kernel, ValidationError};

use thiserror::Error;

/// Errors that can occur while compiling a kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Failed to parse the kernel body.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The kernel signature is not a kernel.
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    /// A Rust construct with no structured HLSL equivalent.
    #[error("Unsupported construct `{construct}`: {detail}")]
    UnsupportedConstruct {
        /// Short construct name (`labeled break`, `function call`, ...).
        construct: String,
        /// Offending source.
        detail: String,
    },

    /// A capture whose type cannot be placed in a buffer.
    #[error("Unsupported capture `{name}`: {reason}")]
    UnsupportedCapture {
        /// Capture name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Type mapping or inference failure.
    #[error("Type error: {0}")]
    Type(String),

    /// The body writes to a read-only buffer or a constant-buffer value.
    #[error("Capture `{0}` is read-only inside kernels")]
    ReadOnlyCapture(String),

    /// Constant-buffer layout failure.
    #[error("Layout error: {0}")]
    Layout(String),

    /// A compilation failure, tagged with the kernel it came from.
    #[error("Kernel `{kernel}`: {source}")]
    Kernel {
        /// Kernel name.
        kernel: String,
        /// Underlying failure.
        source: Box<CompileError>,
    },

    /// The native shader compiler rejected the emitted source.
    #[error("Shader compiler rejected kernel {kernel}: {message}")]
    ShaderCompiler {
        /// Kernel identity.
        kernel: String,
        /// Compiler diagnostics.
        message: String,
    },
}

impl From<ValidationError> for CompileError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Unsupported { construct, detail } => {
                CompileError::UnsupportedConstruct {
                    construct: construct.to_string(),
                    detail,
                }
            }
            other => CompileError::Validation(other),
        }
    }
}

impl CompileError {
    /// Tag this error with the kernel it came from.
    ///
    /// Errors that already name a kernel are returned unchanged.
    #[must_use]
    pub fn in_kernel(self, kernel: &str) -> Self {
        match self {
            CompileError::Kernel { .. } | CompileError::ShaderCompiler { .. } => self,
            other => CompileError::Kernel {
                kernel: kernel.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Kernel this error is tagged with, if any.
    pub fn kernel(&self) -> Option<&str> {
        match self {
            CompileError::Kernel { kernel, .. } | CompileError::ShaderCompiler { kernel, .. } => {
                Some(kernel)
            }
            _ => None,
        }
    }

    /// The error without its kernel tag.
    pub fn root(&self) -> &CompileError {
        match self {
            CompileError::Kernel { source, .. } => source.root(),
            other => other,
        }
    }

    /// Construct name for [`CompileError::UnsupportedConstruct`].
    pub fn construct(&self) -> Option<&str> {
        match self.root() {
            CompileError::UnsupportedConstruct { construct, .. } => Some(construct),
            _ => None,
        }
    }
}

/// Result type for kernel compilation.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Parse a kernel body from source text.
pub fn parse_kernel(source: &str) -> Result<KernelBody> {
    syn::parse_str::<KernelBody>(source).map_err(|e| CompileError::Parse(e.to_string()))
}
