//! Error types for the runtime.

use std::time::Duration;

use computekit_codegen::{AccessorError, CompileError, PackError};
use thiserror::Error;

use crate::command_list::LifecycleViolation;

/// Errors reported by a native graphics backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    /// The device was removed or reset.
    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    /// The shader compiler rejected a source.
    #[error("Shader compilation failed: {0}")]
    CompilationFailed(String),

    /// The native API rejected a call in the object's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Any other native failure.
    #[error("Native call failed: {0}")]
    Failed(String),
}

/// Result type for native backend calls.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Errors that can occur in the runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Kernel compilation failed (before anything was submitted).
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Reading a captured member failed.
    #[error("Accessor error: {0}")]
    Accessor(#[from] AccessorError),

    /// Capture values did not fit the kernel layout.
    #[error("Pack error: {0}")]
    Pack(#[from] PackError),

    /// A command list or allocator was used out of order.
    #[error("Lifecycle violation: {0}")]
    Lifecycle(#[from] LifecycleViolation),

    /// The device was lost; every cached native object is invalid.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A native call failed.
    #[error("Native error: {0}")]
    Native(NativeError),

    /// No command list became available in time.
    #[error("Timed out after {waited:?} waiting for a command list ({in_flight} in flight)")]
    AcquireTimeout {
        /// How long acquire waited.
        waited: Duration,
        /// Lists still in flight.
        in_flight: usize,
    },

    /// A fence did not reach a value in time.
    #[error("Timed out waiting for fence value {token} (completed: {completed})")]
    FenceTimeout {
        /// Awaited value.
        token: u64,
        /// Last completed value observed.
        completed: u64,
    },

    /// A token that was never signaled.
    #[error("Completion token {0} was never signaled")]
    UnknownToken(u64),

    /// Malformed dispatch request.
    #[error("Invalid dispatch: {0}")]
    InvalidDispatch(String),
}

impl From<NativeError> for RuntimeError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::DeviceRemoved(reason) => RuntimeError::DeviceLost(reason),
            other => RuntimeError::Native(other),
        }
    }
}

impl RuntimeError {
    /// Whether this error means the device is gone.
    #[must_use]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RuntimeError::DeviceLost(_))
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_removed_maps_to_device_lost() {
        let err = RuntimeError::from(NativeError::DeviceRemoved("hung".to_string()));
        assert_eq!(err, RuntimeError::DeviceLost("hung".to_string()));
        assert!(err.is_device_lost());

        let err = RuntimeError::from(NativeError::InvalidState("list open".to_string()));
        assert!(!err.is_device_lost());
        assert_eq!(err.to_string(), "Native error: Invalid state: list open");
    }
}
