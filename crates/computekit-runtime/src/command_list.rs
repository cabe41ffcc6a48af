//! Pooled command lists and their lifecycle.
//!
//! A [`CompiledCommandList`] pairs a native command allocator with the list
//! recorded against it. Its lifecycle is
//! `Recording -> Closed -> Submitted(token) -> (reset) -> Recording`, and the
//! allocator is only reset once the GPU has reached the list's last token.
//! Any other order is a [`LifecycleViolation`].

use std::fmt;

use computekit_codegen::{AccessMode, ResourceHandle};
use thiserror::Error;

use crate::error::Result;
use crate::fence::{CompletionToken, FenceTracker};
use crate::native::{Command, NativeDevice};
use crate::pipeline::Pipeline;

/// Lifecycle state of a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Open for recording.
    Recording,
    /// Closed and ready to submit.
    Closed,
    /// Submitted; the GPU owns the allocator until the token completes.
    Submitted(CompletionToken),
}

impl fmt::Display for ListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListState::Recording => f.write_str("recording"),
            ListState::Closed => f.write_str("closed"),
            ListState::Submitted(token) => write!(f, "submitted ({token})"),
        }
    }
}

/// A command list used out of order. Always a programming error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{operation}` on command list slot {slot}: {reason}")]
pub struct LifecycleViolation {
    /// Pool slot of the list.
    pub slot: usize,
    /// Rejected operation.
    pub operation: &'static str,
    /// What was wrong.
    pub reason: String,
}

impl LifecycleViolation {
    pub(crate) fn new(slot: usize, operation: &'static str, reason: impl Into<String>) -> Self {
        let violation = Self {
            slot,
            operation,
            reason: reason.into(),
        };
        tracing::error!(
            slot,
            operation,
            reason = %violation.reason,
            "command list lifecycle violation"
        );
        violation
    }
}

/// A native command allocator and list owned by one pool slot.
pub struct CompiledCommandList<D: NativeDevice> {
    slot: usize,
    generation: u64,
    allocator: D::Allocator,
    list: D::CommandList,
    state: ListState,
    last_token: Option<CompletionToken>,
    recorded: usize,
}

impl<D: NativeDevice> CompiledCommandList<D> {
    /// Create an allocator and a list open against it.
    pub(crate) fn create(device: &D, slot: usize, generation: u64) -> Result<Self> {
        let allocator = device.create_allocator()?;
        let list = device.create_command_list(&allocator)?;
        Ok(Self {
            slot,
            generation,
            allocator,
            list,
            state: ListState::Recording,
            last_token: None,
            recorded: 0,
        })
    }

    /// Pool slot index.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ListState {
        self.state
    }

    /// Token of the most recent submission from this slot.
    #[must_use]
    pub fn last_token(&self) -> Option<CompletionToken> {
        self.last_token
    }

    /// Commands recorded since the last reset.
    #[must_use]
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Whether the list accepts commands.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state == ListState::Recording
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn native(&self) -> &D::CommandList {
        &self.list
    }

    fn record(&mut self, device: &D, operation: &'static str, command: Command<'_, D::Pipeline>) -> Result<()> {
        if self.state != ListState::Recording {
            return Err(LifecycleViolation::new(
                self.slot,
                operation,
                format!("list is {}, not recording", self.state),
            )
            .into());
        }
        device.record(&mut self.list, command)?;
        self.recorded += 1;
        Ok(())
    }

    /// Bind a compute pipeline.
    pub fn set_pipeline(&mut self, device: &D, pipeline: &Pipeline<D>) -> Result<()> {
        self.record(device, "set_pipeline", Command::SetPipeline(pipeline.native()))
    }

    /// Upload constant-buffer bytes.
    pub fn set_constants(&mut self, device: &D, bytes: &[u8]) -> Result<()> {
        self.record(device, "set_constants", Command::SetConstants(bytes))
    }

    /// Bind a buffer to a register slot.
    pub fn bind_resource(
        &mut self,
        device: &D,
        slot: u32,
        access: AccessMode,
        handle: ResourceHandle,
    ) -> Result<()> {
        self.record(
            device,
            "bind_resource",
            Command::BindResource {
                slot,
                access,
                handle,
            },
        )
    }

    /// Record a dispatch of thread groups.
    pub fn dispatch(&mut self, device: &D, x: u32, y: u32, z: u32) -> Result<()> {
        self.record(device, "dispatch", Command::Dispatch { x, y, z })
    }

    /// Close the list for submission.
    pub fn close(&mut self, device: &D) -> Result<()> {
        match self.state {
            ListState::Recording => {
                device.close_command_list(&mut self.list)?;
                self.state = ListState::Closed;
                Ok(())
            }
            ListState::Closed => {
                Err(LifecycleViolation::new(self.slot, "close", "list is already closed").into())
            }
            ListState::Submitted(token) => Err(LifecycleViolation::new(
                self.slot,
                "close",
                format!("list was submitted as {token} and must be reset first"),
            )
            .into()),
        }
    }

    /// Check the list can be submitted.
    pub(crate) fn check_submittable(&self) -> Result<()> {
        match self.state {
            ListState::Closed => Ok(()),
            state => Err(LifecycleViolation::new(
                self.slot,
                "submit",
                format!("list is {state}; only closed lists can be submitted"),
            )
            .into()),
        }
    }

    pub(crate) fn mark_submitted(&mut self, token: CompletionToken) {
        self.state = ListState::Submitted(token);
        self.last_token = Some(token);
    }

    /// Reset the allocator and reopen the list for recording.
    ///
    /// Fails if the GPU has not yet reached the last token submitted from this
    /// slot: the allocator still backs commands in flight.
    pub fn reset(&mut self, device: &D, tracker: &FenceTracker, queue: &D::Queue) -> Result<()> {
        if let Some(token) = self.last_token {
            if !tracker.is_complete(queue, token)? {
                return Err(LifecycleViolation::new(
                    self.slot,
                    "reset",
                    format!("allocator is in use until {token} completes"),
                )
                .into());
            }
        }
        if self.state == ListState::Recording {
            // Closing first keeps the native list in a resettable state.
            device.close_command_list(&mut self.list)?;
        }

        device.reset_allocator(&mut self.allocator)?;
        device.reset_command_list(&mut self.list, &self.allocator)?;
        self.state = ListState::Recording;
        self.recorded = 0;
        tracing::trace!(slot = self.slot, "command list reset");
        Ok(())
    }

    /// Close a list that is still recording so it can return to the pool.
    pub(crate) fn abandon(&mut self, device: &D) -> Result<()> {
        if self.state == ListState::Recording {
            device.close_command_list(&mut self.list)?;
            self.state = ListState::Closed;
        }
        Ok(())
    }
}

impl<D: NativeDevice> fmt::Debug for CompiledCommandList<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCommandList")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("last_token", &self.last_token)
            .field("recorded", &self.recorded)
            .finish()
    }
}
