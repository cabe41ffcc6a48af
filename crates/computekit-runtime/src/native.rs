//! Native graphics API boundary.
//!
//! The runtime only sequences native objects; it never talks to a graphics API
//! directly. A backend implements [`NativeDevice`] and [`NativeQueue`] with the
//! semantics of Direct3D 12:
//!
//! - a command list is created open (recording) against an allocator;
//! - an allocator may only be reset once the GPU finished every list recorded
//!   into it, and a list is reset against an allocator before re-recording;
//! - the queue executes closed lists in order and signals a monotonically
//!   increasing fence value after them.

use std::time::Duration;

use computekit_codegen::{AccessMode, BufferLayout, ResourceHandle};

use crate::error::NativeResult;

/// One command recorded into a native command list.
#[derive(Debug)]
pub enum Command<'a, P> {
    /// Bind a compute pipeline.
    SetPipeline(&'a P),
    /// Upload constant-buffer bytes bound at `b0`.
    SetConstants(&'a [u8]),
    /// Bind a buffer to a register.
    BindResource {
        /// Register slot within its class.
        slot: u32,
        /// `t#` (read-only) or `u#` (read-write).
        access: AccessMode,
        /// Buffer handle.
        handle: ResourceHandle,
    },
    /// Dispatch thread groups.
    Dispatch {
        /// Groups along x.
        x: u32,
        /// Groups along y.
        y: u32,
        /// Groups along z.
        z: u32,
    },
}

/// A command queue with a fence.
pub trait NativeQueue: Send + Sync + 'static {
    /// Command list type the queue executes.
    type CommandList;

    /// Submit a closed command list.
    fn execute(&self, list: &Self::CommandList) -> NativeResult<()>;

    /// Signal the fence to `value` once all prior work completes.
    fn signal(&self, value: u64) -> NativeResult<()>;

    /// Current completed fence value.
    fn completed_value(&self) -> NativeResult<u64>;

    /// Block until the fence reaches `value`. Returns `false` on timeout.
    fn wait_for_value(&self, value: u64, timeout: Duration) -> NativeResult<bool>;
}

/// A device that creates and drives native objects.
pub trait NativeDevice: Send + Sync + 'static {
    /// Queue type.
    type Queue: NativeQueue<CommandList = Self::CommandList>;
    /// Command allocator type.
    type Allocator: Send + 'static;
    /// Command list type.
    type CommandList: Send + 'static;
    /// Compute pipeline type.
    type Pipeline: Send + Sync + 'static;

    /// Human readable adapter name.
    fn name(&self) -> String;

    /// Create the direct compute queue.
    fn create_queue(&self) -> NativeResult<Self::Queue>;

    /// Create a command allocator.
    fn create_allocator(&self) -> NativeResult<Self::Allocator>;

    /// Create a command list, open for recording against `allocator`.
    fn create_command_list(&self, allocator: &Self::Allocator) -> NativeResult<Self::CommandList>;

    /// Reset an allocator, discarding the memory of every list recorded into it.
    fn reset_allocator(&self, allocator: &mut Self::Allocator) -> NativeResult<()>;

    /// Reopen a closed list for recording against `allocator`.
    fn reset_command_list(
        &self,
        list: &mut Self::CommandList,
        allocator: &Self::Allocator,
    ) -> NativeResult<()>;

    /// Record one command.
    fn record(
        &self,
        list: &mut Self::CommandList,
        command: Command<'_, Self::Pipeline>,
    ) -> NativeResult<()>;

    /// Close a list so it can be executed.
    fn close_command_list(&self, list: &mut Self::CommandList) -> NativeResult<()>;

    /// Compile HLSL to bytecode.
    fn compile_shader(&self, source: &str, entry_point: &str, profile: &str)
        -> NativeResult<Vec<u8>>;

    /// Create a compute pipeline from bytecode.
    fn create_pipeline(
        &self,
        bytecode: &[u8],
        entry_point: &str,
        layout: &BufferLayout,
    ) -> NativeResult<Self::Pipeline>;

    /// Why the device was removed, if it was.
    fn removed_reason(&self) -> Option<String>;
}
