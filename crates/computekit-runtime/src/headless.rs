//! Software implementation of the native boundary.
//!
//! [`HeadlessDevice`] records commands instead of encoding them, keeps a log of
//! executed batches and simulates the queue fence. It enforces the same
//! object rules a native API would: only closed lists execute, and an
//! allocator cannot be reset while work recorded into it is pending.
//!
//! Completion is either immediate (every signal completes at once) or manual,
//! in which case tests drive the fence with [`HeadlessDevice::complete_up_to`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use computekit_codegen::{AccessMode, BufferLayout, ResourceHandle};
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};

use crate::error::{NativeError, NativeResult};
use crate::native::{Command, NativeDevice, NativeQueue};

const BYTECODE_MAGIC: &[u8; 4] = b"DXBC";

/// How the simulated fence advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Every signaled value completes immediately.
    #[default]
    Immediate,
    /// Values complete only through [`HeadlessDevice::complete_up_to`].
    Manual,
}

/// A command as recorded by the headless backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    /// Pipeline bound, by pipeline id.
    SetPipeline(String),
    /// Constant-buffer bytes.
    SetConstants(Vec<u8>),
    /// Buffer bound to a register.
    BindResource {
        /// Register slot.
        slot: u32,
        /// Register class.
        access: AccessMode,
        /// Bound buffer.
        handle: ResourceHandle,
    },
    /// Thread groups dispatched.
    #[allow(missing_docs)]
    Dispatch { x: u32, y: u32, z: u32 },
}

/// One executed command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBatch {
    /// Allocator the list was recorded into.
    pub allocator: u64,
    /// Recorded commands, in order.
    pub commands: Vec<RecordedCommand>,
}

impl ExecutedBatch {
    /// Dispatches in this batch.
    pub fn dispatches(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.commands.iter().filter_map(|c| match c {
            RecordedCommand::Dispatch { x, y, z } => Some((*x, *y, *z)),
            _ => None,
        })
    }
}

/// Headless command allocator.
#[derive(Debug)]
pub struct HeadlessAllocator {
    id: u64,
}

impl HeadlessAllocator {
    /// Allocator id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Headless command list.
#[derive(Debug)]
pub struct HeadlessCommandList {
    allocator: u64,
    commands: Vec<RecordedCommand>,
    closed: bool,
}

impl HeadlessCommandList {
    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Whether the list is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Headless compute pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessPipeline {
    /// Digest of the bytecode the pipeline was built from.
    pub id: String,
    /// Entry point.
    pub entry_point: String,
    /// Constant-buffer size in bytes.
    pub constant_size: usize,
    /// Number of bound resources.
    pub resource_count: usize,
}

#[derive(Default)]
struct FenceState {
    signaled: u64,
    completed: u64,
    removed: Option<String>,
    /// Allocators executed since the last signal.
    unsignaled: Vec<u64>,
    /// Fence value guarding each allocator's last execution.
    pending: HashMap<u64, u64>,
    executed: Vec<ExecutedBatch>,
    rejected: Vec<String>,
}

impl FenceState {
    fn check_removed(&self) -> NativeResult<()> {
        match &self.removed {
            Some(reason) => Err(NativeError::DeviceRemoved(reason.clone())),
            None => Ok(()),
        }
    }
}

struct Shared {
    mode: CompletionMode,
    state: Mutex<FenceState>,
    fence_changed: Condvar,
    next_allocator: AtomicU64,
    compiles: AtomicU64,
}

/// A device that runs nothing.
#[derive(Clone)]
pub struct HeadlessDevice {
    shared: Arc<Shared>,
}

impl HeadlessDevice {
    /// Create a device whose fence completes immediately.
    pub fn new() -> Self {
        Self::with_completion(CompletionMode::Immediate)
    }

    /// Create a device with the given completion mode.
    pub fn with_completion(mode: CompletionMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                state: Mutex::new(FenceState::default()),
                fence_changed: Condvar::new(),
                next_allocator: AtomicU64::new(1),
                compiles: AtomicU64::new(0),
            }),
        }
    }

    /// Completion mode.
    pub fn completion_mode(&self) -> CompletionMode {
        self.shared.mode
    }

    /// Complete every signaled value up to `value`.
    pub fn complete_up_to(&self, value: u64) {
        let mut state = self.shared.state.lock();
        let target = value.min(state.signaled);
        if target > state.completed {
            state.completed = target;
            self.shared.fence_changed.notify_all();
        }
    }

    /// Complete everything signaled so far.
    pub fn complete_all(&self) {
        let mut state = self.shared.state.lock();
        state.completed = state.signaled;
        self.shared.fence_changed.notify_all();
    }

    /// Last value signaled on the queue.
    pub fn signaled_value(&self) -> u64 {
        self.shared.state.lock().signaled
    }

    /// Simulate device removal. Every later native call fails.
    pub fn remove(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "headless device removed");
        let mut state = self.shared.state.lock();
        state.removed = Some(reason);
        self.shared.fence_changed.notify_all();
    }

    /// Make the shader compiler reject any source containing `marker`.
    pub fn reject_sources_containing(&self, marker: impl Into<String>) {
        self.shared.state.lock().rejected.push(marker.into());
    }

    /// Batches executed so far.
    pub fn executed(&self) -> Vec<ExecutedBatch> {
        self.shared.state.lock().executed.clone()
    }

    /// Number of shader compilations performed.
    pub fn compile_count(&self) -> u64 {
        self.shared.compiles.load(Ordering::Relaxed)
    }

    fn check_removed(&self) -> NativeResult<()> {
        self.shared.state.lock().check_removed()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HeadlessDevice")
            .field("mode", &self.shared.mode)
            .field("signaled", &state.signaled)
            .field("completed", &state.completed)
            .field("removed", &state.removed)
            .field("executed", &state.executed.len())
            .finish()
    }
}

/// Queue of a [`HeadlessDevice`].
pub struct HeadlessQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for HeadlessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessQueue").finish_non_exhaustive()
    }
}

impl NativeQueue for HeadlessQueue {
    type CommandList = HeadlessCommandList;

    fn execute(&self, list: &HeadlessCommandList) -> NativeResult<()> {
        let mut state = self.shared.state.lock();
        state.check_removed()?;
        if !list.closed {
            return Err(NativeError::InvalidState(
                "cannot execute a command list that is still recording".to_string(),
            ));
        }
        state.executed.push(ExecutedBatch {
            allocator: list.allocator,
            commands: list.commands.clone(),
        });
        state.unsignaled.push(list.allocator);
        Ok(())
    }

    fn signal(&self, value: u64) -> NativeResult<()> {
        let mut state = self.shared.state.lock();
        state.check_removed()?;
        if value <= state.signaled {
            return Err(NativeError::InvalidState(format!(
                "fence value {value} does not advance past {}",
                state.signaled
            )));
        }
        state.signaled = value;
        let executed: Vec<u64> = state.unsignaled.drain(..).collect();
        for allocator in executed {
            state.pending.insert(allocator, value);
        }
        if self.shared.mode == CompletionMode::Immediate {
            state.completed = value;
            self.shared.fence_changed.notify_all();
        }
        Ok(())
    }

    fn completed_value(&self) -> NativeResult<u64> {
        let state = self.shared.state.lock();
        state.check_removed()?;
        Ok(state.completed)
    }

    fn wait_for_value(&self, value: u64, timeout: Duration) -> NativeResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            state.check_removed()?;
            if state.completed >= value {
                return Ok(true);
            }
            if self
                .shared
                .fence_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                state.check_removed()?;
                return Ok(state.completed >= value);
            }
        }
    }
}

impl NativeDevice for HeadlessDevice {
    type Queue = HeadlessQueue;
    type Allocator = HeadlessAllocator;
    type CommandList = HeadlessCommandList;
    type Pipeline = HeadlessPipeline;

    fn name(&self) -> String {
        "Headless Software Device".to_string()
    }

    fn create_queue(&self) -> NativeResult<HeadlessQueue> {
        self.check_removed()?;
        Ok(HeadlessQueue {
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_allocator(&self) -> NativeResult<HeadlessAllocator> {
        self.check_removed()?;
        Ok(HeadlessAllocator {
            id: self.shared.next_allocator.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn create_command_list(&self, allocator: &HeadlessAllocator) -> NativeResult<HeadlessCommandList> {
        self.check_removed()?;
        Ok(HeadlessCommandList {
            allocator: allocator.id,
            commands: Vec::new(),
            closed: false,
        })
    }

    fn reset_allocator(&self, allocator: &mut HeadlessAllocator) -> NativeResult<()> {
        let mut state = self.shared.state.lock();
        state.check_removed()?;
        if state.unsignaled.contains(&allocator.id) {
            return Err(NativeError::InvalidState(format!(
                "allocator {} has executed work with no fence signal",
                allocator.id
            )));
        }
        if let Some(&value) = state.pending.get(&allocator.id) {
            if value > state.completed {
                return Err(NativeError::InvalidState(format!(
                    "allocator {} is in use until fence value {value} (completed: {})",
                    allocator.id, state.completed
                )));
            }
        }
        state.pending.remove(&allocator.id);
        Ok(())
    }

    fn reset_command_list(
        &self,
        list: &mut HeadlessCommandList,
        allocator: &HeadlessAllocator,
    ) -> NativeResult<()> {
        self.check_removed()?;
        if !list.closed {
            return Err(NativeError::InvalidState(
                "command list must be closed before reset".to_string(),
            ));
        }
        list.commands.clear();
        list.closed = false;
        list.allocator = allocator.id;
        Ok(())
    }

    fn record(
        &self,
        list: &mut HeadlessCommandList,
        command: Command<'_, HeadlessPipeline>,
    ) -> NativeResult<()> {
        if list.closed {
            return Err(NativeError::InvalidState(
                "cannot record into a closed command list".to_string(),
            ));
        }
        let recorded = match command {
            Command::SetPipeline(pipeline) => RecordedCommand::SetPipeline(pipeline.id.clone()),
            Command::SetConstants(bytes) => RecordedCommand::SetConstants(bytes.to_vec()),
            Command::BindResource {
                slot,
                access,
                handle,
            } => RecordedCommand::BindResource {
                slot,
                access,
                handle,
            },
            Command::Dispatch { x, y, z } => RecordedCommand::Dispatch { x, y, z },
        };
        list.commands.push(recorded);
        Ok(())
    }

    fn close_command_list(&self, list: &mut HeadlessCommandList) -> NativeResult<()> {
        if list.closed {
            return Err(NativeError::InvalidState(
                "command list is already closed".to_string(),
            ));
        }
        list.closed = true;
        Ok(())
    }

    fn compile_shader(&self, source: &str, entry_point: &str, profile: &str) -> NativeResult<Vec<u8>> {
        {
            let state = self.shared.state.lock();
            state.check_removed()?;
            if let Some(marker) = state.rejected.iter().find(|m| source.contains(m.as_str())) {
                return Err(NativeError::CompilationFailed(format!(
                    "error X3000: rejected construct `{marker}`"
                )));
            }
        }
        self.shared.compiles.fetch_add(1, Ordering::Relaxed);

        if !profile.starts_with("cs_") {
            return Err(NativeError::CompilationFailed(format!(
                "profile `{profile}` is not a compute profile"
            )));
        }
        if !source.contains(&format!("void {entry_point}(")) {
            return Err(NativeError::CompilationFailed(format!(
                "error E5002: entry point `{entry_point}` not found"
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(profile.as_bytes());
        hasher.update(entry_point.as_bytes());
        hasher.update(source.as_bytes());

        let mut bytecode = BYTECODE_MAGIC.to_vec();
        bytecode.extend_from_slice(&hasher.finalize());
        Ok(bytecode)
    }

    fn create_pipeline(
        &self,
        bytecode: &[u8],
        entry_point: &str,
        layout: &BufferLayout,
    ) -> NativeResult<HeadlessPipeline> {
        self.check_removed()?;
        let Some(digest) = bytecode.strip_prefix(BYTECODE_MAGIC.as_slice()) else {
            return Err(NativeError::Failed("bytecode has no DXBC header".to_string()));
        };
        let id: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        Ok(HeadlessPipeline {
            id,
            entry_point: entry_point.to_string(),
            constant_size: layout.constant_size(),
            resource_count: layout.resources().count(),
        })
    }

    fn removed_reason(&self) -> Option<String> {
        self.shared.state.lock().removed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "[numthreads(64, 1, 1)]\nvoid CSMain(uint3 id : SV_DispatchThreadID)\n{\n}\n";

    fn closed_list(device: &HeadlessDevice, allocator: &HeadlessAllocator) -> HeadlessCommandList {
        let mut list = device.create_command_list(allocator).unwrap();
        device
            .record(&mut list, Command::Dispatch { x: 2, y: 1, z: 1 })
            .unwrap();
        device.close_command_list(&mut list).unwrap();
        list
    }

    #[test]
    fn test_execute_logs_batch() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let allocator = device.create_allocator().unwrap();
        let list = closed_list(&device, &allocator);

        queue.execute(&list).unwrap();
        queue.signal(1).unwrap();

        let executed = device.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].allocator, allocator.id());
        assert_eq!(executed[0].dispatches().collect::<Vec<_>>(), vec![(2, 1, 1)]);
        assert_eq!(queue.completed_value().unwrap(), 1);
    }

    #[test]
    fn test_execute_unclosed_list_fails() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let allocator = device.create_allocator().unwrap();
        let list = device.create_command_list(&allocator).unwrap();

        assert!(matches!(
            queue.execute(&list),
            Err(NativeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reset_allocator_with_pending_work_fails() {
        let device = HeadlessDevice::with_completion(CompletionMode::Manual);
        let queue = device.create_queue().unwrap();
        let mut allocator = device.create_allocator().unwrap();
        let list = closed_list(&device, &allocator);

        queue.execute(&list).unwrap();
        assert!(device.reset_allocator(&mut allocator).is_err());

        queue.signal(1).unwrap();
        assert!(device.reset_allocator(&mut allocator).is_err());

        device.complete_up_to(1);
        device.reset_allocator(&mut allocator).unwrap();
    }

    #[test]
    fn test_manual_completion_clamps_to_signaled() {
        let device = HeadlessDevice::with_completion(CompletionMode::Manual);
        let queue = device.create_queue().unwrap();
        queue.signal(1).unwrap();

        device.complete_up_to(10);
        assert_eq!(queue.completed_value().unwrap(), 1);
        assert!(!queue.wait_for_value(2, Duration::from_millis(5)).unwrap());
        assert!(queue.wait_for_value(1, Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_signal_must_advance() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        queue.signal(2).unwrap();
        assert!(queue.signal(2).is_err());
    }

    #[test]
    fn test_compile_and_pipeline() {
        let device = HeadlessDevice::new();
        let bytecode = device.compile_shader(SOURCE, "CSMain", "cs_6_0").unwrap();
        assert!(bytecode.starts_with(b"DXBC"));
        assert_eq!(
            bytecode,
            device.compile_shader(SOURCE, "CSMain", "cs_6_0").unwrap()
        );
        assert_eq!(device.compile_count(), 2);

        let layout = computekit_codegen::plan_layout(&[]).unwrap();
        let pipeline = device.create_pipeline(&bytecode, "CSMain", &layout).unwrap();
        assert_eq!(pipeline.id.len(), 16);
        assert_eq!(pipeline.constant_size, 0);

        assert!(device.create_pipeline(b"junk", "CSMain", &layout).is_err());
    }

    #[test]
    fn test_compile_rejections() {
        let device = HeadlessDevice::new();
        assert!(matches!(
            device.compile_shader(SOURCE, "Main", "cs_6_0"),
            Err(NativeError::CompilationFailed(_))
        ));
        assert!(device.compile_shader(SOURCE, "CSMain", "ps_6_0").is_err());

        device.reject_sources_containing("numthreads");
        let err = device.compile_shader(SOURCE, "CSMain", "cs_6_0").unwrap_err();
        assert!(err.to_string().contains("numthreads"));
    }

    #[test]
    fn test_removal_fails_every_call() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        device.remove("TDR");

        assert_eq!(device.removed_reason().as_deref(), Some("TDR"));
        assert_eq!(
            queue.completed_value(),
            Err(NativeError::DeviceRemoved("TDR".to_string()))
        );
        assert!(device.create_allocator().is_err());
        assert!(queue.wait_for_value(1, Duration::from_millis(5)).is_err());
    }
}
