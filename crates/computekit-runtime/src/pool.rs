//! Command list pool.
//!
//! A fixed-capacity arena of [`CompiledCommandList`] slots with a recycle
//! pointer. A lent list is moved out of its slot until it comes back through
//! [`CommandListPool::reclaim`] or [`CommandListPool::release`], so exactly one
//! owner records into it at a time.
//!
//! A slot is reusable when it never submitted or the fence has reached its last
//! token. The pool grows lazily up to its capacity; past that, `acquire` waits
//! for the oldest in-flight token, bounded by the acquire timeout.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::command_list::{CompiledCommandList, LifecycleViolation, ListState};
use crate::error::{Result, RuntimeError};
use crate::fence::{CompletionToken, FenceTracker};
use crate::native::{NativeDevice, NativeQueue};

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of slots.
    pub capacity: usize,
    /// Slots created so far.
    pub created: usize,
    /// Slots currently parked in the pool.
    pub available: usize,
    /// Slots currently lent out.
    pub lent: usize,
    /// Successful acquisitions.
    pub acquires: u64,
    /// Acquisitions that had to wait.
    pub waits: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandListPool: {}/{} slots, {} available, {} lent, {} acquires, {} waits, {} timeouts",
            self.created,
            self.capacity,
            self.available,
            self.lent,
            self.acquires,
            self.waits,
            self.timeouts
        )
    }
}

struct PoolInner<D: NativeDevice> {
    /// `None` while the slot's list is lent out.
    slots: Vec<Option<CompiledCommandList<D>>>,
    recycle: usize,
    /// Bumped on invalidation so stale lists are recognized.
    generation: u64,
    lost: Option<String>,
    acquires: u64,
    waits: u64,
    timeouts: u64,
}

impl<D: NativeDevice> PoolInner<D> {
    fn poison(&mut self, reason: &str) {
        if self.lost.is_none() {
            self.lost = Some(reason.to_string());
        }
        self.generation += 1;
        self.recycle = 0;
        let dropped = self.slots.len();
        self.slots.clear();
        tracing::info!(dropped, reason, "command list pool invalidated");
    }
}

/// Pool of command lists bounded by the number allowed in flight.
pub struct CommandListPool<D: NativeDevice> {
    device: Arc<D>,
    queue: Arc<D::Queue>,
    tracker: Arc<FenceTracker>,
    capacity: usize,
    acquire_timeout: Duration,
    inner: Mutex<PoolInner<D>>,
    returned: Condvar,
    /// Keeps execute and signal adjacent on the queue.
    submit_lock: Mutex<()>,
}

impl<D: NativeDevice> CommandListPool<D> {
    /// Create an empty pool. Slots are created on demand.
    pub fn new(
        device: Arc<D>,
        queue: Arc<D::Queue>,
        tracker: Arc<FenceTracker>,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            device,
            queue,
            tracker,
            capacity,
            acquire_timeout,
            inner: Mutex::new(PoolInner {
                slots: Vec::with_capacity(capacity),
                recycle: 0,
                generation: 0,
                lost: None,
                acquires: 0,
                waits: 0,
                timeouts: 0,
            }),
            returned: Condvar::new(),
            submit_lock: Mutex::new(()),
        }
    }

    /// Maximum number of lists.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a list that is reset and open for recording.
    pub fn acquire(&self) -> Result<CompiledCommandList<D>> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut inner = self.inner.lock();
        let mut waited = false;

        loop {
            if let Some(reason) = &inner.lost {
                return Err(RuntimeError::DeviceLost(reason.clone()));
            }
            if let Some(reason) = self.device.removed_reason() {
                inner.poison(&reason);
                self.returned.notify_all();
                return Err(RuntimeError::DeviceLost(reason));
            }

            let completed = match self.tracker.refresh(&*self.queue) {
                Ok(value) => value,
                Err(err) => return Err(self.fail(&mut inner, err)),
            };

            if let Some(list) = self.take_reusable(&mut inner, completed)? {
                inner.acquires += 1;
                return Ok(list);
            }

            let created = inner.slots.len();
            if created < self.capacity {
                let list = match CompiledCommandList::create(&*self.device, created, inner.generation) {
                    Ok(list) => list,
                    Err(err) => return Err(self.fail(&mut inner, err)),
                };
                inner.slots.push(None);
                inner.acquires += 1;
                tracing::debug!(slot = created, capacity = self.capacity, "command list created");
                return Ok(list);
            }

            let now = Instant::now();
            if now >= deadline {
                inner.timeouts += 1;
                let waited = now - started;
                tracing::warn!(
                    waited_ms = waited.as_millis() as u64,
                    in_flight = created,
                    "command list acquire timed out"
                );
                return Err(RuntimeError::AcquireTimeout {
                    waited,
                    in_flight: created,
                });
            }
            if !waited {
                inner.waits += 1;
                waited = true;
            }

            let oldest = inner
                .slots
                .iter()
                .flatten()
                .filter_map(CompiledCommandList::last_token)
                .filter(|token| token.value() > completed)
                .min();

            match oldest {
                Some(token) => {
                    tracing::trace!(token = token.value(), "acquire waiting for fence");
                    let remaining = deadline - now;
                    let result = MutexGuard::unlocked(&mut inner, || {
                        self.tracker.wait_timeout(&*self.queue, token, remaining)
                    });
                    if let Err(err) = result {
                        return Err(self.fail(&mut inner, err));
                    }
                }
                None => {
                    // Every slot is lent out; wait for one to come back.
                    self.returned.wait_until(&mut inner, deadline);
                }
            }
        }
    }

    /// Find a parked slot whose work is complete, starting at the recycle pointer.
    fn take_reusable(
        &self,
        inner: &mut PoolInner<D>,
        completed: u64,
    ) -> Result<Option<CompiledCommandList<D>>> {
        let count = inner.slots.len();
        for step in 0..count {
            let index = (inner.recycle + step) % count;
            let ready = matches!(
                &inner.slots[index],
                Some(list) if list.last_token().map_or(true, |token| token.value() <= completed)
            );
            if !ready {
                continue;
            }
            let Some(mut list) = inner.slots[index].take() else {
                continue;
            };
            inner.recycle = (index + 1) % count;

            if let Err(err) = list.reset(&*self.device, &self.tracker, &*self.queue) {
                inner.slots[index] = Some(list);
                return Err(self.fail(inner, err));
            }
            tracing::debug!(slot = index, "command list recycled");
            return Ok(Some(list));
        }
        Ok(None)
    }

    /// Execute a closed list and signal its completion token.
    pub fn submit(&self, list: &mut CompiledCommandList<D>) -> Result<CompletionToken> {
        list.check_submittable()?;

        let ordered = self.submit_lock.lock();
        let token = self
            .queue
            .execute(list.native())
            .map_err(RuntimeError::from)
            .and_then(|()| self.tracker.signal(&*self.queue));
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                drop(ordered);
                let mut inner = self.inner.lock();
                return Err(self.fail(&mut inner, err));
            }
        };
        list.mark_submitted(token);
        tracing::trace!(slot = list.slot(), token = token.value(), "command list submitted");
        Ok(token)
    }

    /// Return a submitted list along with the token of its submission.
    pub fn reclaim(&self, list: CompiledCommandList<D>, token: CompletionToken) -> Result<()> {
        let violation = match list.state() {
            ListState::Submitted(submitted) if submitted == token => None,
            ListState::Submitted(submitted) => Some(format!(
                "list was submitted as {submitted}, not {token}"
            )),
            state => Some(format!("list is {state}; reclaim expects a submitted list")),
        };
        let slot = list.slot();
        self.park(list, "reclaim")?;

        match violation {
            Some(reason) => Err(LifecycleViolation::new(slot, "reclaim", reason).into()),
            None => {
                tracing::trace!(slot, token = token.value(), "command list reclaimed");
                Ok(())
            }
        }
    }

    /// Return a list without submitting it.
    pub fn release(&self, list: CompiledCommandList<D>) -> Result<()> {
        self.park(list, "release")
    }

    fn park(&self, mut list: CompiledCommandList<D>, operation: &'static str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.lost {
            return Err(RuntimeError::DeviceLost(reason.clone()));
        }

        let slot = list.slot();
        let owned = list.generation() == inner.generation
            && inner.slots.get(slot).is_some_and(Option::is_none);
        if !owned {
            return Err(LifecycleViolation::new(
                slot,
                operation,
                "list does not belong to this pool or was already returned",
            )
            .into());
        }

        let closed = list.abandon(&*self.device);
        inner.slots[slot] = Some(list);
        self.returned.notify_one();
        closed.map_err(|err| self.fail(&mut inner, err))
    }

    /// Drop every list and refuse further acquisitions.
    pub fn invalidate(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.poison(reason);
        self.returned.notify_all();
    }

    /// Whether the pool was invalidated by device loss.
    pub fn is_lost(&self) -> bool {
        self.inner.lock().lost.is_some()
    }

    fn fail(&self, inner: &mut PoolInner<D>, err: RuntimeError) -> RuntimeError {
        if let RuntimeError::DeviceLost(reason) = &err {
            inner.poison(reason);
            self.returned.notify_all();
        }
        err
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let available = inner.slots.iter().filter(|slot| slot.is_some()).count();
        PoolStats {
            capacity: self.capacity,
            created: inner.slots.len(),
            available,
            lent: inner.slots.len() - available,
            acquires: inner.acquires,
            waits: inner.waits,
            timeouts: inner.timeouts,
        }
    }
}

impl<D: NativeDevice> Drop for CommandListPool<D> {
    fn drop(&mut self) {
        if self.inner.get_mut().lost.is_some() {
            return;
        }
        if let Err(err) = self.tracker.wait_idle(&*self.queue) {
            tracing::warn!(error = %err, "command list pool dropped with work in flight");
        }
    }
}

impl<D: NativeDevice> fmt::Debug for CommandListPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandListPool")
            .field("stats", &self.stats())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}
