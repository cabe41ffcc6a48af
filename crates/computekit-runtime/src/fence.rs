//! GPU/CPU synchronization tracking.
//!
//! Every submission is followed by a fence signal with a fresh
//! [`CompletionToken`]. Tokens are issued under a lock in strictly increasing
//! order starting at 1. The last value known to be complete is cached and only
//! ever moves forward, so most completion checks never touch the queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};
use crate::native::NativeQueue;

/// Fence value marking the completion of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionToken(u64);

impl CompletionToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw fence value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Issues completion tokens and tracks which ones the GPU has reached.
pub struct FenceTracker {
    /// Next value to signal. Held while signaling so values reach the queue in order.
    next: Mutex<u64>,
    /// Last value known to be complete.
    completed: AtomicU64,
    /// Default timeout for [`FenceTracker::wait`].
    timeout: Duration,
}

impl FenceTracker {
    /// Create a tracker whose waits give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            next: Mutex::new(1),
            completed: AtomicU64::new(0),
            timeout,
        }
    }

    /// Signal the queue and return the token for everything submitted so far.
    pub fn signal<Q: NativeQueue>(&self, queue: &Q) -> Result<CompletionToken> {
        let mut next = self.next.lock();
        let value = *next;
        queue.signal(value)?;
        *next += 1;
        tracing::trace!(token = value, "fence signaled");
        Ok(CompletionToken::new(value))
    }

    /// Last issued value, 0 before the first signal.
    #[must_use]
    pub fn last_issued(&self) -> u64 {
        *self.next.lock() - 1
    }

    /// Last value known to be complete, without querying the queue.
    #[must_use]
    pub fn last_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether a token is known complete, without querying the queue.
    #[must_use]
    pub fn is_known_complete(&self, token: CompletionToken) -> bool {
        token.0 <= self.last_completed()
    }

    /// Query the queue and advance the completed value.
    pub fn refresh<Q: NativeQueue>(&self, queue: &Q) -> Result<u64> {
        let observed = queue.completed_value()?;
        let previous = self.completed.fetch_max(observed, Ordering::AcqRel);
        Ok(previous.max(observed))
    }

    /// Whether the GPU has reached a token.
    pub fn is_complete<Q: NativeQueue>(&self, queue: &Q, token: CompletionToken) -> Result<bool> {
        self.check_issued(token)?;
        if self.is_known_complete(token) {
            return Ok(true);
        }
        Ok(token.0 <= self.refresh(queue)?)
    }

    /// Block until the GPU reaches a token, up to the configured timeout.
    pub fn wait<Q: NativeQueue>(&self, queue: &Q, token: CompletionToken) -> Result<()> {
        if self.wait_timeout(queue, token, self.timeout)? {
            Ok(())
        } else {
            Err(RuntimeError::FenceTimeout {
                token: token.0,
                completed: self.last_completed(),
            })
        }
    }

    /// Block until the GPU reaches a token. Returns `false` on timeout.
    pub fn wait_timeout<Q: NativeQueue>(
        &self,
        queue: &Q,
        token: CompletionToken,
        timeout: Duration,
    ) -> Result<bool> {
        if self.is_complete(queue, token)? {
            return Ok(true);
        }

        let started = Instant::now();
        let reached = queue.wait_for_value(token.0, timeout)?;
        self.refresh(queue)?;

        let waited = started.elapsed();
        if waited > Duration::from_millis(100) {
            tracing::warn!(token = token.0, waited_ms = waited.as_millis() as u64, "slow fence wait");
        }
        Ok(reached || self.is_known_complete(token))
    }

    /// Wait for every issued token.
    pub fn wait_idle<Q: NativeQueue>(&self, queue: &Q) -> Result<()> {
        match self.last_issued() {
            0 => Ok(()),
            last => self.wait(queue, CompletionToken::new(last)),
        }
    }

    fn check_issued(&self, token: CompletionToken) -> Result<()> {
        if token.0 == 0 || token.0 > self.last_issued() {
            return Err(RuntimeError::UnknownToken(token.0));
        }
        Ok(())
    }
}

impl fmt::Debug for FenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceTracker")
            .field("last_issued", &self.last_issued())
            .field("last_completed", &self.last_completed())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CompletionMode, HeadlessDevice};
    use crate::native::NativeDevice;
    use std::sync::Arc;
    use std::thread;

    fn manual_queue() -> (HeadlessDevice, <HeadlessDevice as NativeDevice>::Queue) {
        let device = HeadlessDevice::with_completion(CompletionMode::Manual);
        let queue = device.create_queue().unwrap();
        (device, queue)
    }

    #[test]
    fn test_tokens_start_at_one_and_increase() {
        let (_device, queue) = manual_queue();
        let tracker = FenceTracker::new(Duration::from_secs(1));

        assert_eq!(tracker.last_issued(), 0);
        let a = tracker.signal(&queue).unwrap();
        let b = tracker.signal(&queue).unwrap();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
        assert!(a < b);
        assert_eq!(tracker.last_issued(), 2);
    }

    #[test]
    fn test_completion_is_monotonic() {
        let (device, queue) = manual_queue();
        let tracker = FenceTracker::new(Duration::from_secs(1));

        let a = tracker.signal(&queue).unwrap();
        let b = tracker.signal(&queue).unwrap();
        assert!(!tracker.is_complete(&queue, a).unwrap());

        device.complete_up_to(1);
        assert!(tracker.is_complete(&queue, a).unwrap());
        assert!(!tracker.is_complete(&queue, b).unwrap());
        assert_eq!(tracker.last_completed(), 1);

        device.complete_all();
        assert!(tracker.is_complete(&queue, b).unwrap());
        assert_eq!(tracker.refresh(&queue).unwrap(), 2);
    }

    #[test]
    fn test_unknown_token() {
        let (_device, queue) = manual_queue();
        let tracker = FenceTracker::new(Duration::from_secs(1));

        let err = tracker
            .is_complete(&queue, CompletionToken::new(5))
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnknownToken(5));
    }

    #[test]
    fn test_wait_times_out() {
        let (_device, queue) = manual_queue();
        let tracker = FenceTracker::new(Duration::from_millis(20));

        let token = tracker.signal(&queue).unwrap();
        let err = tracker.wait(&queue, token).unwrap_err();
        assert!(matches!(err, RuntimeError::FenceTimeout { token: 1, completed: 0 }));
    }

    #[test]
    fn test_wait_returns_once_completed_elsewhere() {
        let (device, queue) = manual_queue();
        let tracker = Arc::new(FenceTracker::new(Duration::from_secs(5)));
        let token = tracker.signal(&queue).unwrap();

        let completer = {
            let device = device.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                device.complete_all();
            })
        };

        tracker.wait(&queue, token).unwrap();
        assert!(tracker.is_known_complete(token));
        completer.join().unwrap();
    }

    #[test]
    fn test_wait_idle() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let tracker = FenceTracker::new(Duration::from_secs(1));

        tracker.wait_idle(&queue).unwrap();
        tracker.signal(&queue).unwrap();
        tracker.signal(&queue).unwrap();
        tracker.wait_idle(&queue).unwrap();
        assert_eq!(tracker.last_completed(), 2);
    }
}
