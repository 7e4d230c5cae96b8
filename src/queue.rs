//! Per-camera transfer queue.
//!
//! One `TransferQueue` sits between each capture worker and the compositor.
//! It decouples the camera's capture rate from the compositor's collection rate:
//!
//! - exactly one producer (the camera's worker) pushes
//! - exactly one consumer (the compositor) pops
//! - push, pop and the emptiness check all take the same lock
//!
//! Capacity is bounded. What happens when a slow consumer lets the queue fill
//! up is decided by `OverflowPolicy`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::frame::FrameEnvelope;

/// Default number of envelopes buffered per camera.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Behaviour of `push` on a full queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest envelope. The producer never blocks.
    #[default]
    DropOldest,
    /// Wait up to `timeout` for the consumer to make room, then drop the new envelope.
    Block { timeout: Duration },
}

/// Queue sizing and overflow behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Result of a `push`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest envelope.
    EvictedOldest,
    /// Queue stayed full for the whole block timeout; the new envelope was dropped.
    Rejected,
}

/// Counters for one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub len: usize,
}

struct QueueState {
    items: VecDeque<FrameEnvelope>,
    pushed: u64,
    popped: u64,
    dropped: u64,
}

/// Bounded FIFO of `FrameEnvelope`s, shared by one producer and one consumer.
pub struct TransferQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl TransferQueue {
    /// A capacity of zero is raised to one.
    pub fn new(config: QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                pushed: 0,
                popped: 0,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            overflow: config.overflow,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Move `envelope` to the tail of the queue and wake one waiting consumer.
    pub fn push(&self, envelope: FrameEnvelope) -> PushOutcome {
        let mut state = self.lock();
        let mut outcome = PushOutcome::Queued;

        if state.items.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    state.dropped += 1;
                    outcome = PushOutcome::EvictedOldest;
                }
                OverflowPolicy::Block { timeout } => {
                    let capacity = self.capacity;
                    let (guard, _) = self
                        .not_full
                        .wait_timeout_while(state, timeout, |s| s.items.len() >= capacity)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    if state.items.len() >= self.capacity {
                        state.dropped += 1;
                        return PushOutcome::Rejected;
                    }
                }
            }
        }

        state.items.push_back(envelope);
        state.pushed += 1;
        drop(state);
        self.not_empty.notify_one();
        outcome
    }

    /// Remove the head envelope if there is one. Never waits.
    pub fn try_pop(&self) -> Option<FrameEnvelope> {
        let mut state = self.lock();
        let envelope = state.items.pop_front()?;
        state.popped += 1;
        drop(state);
        self.not_full.notify_one();
        Some(envelope)
    }

    /// Remove the head envelope, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameEnvelope> {
        let state = self.lock();
        let (mut state, _) = self
            .not_empty
            .wait_timeout_while(state, timeout, |s| s.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let envelope = state.items.pop_front()?;
        state.popped += 1;
        drop(state);
        self.not_full.notify_one();
        Some(envelope)
    }

    /// Point-in-time snapshot; may be stale as soon as it returns.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pushed: state.pushed,
            popped: state.popped,
            dropped: state.dropped,
            len: state.items.len(),
        }
    }

    // No holder leaves the deque half-updated, so poisoning is recoverable.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
