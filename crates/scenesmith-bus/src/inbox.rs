use std::collections::VecDeque;
use std::time::{Duration, Instant};

use scenesmith_types::{Message, Priority};
use tokio::sync::{Mutex, Notify};

use crate::error::{BusError, Result};

const PRIORITY_LEVELS: usize = 4;

fn priority_index(p: Priority) -> usize {
    p as usize
}

struct InboxState {
    queues: [VecDeque<Message>; PRIORITY_LEVELS],
}

impl InboxState {
    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

/// A single role's bounded priority inbox (spec.md §4.3), shared across every
/// worker in that role's pool. Workers race to `pop`; whichever wakes first
/// takes the next message, which is the load-balancing behavior the spec
/// asks for without needing a separate round-robin cursor.
pub struct Inbox {
    capacity: usize,
    state: Mutex<InboxState>,
    not_empty: Notify,
    not_full: Notify,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(InboxState {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new()],
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Enqueues `msg`, waiting for room up to `wait`. A zero `wait` fails
    /// immediately without enqueuing when the inbox is already full
    /// (testable property 9).
    pub async fn push(&self, msg: Message, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                if state.len() < self.capacity {
                    state.queues[priority_index(msg.priority)].push_back(msg);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            if wait.is_zero() {
                return Err(BusError::BackpressureTimeout);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BusError::BackpressureTimeout);
            }
            let notified = self.not_full.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(BusError::BackpressureTimeout);
            }
        }
    }

    /// Dequeues the highest-priority, oldest-arrival message, blocking until
    /// one is available. Callers that need cancellation race this against a
    /// cancellation token with `tokio::select!`.
    pub async fn pop(&self) -> Message {
        loop {
            {
                let mut state = self.state.lock().await;
                for level in (0..PRIORITY_LEVELS).rev() {
                    if let Some(msg) = state.queues[level].pop_front() {
                        drop(state);
                        self.not_full.notify_one();
                        return msg;
                    }
                }
            }
            self.not_empty.notified().await;
        }
    }
}
