//! In-process registry of running conversations.
//!
//! The single gate for the global concurrency cap. A conversation is
//! `running` in the database iff it has an entry here; the two can only
//! disagree across a process restart, which startup reconciliation repairs.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

struct Inner {
    running: HashMap<Uuid, CancellationToken>,
    count: usize,
}

pub struct ExecutionManager {
    inner: Mutex<Inner>,
    max_concurrency: usize,
}

impl ExecutionManager {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };
        Self {
            inner: Mutex::new(Inner {
                running: HashMap::new(),
                count: 0,
            }),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn can_admit(&self) -> bool {
        self.inner.lock().count < self.max_concurrency
    }

    /// Take a slot for `conversation_id`, storing its cancel token.
    /// Refused when at capacity or when the conversation is already admitted.
    pub fn admit(&self, conversation_id: Uuid, cancel: CancellationToken) -> bool {
        let mut inner = self.inner.lock();
        if inner.count >= self.max_concurrency || inner.running.contains_key(&conversation_id) {
            return false;
        }
        inner.running.insert(conversation_id, cancel);
        inner.count += 1;
        true
    }

    pub fn release(&self, conversation_id: Uuid) {
        let mut inner = self.inner.lock();
        if inner.running.remove(&conversation_id).is_some() {
            inner.count -= 1;
        }
    }

    /// Fire the stored cancel token and free the slot. Returns false when the
    /// conversation is not registered.
    pub fn cancel(&self, conversation_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.running.remove(&conversation_id) {
            Some(token) => {
                token.cancel();
                inner.count -= 1;
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, conversation_id: Uuid) -> bool {
        self.inner.lock().running.contains_key(&conversation_id)
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().count
    }
}
