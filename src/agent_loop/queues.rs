//! Steering and follow-up message queues.
//!
//! Both queues are plain FIFO buffers behind a std mutex; they are touched
//! only from short non-async sections, so holding the lock across an await
//! never happens.

use crate::llm::Message;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// How many queued messages a single drain hands to the loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// Deliver the oldest message only; the rest stay queued for later
    /// drain points.
    #[default]
    OneAtATime,
    /// Deliver everything queued, oldest first.
    All,
}

/// FIFO queue of user messages waiting to enter history.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.lock().push_back(message);
    }

    /// Remove and return messages according to `mode`, oldest first.
    pub fn drain(&self, mode: DrainMode) -> Vec<Message> {
        let mut queue = self.lock();
        match mode {
            DrainMode::OneAtATime => queue.pop_front().into_iter().collect(),
            DrainMode::All => queue.drain(..).collect(),
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        // Poisoning only matters if a panic happened mid-mutation; every
        // mutation here is a single VecDeque call, so the data is intact.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
