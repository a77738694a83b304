use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::MatchingError;

/// Per-event exclusion for matching triggers within this process
///
/// Acquisition never waits: a second caller for the same event gets
/// `MatchingAlreadyInProgress` right away.
#[derive(Debug, Clone, Default)]
pub struct EventLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl EventLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, event_id: &str) -> Result<EventLockGuard, MatchingError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| MatchingError::Storage("event lock table poisoned".to_string()))?;

        if !held.insert(event_id.to_string()) {
            return Err(MatchingError::MatchingAlreadyInProgress(event_id.to_string()));
        }

        Ok(EventLockGuard {
            held: Arc::clone(&self.held),
            event_id: event_id.to_string(),
        })
    }
}

/// Releases the event when dropped
#[derive(Debug)]
pub struct EventLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    event_id: String,
}

impl Drop for EventLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.event_id);
        }
    }
}
