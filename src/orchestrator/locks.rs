//! Per-test-key mutual exclusion.
//!
//! Every read-modify-write of a key's state (start, stop, completion,
//! recovery) runs under that key's lock. Different keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// Idle entries are swept once the table grows past this size.
const SWEEP_THRESHOLD: usize = 256;

#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if table.len() >= SWEEP_THRESHOLD {
                // only the table holds these, so nobody is waiting on them
                table.retain(|_, m| Arc::strong_count(m) > 1);
            }
            table.entry(key.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
