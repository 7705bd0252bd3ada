use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Per-content-hash async locks.
///
/// Every status transition of a record happens while holding the lock for
/// its hash, so verify, merge and cancel never interleave on the same
/// identity. Chunk admission does not take it; it relies on exclusive
/// create and rename in the chunk directory. Entries are dropped once
/// nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Guard returned by [`RecordLocks::lock`].
pub struct HashGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, file_hash: &str) -> HashGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map holds entries with a strong count of 1.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(file_hash.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        HashGuard {
            _guard: lock.lock_owned().await,
        }
    }
}
