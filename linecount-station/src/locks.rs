//! Per-line ordering locks
//!
//! Admission, pairing, plan transitions and increment application for one line
//! run under that line's lock. Lines never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct LineLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a line
    pub async fn lock(&self, line: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(line.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}
