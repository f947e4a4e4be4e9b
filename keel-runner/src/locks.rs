//! Per-server execution locks
//!
//! At most one command sequence runs against a server at a time, whichever
//! run or rollback it belongs to. Waiters queue in FIFO order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Registry of one async mutex per server id
#[derive(Debug, Default)]
pub struct ServerLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ServerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the server is free and claims it
    ///
    /// The claim is released when the returned guard is dropped.
    pub async fn acquire(&self, server_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(server_id.to_string()).or_default().clone()
        };
        if lock.try_lock().is_err() {
            debug!("Waiting for server {} to become free", server_id);
        }
        lock.lock_owned().await
    }

    /// Whether a server is currently claimed
    pub fn is_busy(&self, server_id: &str) -> bool {
        let locks = self.locks.lock().unwrap();
        locks
            .get(server_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
