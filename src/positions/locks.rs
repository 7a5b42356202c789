//! Per-position write locks.
//!
//! Recompute, lifecycle transitions, and admin overrides on the same
//! position must be mutually exclusive; positions of different owners stay
//! fully parallel. The registry hands out one async mutex per position id,
//! guarded by a parking_lot lock for the short map access.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct PositionLocks {
    inner: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the lock for a position id. The caller holds the
    /// returned mutex across its read-modify-write.
    pub fn for_position(&self, position_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock();
        map.entry(position_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the entry for a position that reached a terminal state. The
    /// Arc keeps any in-flight holder valid.
    pub fn release(&self, position_id: &str) {
        self.inner.lock().remove(position_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_position_same_lock() {
        let locks = PositionLocks::new();
        let a = locks.for_position("p-1");
        let b = locks.for_position("p-1");
        assert!(Arc::ptr_eq(&a, &b));

        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());
    }

    #[test]
    fn test_different_positions_independent() {
        let locks = PositionLocks::new();
        let a = locks.for_position("p-1");
        let b = locks.for_position("p-2");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
