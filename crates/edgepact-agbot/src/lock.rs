//! Per-agreement mutual exclusion
//!
//! The worker pool processes many agreements in parallel but at most
//! one worker may act on a given agreement id at a time. The lock is
//! held across the read-decide-persist triple and released before any
//! network send.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Default)]
pub struct AgreementLockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgreementLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for an agreement id, created on first use.
    pub fn for_agreement(&self, agreement_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(agreement_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once an agreement is archived.
    pub fn remove(&self, agreement_id: &str) {
        self.locks.lock().remove(agreement_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_id_yields_the_same_lock() {
        let mgr = AgreementLockManager::new();
        let a = mgr.for_agreement("ag-1");
        let b = mgr.for_agreement("ag-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn at_most_one_holder_per_id() {
        let mgr = Arc::new(AgreementLockManager::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let lock = mgr.for_agreement("ag-1");
                let _guard = lock.lock().await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_contend() {
        let mgr = AgreementLockManager::new();
        let a = mgr.for_agreement("ag-1");
        let b = mgr.for_agreement("ag-2");
        let _ga = a.lock().await;
        // Would deadlock if ids shared a lock.
        let _gb = b.lock().await;
    }

    #[tokio::test]
    async fn removed_entries_are_recreated_fresh() {
        let mgr = AgreementLockManager::new();
        let _ = mgr.for_agreement("ag-1");
        mgr.remove("ag-1");
        assert_eq!(mgr.len(), 0);
        let _ = mgr.for_agreement("ag-1");
        assert_eq!(mgr.len(), 1);
    }
}
