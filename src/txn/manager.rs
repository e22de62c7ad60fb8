//! Transaction Manager
//!
//! Allocates transaction and commit ids, tracks which engines each
//! transaction has touched, and drives commit and revert across all of them.
//! There is no ambient global manager: every engine receives its manager at
//! construction.
//!
//! Ids are derived from wall-clock milliseconds with a monotonic guard
//! (`max(now, last + 1)`), so ids stay strictly increasing even under clock
//! skew, and a commit id is always greater than the transaction id it
//! belongs to.
//!
//! Open-transaction state is journalled to disk (when a journal path is
//! configured) so that after a crash, every transaction without a commit
//! record can be reverted against the engines it may have touched.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::Engine;
use crate::storage::mvcc::UNCOMMITTED;
use crate::txn::{TransactionOptions, TransactionStatus};
use crate::{now_ms, Result, XFlatError};

// ============================================================================
// Transaction Record
// ============================================================================

/// Shared state of one transaction, visible to the engines it touches.
pub struct TransactionRecord {
    pub transaction_id: i64,
    commit_id: AtomicI64,
    status: Mutex<TransactionStatus>,
    revert_only: AtomicBool,
    options: TransactionOptions,
    owner: ThreadId,
    /// Engines this transaction has written through.
    bound: Mutex<Vec<Weak<dyn Engine>>>,
}

impl TransactionRecord {
    /// The commit id, or -1 while uncommitted.
    pub fn commit_id(&self) -> i64 {
        self.commit_id.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }
}

// ============================================================================
// Transaction Handle
// ============================================================================

/// A transaction held by user code. Bound to the thread that began it; a
/// handle that is dropped while still open reverts the transaction.
pub struct Transaction {
    record: Arc<TransactionRecord>,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    pub fn transaction_id(&self) -> i64 {
        self.record.transaction_id
    }

    /// The commit id, or -1 until committed.
    pub fn commit_id(&self) -> i64 {
        self.record.commit_id()
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.record.options
    }

    pub fn is_committed(&self) -> bool {
        self.record.status() == TransactionStatus::Committed
    }

    pub fn is_reverted(&self) -> bool {
        self.record.status() == TransactionStatus::Reverted
    }

    /// Mark the transaction revert-only: it continues as normal but commit
    /// fails with an illegal-state error.
    pub fn set_revert_only(&self) {
        self.record.revert_only.store(true, Ordering::SeqCst);
    }

    /// Commit against every engine this transaction touched. On an engine
    /// error the transaction is reverted everywhere and the error returned.
    pub fn commit(&mut self) -> Result<()> {
        self.manager.commit_transaction(&self.record)
    }

    /// Revert immediately.
    pub fn revert(&mut self) -> Result<()> {
        self.manager.revert_transaction(&self.record, false)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.record.status() == TransactionStatus::Open {
            if let Err(err) = self.manager.revert_transaction(&self.record, false) {
                warn!(
                    tx = self.record.transaction_id,
                    "failed to revert transaction on drop: {err}"
                );
            }
        }
    }
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    open: Vec<i64>,
    committed: Vec<(i64, i64)>,
    reverted: Vec<i64>,
}

// ============================================================================
// Transaction Manager
// ============================================================================

/// Central coordinator for transactions across engines.
pub struct TransactionManager {
    last_id: AtomicI64,
    open: RwLock<HashMap<i64, Arc<TransactionRecord>>>,
    by_thread: Mutex<HashMap<ThreadId, i64>>,
    committed: RwLock<HashMap<i64, i64>>,
    reverted: RwLock<HashSet<i64>>,
    /// Transactions found open in the journal at startup, pending recovery.
    unrecovered: Mutex<Vec<i64>>,
    journal: Option<Mutex<PathBuf>>,
}

impl TransactionManager {
    /// Create a manager, reloading journalled state when a journal path is
    /// given and the file exists.
    pub fn new(journal: Option<PathBuf>) -> Result<Self> {
        let mut committed = HashMap::new();
        let mut reverted = HashSet::new();
        let mut unrecovered = Vec::new();
        let mut max_seen = 0i64;

        if let Some(path) = &journal {
            if path.exists() {
                let bytes = std::fs::read(path)?;
                let loaded: Journal = bincode::deserialize(&bytes)
                    .map_err(|e| XFlatError::Internal(format!("corrupt transaction journal: {e}")))?;
                for (tx, commit) in loaded.committed {
                    max_seen = max_seen.max(commit);
                    committed.insert(tx, commit);
                }
                for tx in loaded.reverted {
                    max_seen = max_seen.max(tx);
                    reverted.insert(tx);
                }
                for tx in loaded.open {
                    max_seen = max_seen.max(tx);
                    unrecovered.push(tx);
                }
            }
        }

        Ok(Self {
            last_id: AtomicI64::new(max_seen.max(now_ms())),
            open: RwLock::new(HashMap::new()),
            by_thread: Mutex::new(HashMap::new()),
            committed: RwLock::new(committed),
            reverted: RwLock::new(reverted),
            unrecovered: Mutex::new(unrecovered),
            journal: journal.map(Mutex::new),
        })
    }

    /// Allocate the next globally ordered id. Time-based, with a guard that
    /// keeps the sequence strictly increasing under clock skew.
    fn next_id(&self) -> i64 {
        loop {
            let now = now_ms();
            let last = self.last_id.load(Ordering::SeqCst);
            let candidate = now.max(last + 1);
            if self
                .last_id
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    // ========================================================================
    // Transaction Lifecycle
    // ========================================================================

    /// Begin a transaction bound to the calling thread.
    pub fn begin(self: &Arc<Self>, options: TransactionOptions) -> Result<Transaction> {
        let owner = thread::current().id();
        if self.by_thread.lock().contains_key(&owner) {
            return Err(XFlatError::IllegalTransactionState(
                "a transaction is already open on this thread".to_string(),
            ));
        }

        let transaction_id = self.next_id();
        let record = Arc::new(TransactionRecord {
            transaction_id,
            commit_id: AtomicI64::new(UNCOMMITTED),
            status: Mutex::new(TransactionStatus::Open),
            revert_only: AtomicBool::new(false),
            options,
            owner,
            bound: Mutex::new(Vec::new()),
        });

        self.open.write().insert(transaction_id, record.clone());
        self.by_thread.lock().insert(owner, transaction_id);
        self.write_journal()?;

        debug!(tx = transaction_id, "transaction opened");
        Ok(Transaction {
            record,
            manager: Arc::clone(self),
        })
    }

    pub(crate) fn commit_transaction(&self, record: &Arc<TransactionRecord>) -> Result<()> {
        match record.status() {
            TransactionStatus::Open => {}
            TransactionStatus::Committed => {
                return Err(XFlatError::IllegalTransactionState(
                    "transaction has already been committed".to_string(),
                ))
            }
            TransactionStatus::Reverted => {
                return Err(XFlatError::IllegalTransactionState(
                    "transaction has already been reverted".to_string(),
                ))
            }
        }
        if record.revert_only.load(Ordering::SeqCst) {
            return Err(XFlatError::IllegalTransactionState(
                "transaction is revert-only".to_string(),
            ));
        }

        let commit_id = self.next_id();
        record.commit_id.store(commit_id, Ordering::SeqCst);

        let engines: Vec<Arc<dyn Engine>> = record
            .bound
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for engine in &engines {
            if let Err(err) =
                engine.commit(record.transaction_id, commit_id, &record.options)
            {
                warn!(
                    tx = record.transaction_id,
                    table = engine.table_name(),
                    "commit rejected, reverting transaction everywhere: {err}"
                );
                let _ = self.revert_transaction(record, false);
                return Err(err);
            }
        }

        *record.status.lock() = TransactionStatus::Committed;
        self.committed
            .write()
            .insert(record.transaction_id, commit_id);
        self.open.write().remove(&record.transaction_id);
        self.release_thread(record);
        self.write_journal()?;

        debug!(tx = record.transaction_id, commit = commit_id, "transaction committed");
        Ok(())
    }

    pub(crate) fn revert_transaction(
        &self,
        record: &Arc<TransactionRecord>,
        recovering: bool,
    ) -> Result<()> {
        {
            let mut status = record.status.lock();
            if *status != TransactionStatus::Open {
                return Ok(());
            }
            *status = TransactionStatus::Reverted;
        }
        record.commit_id.store(UNCOMMITTED, Ordering::SeqCst);

        let engines: Vec<Arc<dyn Engine>> = record
            .bound
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for engine in &engines {
            if let Err(err) = engine.revert(record.transaction_id, recovering) {
                warn!(
                    tx = record.transaction_id,
                    table = engine.table_name(),
                    "engine failed to revert: {err}"
                );
            }
        }

        self.reverted.write().insert(record.transaction_id);
        self.open.write().remove(&record.transaction_id);
        self.release_thread(record);
        self.write_journal()?;

        debug!(tx = record.transaction_id, "transaction reverted");
        Ok(())
    }

    fn release_thread(&self, record: &TransactionRecord) {
        let mut by_thread = self.by_thread.lock();
        if by_thread.get(&record.owner) == Some(&record.transaction_id) {
            by_thread.remove(&record.owner);
        }
    }

    // ========================================================================
    // Contract consumed by engines
    // ========================================================================

    /// The open transaction bound to the calling thread, if any.
    pub fn current_transaction(&self) -> Option<Arc<TransactionRecord>> {
        let id = *self.by_thread.lock().get(&thread::current().id())?;
        self.open.read().get(&id).cloned()
    }

    /// A fresh globally ordered id for a transactionless (auto-commit) write.
    pub fn transactionless_commit_id(&self) -> i64 {
        self.next_id()
    }

    pub fn any_open_transactions(&self) -> bool {
        !self.open.read().is_empty()
    }

    /// Whether any open transaction's id lies in the half-open window
    /// `[lower, upper)`. Used by row cleanup to decide observability.
    pub fn any_open_in_range(&self, lower: i64, upper: i64) -> bool {
        self.open
            .read()
            .keys()
            .any(|id| lower <= *id && *id < upper)
    }

    /// The commit id of a transaction, or -1 if it has no commit record.
    pub fn is_transaction_committed(&self, tx_id: i64) -> i64 {
        self.committed
            .read()
            .get(&tx_id)
            .copied()
            .unwrap_or(UNCOMMITTED)
    }

    pub fn is_transaction_reverted(&self, tx_id: i64) -> bool {
        self.reverted.read().contains(&tx_id)
    }

    /// Record that `engine` has data written by `record`'s transaction, so
    /// commit and revert reach it.
    pub fn bind_engine(&self, record: &TransactionRecord, engine: Weak<dyn Engine>) {
        let mut bound = record.bound.lock();
        if !bound.iter().any(|w| Weak::ptr_eq(w, &engine)) {
            bound.push(engine);
        }
    }

    /// Drop `engine`'s binding from every open transaction except the given
    /// ones. Engines call this after a cleanup pass once no version of the
    /// other transactions remains in their cache.
    pub fn unbind_engine_except_from(&self, engine: &Weak<dyn Engine>, keep: &HashSet<i64>) {
        for (id, record) in self.open.read().iter() {
            if keep.contains(id) {
                continue;
            }
            record.bound.lock().retain(|w| !Weak::ptr_eq(w, engine));
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Revert every journalled transaction that lacks a commit record
    /// against the given engines. Called once after a crash, with the
    /// affected engines spun up.
    pub fn recover(&self, engines: &[Arc<dyn Engine>]) -> Result<()> {
        let pending = std::mem::take(&mut *self.unrecovered.lock());
        for tx_id in pending {
            if self.is_transaction_committed(tx_id) != UNCOMMITTED {
                continue;
            }
            warn!(tx = tx_id, "recovering unfinished transaction");
            for engine in engines {
                engine.revert(tx_id, true)?;
            }
            self.reverted.write().insert(tx_id);
        }
        self.write_journal()
    }

    fn write_journal(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let path = journal.lock();

        let mut open: Vec<i64> = self.open.read().keys().copied().collect();
        open.extend(self.unrecovered.lock().iter().copied());
        let journal = Journal {
            open,
            committed: self
                .committed
                .read()
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
            reverted: self.reverted.read().iter().copied().collect(),
        };

        let bytes = bincode::serialize(&journal)
            .map_err(|e| XFlatError::Internal(format!("cannot serialize transaction journal: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&*path, bytes)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new(None).unwrap())
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mgr = manager();
        let mut last = 0;
        for _ in 0..100 {
            let id = mgr.transactionless_commit_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_commit_id_exceeds_transaction_id() {
        let mgr = manager();
        let mut tx = mgr.begin(TransactionOptions::default()).unwrap();
        let tx_id = tx.transaction_id();
        tx.commit().unwrap();
        assert!(tx.commit_id() > tx_id);
        assert_eq!(mgr.is_transaction_committed(tx_id), tx.commit_id());
    }

    #[test]
    fn test_current_transaction_is_thread_bound() {
        let mgr = manager();
        assert!(mgr.current_transaction().is_none());

        let tx = mgr.begin(TransactionOptions::default()).unwrap();
        assert_eq!(
            mgr.current_transaction().unwrap().transaction_id,
            tx.transaction_id()
        );

        let mgr2 = Arc::clone(&mgr);
        std::thread::spawn(move || {
            assert!(mgr2.current_transaction().is_none());
        })
        .join()
        .unwrap();

        drop(tx);
        assert!(mgr.current_transaction().is_none());
    }

    #[test]
    fn test_one_transaction_per_thread() {
        let mgr = manager();
        let _tx = mgr.begin(TransactionOptions::default()).unwrap();
        assert!(matches!(
            mgr.begin(TransactionOptions::default()),
            Err(XFlatError::IllegalTransactionState(_))
        ));
    }

    #[test]
    fn test_drop_reverts_open_transaction() {
        let mgr = manager();
        let tx_id = {
            let tx = mgr.begin(TransactionOptions::default()).unwrap();
            tx.transaction_id()
        };
        assert!(mgr.is_transaction_reverted(tx_id));
        assert!(!mgr.any_open_transactions());
    }

    #[test]
    fn test_revert_only_blocks_commit() {
        let mgr = manager();
        let mut tx = mgr.begin(TransactionOptions::default()).unwrap();
        tx.set_revert_only();
        assert!(matches!(
            tx.commit(),
            Err(XFlatError::IllegalTransactionState(_))
        ));
        tx.revert().unwrap();
    }

    #[test]
    fn test_double_commit_rejected() {
        let mgr = manager();
        let mut tx = mgr.begin(TransactionOptions::default()).unwrap();
        tx.commit().unwrap();
        assert!(matches!(
            tx.commit(),
            Err(XFlatError::IllegalTransactionState(_))
        ));
    }

    #[test]
    fn test_open_range_scan() {
        let mgr = manager();
        let tx = mgr.begin(TransactionOptions::default()).unwrap();
        let id = tx.transaction_id();

        assert!(mgr.any_open_in_range(id, id + 1));
        assert!(mgr.any_open_in_range(id - 10, id + 10));
        assert!(!mgr.any_open_in_range(id + 1, id + 100));
        assert!(!mgr.any_open_in_range(id - 100, id));
    }

    #[test]
    fn test_journal_recovery_marks_unfinished_reverted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.journal");

        let abandoned = {
            let mgr = Arc::new(TransactionManager::new(Some(path.clone())).unwrap());
            let tx = mgr.begin(TransactionOptions::default()).unwrap();
            let id = tx.transaction_id();
            // simulate a crash: the handle never commits or reverts
            std::mem::forget(tx);
            id
        };

        let mgr = Arc::new(TransactionManager::new(Some(path)).unwrap());
        assert!(!mgr.is_transaction_reverted(abandoned));
        mgr.recover(&[]).unwrap();
        assert!(mgr.is_transaction_reverted(abandoned));
    }

    #[test]
    fn test_journal_survives_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.journal");

        let (tx_id, commit_id) = {
            let mgr = Arc::new(TransactionManager::new(Some(path.clone())).unwrap());
            let mut tx = mgr.begin(TransactionOptions::default()).unwrap();
            tx.commit().unwrap();
            (tx.transaction_id(), tx.commit_id())
        };

        let mgr = Arc::new(TransactionManager::new(Some(path)).unwrap());
        assert_eq!(mgr.is_transaction_committed(tx_id), commit_id);
    }
}
