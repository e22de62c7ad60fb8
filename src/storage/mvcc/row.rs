//! Row version store
//!
//! Each row owns a map from transaction id to version cell. The row's mutex
//! serialises all writes to the row; the engine's table lock is only needed
//! to physically remove a row from the cache.

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};
use xmltree::Element;

use crate::txn::TransactionManager;

/// Commit id of a version whose transaction has not committed yet.
pub const UNCOMMITTED: i64 = -1;

// ============================================================================
// Row Data (version cell)
// ============================================================================

/// A single version of a row.
#[derive(Debug, Clone)]
pub struct RowData {
    /// Id of the transaction that wrote this version; also the map key.
    pub transaction_id: i64,
    /// The transaction's commit id, or [`UNCOMMITTED`] while it is open.
    pub commit_id: i64,
    /// The stored element, or `None` for a tombstone marking deletion.
    pub element: Option<Element>,
    /// Back-reference for matching and diagnostics.
    pub row_id: String,
}

impl RowData {
    pub fn new(transaction_id: i64, element: Option<Element>, row_id: &str) -> Self {
        Self {
            transaction_id,
            commit_id: UNCOMMITTED,
            element,
            row_id: row_id.to_string(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.element.is_none()
    }

    pub fn is_committed(&self) -> bool {
        self.commit_id != UNCOMMITTED
    }
}

// ============================================================================
// Version Chain
// ============================================================================

/// The versions of one row, keyed by writing transaction id.
#[derive(Debug, Default)]
pub struct VersionChain(BTreeMap<i64, RowData>);

impl VersionChain {
    /// Choose the version a reader should observe.
    ///
    /// 1. A reader inside a transaction always sees its own write.
    /// 2. Otherwise the newest committed version with
    ///    `commit_id <= cap` and `commit_id <= tx_id` (when present) wins.
    /// 3. A tombstone is a valid result; callers treat it as "no row".
    pub fn visible(&self, tx_id: Option<i64>, cap: i64) -> Option<&RowData> {
        if let Some(tx_id) = tx_id {
            if let Some(own) = self.0.get(&tx_id) {
                return Some(own);
            }
        }

        let tx_cap = tx_id.unwrap_or(i64::MAX);
        self.0
            .values()
            .filter(|v| v.is_committed() && v.commit_id <= cap && v.commit_id <= tx_cap)
            .max_by_key(|v| v.commit_id)
    }

    /// Install a version, replacing any prior version by the same transaction.
    pub fn put(&mut self, data: RowData) {
        self.0.insert(data.transaction_id, data);
    }

    pub fn get(&self, tx_id: i64) -> Option<&RowData> {
        self.0.get(&tx_id)
    }

    pub fn get_mut(&mut self, tx_id: i64) -> Option<&mut RowData> {
        self.0.get_mut(&tx_id)
    }

    pub fn remove(&mut self, tx_id: i64) -> Option<RowData> {
        self.0.remove(&tx_id)
    }

    pub fn values(&self) -> impl Iterator<Item = &RowData> {
        self.0.values()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.0.values().any(|v| !v.is_committed())
    }

    /// Discard versions no transaction can ever observe again: a committed
    /// version is dead once a strictly newer committed version exists and no
    /// open transaction began inside the half-open commit window between
    /// them.
    ///
    /// Returns true when the chain is down to tombstones (or nothing), which
    /// makes the row eligible for physical removal under the table lock.
    pub fn prune(&mut self, transactions: &TransactionManager) -> bool {
        let mut committed: Vec<(i64, i64)> = self
            .0
            .values()
            .filter(|v| v.is_committed())
            .map(|v| (v.commit_id, v.transaction_id))
            .collect();
        committed.sort_unstable();

        for pair in committed.windows(2) {
            let (older_commit, key) = pair[0];
            let newer_commit = pair[1].0;
            if !transactions.any_open_in_range(older_commit, newer_commit) {
                self.0.remove(&key);
            }
        }

        self.0
            .values()
            .all(|v| v.is_committed() && v.is_tombstone())
    }
}

// ============================================================================
// Row
// ============================================================================

/// A row in the cache: an id plus its mutex-protected version chain.
#[derive(Debug)]
pub struct Row {
    row_id: String,
    versions: Mutex<VersionChain>,
}

impl Row {
    pub fn new(row_id: &str, initial: RowData) -> Self {
        let mut chain = VersionChain::default();
        chain.put(initial);
        Self {
            row_id: row_id.to_string(),
            versions: Mutex::new(chain),
        }
    }

    pub fn id(&self) -> &str {
        &self.row_id
    }

    /// Lock the version chain. All multi-step reads and writes of the chain
    /// go through this guard.
    pub fn versions(&self) -> MutexGuard<'_, VersionChain> {
        self.versions.lock()
    }

    /// Run a cleanup pass over this row; see [`VersionChain::prune`].
    pub fn cleanup(&self, transactions: &TransactionManager) -> bool {
        self.versions.lock().prune(transactions)
    }
}

// ============================================================================
// Tests
// ============================================================================
