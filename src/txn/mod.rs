//! Transactions
//!
//! Transaction and commit ids share one time-based, strictly monotonic
//! sequence: a higher id always means "later". Engines use the ids alone to
//! decide visibility; the manager in [`manager`] coordinates commit and
//! revert across every engine a transaction touched.

pub mod manager;

pub use manager::{Transaction, TransactionManager, TransactionRecord};

use serde::{Deserialize, Serialize};

/// Isolation level of a transaction.
///
/// Only two behaviours are distinguished: read-committed transactions never
/// conflict at commit; snapshot transactions fail with a write conflict when
/// another transaction committed to one of their rows after they began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    ReadCommitted,
    Snapshot,
}

/// Options a transaction is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation: Isolation,
    /// When true, commit does not return until the data is on disk.
    pub durable: bool,
}

impl TransactionOptions {
    pub fn snapshot() -> Self {
        Self {
            isolation: Isolation::Snapshot,
            durable: true,
        }
    }

    pub fn read_committed() -> Self {
        Self {
            isolation: Isolation::ReadCommitted,
            durable: true,
        }
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::snapshot()
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Committed,
    Reverted,
}
