//! Storage engines
//!
//! An engine owns one table's data. The cached-document engine keeps the
//! whole table in memory as a multi-version store backed by one XML file;
//! the sharded engine in [`crate::scaling`] composes many of them behind the
//! same trait. Engines move through a fixed lifecycle:
//!
//! ```text
//! Uninitialized → SpinningUp → SpunUp → Running → SpinningDown → SpunDown
//! ```
//!
//! Transitions are compare-and-set on an atomic cell; operations arriving
//! while the engine is spinning up block on a readiness condition until it
//! is running, and fail once it has spun down.

pub mod cached;
pub mod file;
pub mod mvcc;

pub use cached::CachedDocumentEngine;
pub use file::DocumentFile;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use xmltree::Element;

use crate::query::{Query, RowUpdate};
use crate::scaling::{FixedWidthIntervalProvider, ShardedEngine};
use crate::table::{ShardProperty, TableConfig};
use crate::task::TaskPool;
use crate::txn::{TransactionManager, TransactionOptions};
use crate::{Result, XFlatError};

// ============================================================================
// Engine State
// ============================================================================

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Uninitialized = 0,
    SpinningUp = 1,
    SpunUp = 2,
    Running = 3,
    SpinningDown = 4,
    SpunDown = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Uninitialized,
            1 => EngineState::SpinningUp,
            2 => EngineState::SpunUp,
            3 => EngineState::Running,
            4 => EngineState::SpinningDown,
            _ => EngineState::SpunDown,
        }
    }
}

/// Atomic state cell plus the readiness condition operations wait on while
/// an engine spins up.
pub struct StateCell {
    state: AtomicU8,
    ready: AtomicBool,
    gate: Mutex<()>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Uninitialized as u8),
            ready: AtomicBool::new(false),
            gate: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
        self.notify();
    }

    pub fn get_and_set(&self, state: EngineState) -> EngineState {
        let old = self.state.swap(state as u8, Ordering::SeqCst);
        self.notify();
        EngineState::from_u8(old)
    }

    pub fn compare_and_set(&self, from: EngineState, to: EngineState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            self.notify();
        }
        swapped
    }

    /// Mark that `begin_operations` has fired; waiters re-check the state.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        let _guard = self.gate.lock();
        self.changed.notify_all();
    }

    /// Block until the engine is running. Fails once the engine reaches a
    /// spun-down state instead.
    pub fn await_running(&self) -> Result<()> {
        if self.get() == EngineState::Running {
            return Ok(());
        }
        let mut guard = self.gate.lock();
        loop {
            match self.get() {
                EngineState::Running => return Ok(()),
                EngineState::SpinningDown | EngineState::SpunDown => {
                    return Err(XFlatError::EngineState(
                        "engine has spun down".to_string(),
                    ))
                }
                _ => self.changed.wait(&mut guard),
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Engine Trait
// ============================================================================

/// Cursor over query results. Dropping the cursor closes it; engines delay
/// spin-down until every cursor they handed out is closed.
pub type Cursor = Box<dyn Iterator<Item = Element> + Send>;

/// Invoked once when a graceful spin-down completes, with the table name.
pub type SpinDownCallback = Box<dyn FnOnce(&str) + Send>;

/// A storage engine for one logical table.
pub trait Engine: Send + Sync {
    fn table_name(&self) -> &str;
    fn state(&self) -> EngineState;

    /// Create a row. Fails with a duplicate-key error when a non-tombstone
    /// version is visible to the caller.
    fn insert_row(&self, id: &str, element: Element) -> Result<()>;

    /// A clone of the visible version's element, or `None`.
    fn read_row(&self, id: &str) -> Result<Option<Element>>;

    /// Install a new version over an existing visible row.
    fn replace_row(&self, id: &str, element: Element) -> Result<()>;

    /// Apply an update to a clone of the visible version, installing it only
    /// when the update changed content. Returns whether a change occurred.
    fn update_row(&self, id: &str, update: &dyn RowUpdate) -> Result<bool>;

    /// Apply an update to every row the query matches; returns the count of
    /// rows changed.
    fn update_matching(&self, query: &Query, update: &dyn RowUpdate) -> Result<usize>;

    /// Insert or replace; returns true iff this was an insert.
    fn upsert_row(&self, id: &str, element: Element) -> Result<bool>;

    /// Install a tombstone over an existing visible row.
    fn delete_row(&self, id: &str) -> Result<()>;

    /// Install tombstones for all matches; returns the count.
    fn delete_matching(&self, query: &Query) -> Result<usize>;

    /// Lazily iterate the table under the caller's transaction snapshot.
    fn query_table(&self, query: &Query) -> Result<Cursor>;

    /// Commit a transaction's versions on this engine.
    fn commit(&self, tx_id: i64, commit_id: i64, options: &TransactionOptions) -> Result<()>;

    /// Remove every version written by the transaction. `recovering` scans
    /// the entire cache instead of just the uncommitted set.
    fn revert(&self, tx_id: i64, recovering: bool) -> Result<()>;

    /// Load table data. Returns true iff this call performed the spin-up;
    /// exactly that caller must also invoke [`Engine::begin_operations`].
    fn spin_up(&self) -> Result<bool>;

    /// Start background maintenance and open the engine for operations.
    fn begin_operations(&self) -> Result<bool>;

    /// Graceful shutdown: final cleanup pass, durable dump, wait for open
    /// cursors, then fire the callback. Returns false when the engine was
    /// not running (spin-down of a spun-down engine is a no-op).
    fn spin_down(&self, on_complete: Option<SpinDownCallback>) -> Result<bool>;

    /// Short-circuit to SpunDown, abandoning graceful shutdown.
    fn force_spin_down(&self) -> Result<()>;

    fn has_uncommitted_data(&self) -> bool;

    /// Wall-clock milliseconds of the last user operation.
    fn last_activity_ms(&self) -> i64;

    /// Round-trip arbitrary engine metadata through the per-table
    /// `<engine>` element.
    fn save_metadata(&self, element: &mut Element);
    fn load_metadata(&self, element: &Element);

    /// Run `f` under the engine's exclusive table lock, with no reads or
    /// writes in flight.
    fn with_table_write_lock(&self, f: &mut dyn FnMut());
}

// ============================================================================
// Engine Dependencies
// ============================================================================

/// Collaborators handed to every engine at construction. No ambient state:
/// the transaction manager and worker pool are always passed explicitly.
#[derive(Clone)]
pub struct EngineDeps {
    pub pool: Arc<TaskPool>,
    pub transactions: Arc<TransactionManager>,
}

// ============================================================================
// Engine Factory
// ============================================================================

/// Builds engines for tables; the metadata manager and the sharded engine
/// both create engines only through this seam.
pub trait EngineFactory: Send + Sync {
    fn new_engine(
        &self,
        path: &Path,
        table_name: &str,
        config: &TableConfig,
        deps: &EngineDeps,
    ) -> Result<Arc<dyn Engine>>;
}

/// The default factory: a sharded engine when the table config carries a
/// shardset, a cached-document engine otherwise. Only sharding by row id is
/// supported.
#[derive(Debug, Default, Clone)]
pub struct DefaultEngineFactory;

impl EngineFactory for DefaultEngineFactory {
    fn new_engine(
        &self,
        path: &Path,
        table_name: &str,
        config: &TableConfig,
        deps: &EngineDeps,
    ) -> Result<Arc<dyn Engine>> {
        match &config.shardset {
            Some(shardset) => match &shardset.by {
                ShardProperty::RowId => {
                    let provider =
                        FixedWidthIntervalProvider::<i64>::new(shardset.base, shardset.width);
                    Ok(ShardedEngine::by_row_id(
                        path,
                        table_name,
                        Arc::new(provider),
                        config.clone(),
                        deps.clone(),
                    ))
                }
                ShardProperty::Property { expression } => Err(XFlatError::Internal(format!(
                    "tables sharded on values other than the row id are not supported \
                     (shard selector: {expression})"
                ))),
            },
            None => Ok(CachedDocumentEngine::new(path, table_name, deps.clone())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
