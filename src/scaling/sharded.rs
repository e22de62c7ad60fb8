//! Sharded Engine
//!
//! Routes table operations to child cached-document engines keyed by value
//! intervals. Children are created lazily the first time an interval is
//! touched, retired in the background once idle, and drained one by one
//! when the parent spins down.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::fs;
use std::hash::Hash;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};
use xmltree::Element;

use crate::query::{PropertySelector, Query, RowUpdate};
use crate::scaling::interval::{Interval, IntervalProvider};
use crate::storage::{
    Cursor, DefaultEngineFactory, Engine, EngineDeps, EngineState, SpinDownCallback, StateCell,
};
use crate::table::{TableConfig, TableMetadata, TableMetadataFactory};
use crate::task::{TaskControl, TaskHandle};
use crate::txn::TransactionOptions;
use crate::{now_ms, Result, XFlatError};

/// Delay between shard-retirement sweeps.
const RETIREMENT_DELAY: Duration = Duration::from_millis(500);

/// Value types shards can be keyed on.
pub trait ShardKey:
    Copy + Ord + Eq + Hash + Display + Debug + FromStr + Send + Sync + 'static
{
}

impl<T> ShardKey for T where
    T: Copy + Ord + Eq + Hash + Display + Debug + FromStr + Send + Sync + 'static
{
}

/// How the sharding value is obtained from an incoming row.
pub enum ShardSelector {
    /// Shard on the row id itself.
    RowId,
    /// Shard on a property selected from the row element.
    Property(Box<dyn PropertySelector>),
}

impl ShardSelector {
    fn expression(&self) -> &str {
        match self {
            ShardSelector::RowId => "row id",
            ShardSelector::Property(selector) => selector.expression(),
        }
    }
}

// ============================================================================
// Sharded Engine
// ============================================================================

pub struct ShardedEngine<T: ShardKey> {
    table_name: String,
    directory: PathBuf,
    state: StateCell,
    selector: ShardSelector,
    provider: Arc<dyn IntervalProvider<T>>,
    /// Currently active children.
    open_shards: RwLock<HashMap<Interval<T>, Arc<TableMetadata>>>,
    /// Every shard discovered on disk, loaded or not.
    known_shards: RwLock<HashMap<Interval<T>, PathBuf>>,
    /// Children draining while the parent spins down. This mutex is also the
    /// sync root linearising child creation against shutdown.
    draining: Mutex<HashMap<Interval<T>, Arc<dyn Engine>>>,
    metadata_factory: TableMetadataFactory,
    table_lock: RwLock<()>,
    maintenance: Mutex<Option<TaskHandle>>,
    monitor: Mutex<Option<TaskHandle>>,
    metadata: Mutex<Option<Element>>,
    last_activity_ms: AtomicI64,
    deps: EngineDeps,
    weak_self: Weak<ShardedEngine<T>>,
}

impl<T: ShardKey> ShardedEngine<T> {
    pub fn new(
        directory: impl Into<PathBuf>,
        table_name: &str,
        selector: ShardSelector,
        provider: Arc<dyn IntervalProvider<T>>,
        config: TableConfig,
        deps: EngineDeps,
    ) -> Arc<Self> {
        let directory = directory.into();
        let child_config = TableConfig {
            shardset: None,
            ..config
        };
        let metadata_factory = TableMetadataFactory::new(
            directory.clone(),
            Arc::new(DefaultEngineFactory),
            deps.clone(),
        )
        .with_default_config(child_config);

        Arc::new_cyclic(|weak_self| Self {
            table_name: table_name.to_string(),
            directory,
            state: StateCell::new(),
            selector,
            provider,
            open_shards: RwLock::new(HashMap::new()),
            known_shards: RwLock::new(HashMap::new()),
            draining: Mutex::new(HashMap::new()),
            metadata_factory,
            table_lock: RwLock::new(()),
            maintenance: Mutex::new(None),
            monitor: Mutex::new(None),
            metadata: Mutex::new(None),
            last_activity_ms: AtomicI64::new(now_ms()),
            deps,
            weak_self: weak_self.clone(),
        })
    }

    /// A shardset keyed on the row id, the only kind the default factory
    /// accepts.
    pub fn by_row_id(
        directory: impl Into<PathBuf>,
        table_name: &str,
        provider: Arc<dyn IntervalProvider<T>>,
        config: TableConfig,
        deps: EngineDeps,
    ) -> Arc<Self> {
        Self::new(
            directory,
            table_name,
            ShardSelector::RowId,
            provider,
            config,
            deps,
        )
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn conversion_failure(&self, raw: &str) -> XFlatError {
        XFlatError::Conversion(format!(
            "data cannot be sharded: sharding expression {} selected non-convertible value {raw:?}",
            self.selector.expression()
        ))
    }

    fn parse_value(&self, raw: &str) -> Result<T> {
        raw.parse::<T>().map_err(|_| self.conversion_failure(raw))
    }

    fn interval_for_id(&self, id: &str) -> Result<Interval<T>> {
        Ok(self.provider.interval_containing(self.parse_value(id)?))
    }

    fn interval_for_row(&self, id: &str, element: &Element) -> Result<Interval<T>> {
        match &self.selector {
            ShardSelector::RowId => self.interval_for_id(id),
            ShardSelector::Property(selector) => {
                let raw = selector.select(element).ok_or_else(|| {
                    XFlatError::Conversion(format!(
                        "data cannot be sharded: sharding expression {} selected no value \
                         which could be mapped to a range",
                        selector.expression()
                    ))
                })?;
                let value = self.parse_value(&raw)?;
                Ok(self.provider.interval_containing(value))
            }
        }
    }

    /// Every interval with a shard on disk or an open child, ordered by
    /// lower bound.
    fn all_intervals(&self) -> Vec<Interval<T>> {
        let mut set: HashSet<Interval<T>> = self.known_shards.read().keys().copied().collect();
        set.extend(self.open_shards.read().keys().copied());
        let mut intervals: Vec<Interval<T>> = set.into_iter().collect();
        intervals.sort_by_key(|i| i.lower());
        intervals
    }

    /// The child engine for an interval, creating its shard lazily. New
    /// children are registered under the spin-down sync root so that a
    /// parent mid-shutdown still drains them.
    fn shard_engine(&self, interval: &Interval<T>) -> Result<Arc<dyn Engine>> {
        let existing = self.open_shards.read().get(interval).cloned();
        let metadata = match existing {
            Some(metadata) => metadata,
            None => {
                let mut draining = self.draining.lock();
                if self.state.get() == EngineState::SpunDown {
                    return Err(XFlatError::EngineState(
                        "engine has already spun down".to_string(),
                    ));
                }

                let name = self.provider.name(interval);
                let file = self.directory.join(format!("{name}.xml"));
                self.known_shards.write().insert(*interval, file.clone());

                let created = self.metadata_factory.make_table_metadata(&name, &file)?;
                let metadata = {
                    let mut open = self.open_shards.write();
                    match open.entry(*interval) {
                        // another thread created the shard first
                        Entry::Occupied(entry) => Arc::clone(entry.get()),
                        Entry::Vacant(slot) => {
                            slot.insert(Arc::clone(&created));
                            created
                        }
                    }
                };

                if self.state.get() == EngineState::SpinningDown
                    && !draining.contains_key(interval)
                {
                    // opened for a read while shutting down; make sure the
                    // drain monitor picks it up
                    let engine = metadata.provide_engine()?;
                    draining.insert(*interval, Arc::clone(&engine));
                    return Ok(engine);
                }
                metadata
            }
        };

        metadata.provide_engine()
    }

    /// Run an operation against the child for an interval. If the child spun
    /// down between lookup and call, the operation is retried exactly once
    /// against a freshly resolved child.
    fn with_shard<R>(
        &self,
        interval: &Interval<T>,
        operation: impl Fn(&dyn Engine) -> Result<R>,
    ) -> Result<R> {
        match self.state.get() {
            EngineState::Uninitialized | EngineState::SpunDown => {
                return Err(XFlatError::EngineState(
                    "attempt to read or write through an engine in an uninitialized state"
                        .to_string(),
                ));
            }
            _ => {}
        }

        let engine = self.shard_engine(interval)?;
        match operation(engine.as_ref()) {
            Err(XFlatError::EngineState(_)) => {
                let engine = self.shard_engine(interval)?;
                operation(engine.as_ref())
            }
            other => other,
        }
    }

    /// Scan every shard with an id-keyed operation, treating key-not-found
    /// as "try the next shard".
    fn scan_shards<R>(
        &self,
        id: &str,
        operation: impl Fn(&dyn Engine) -> Result<R>,
    ) -> Result<R> {
        for interval in self.all_intervals() {
            match self.with_shard(&interval, &operation) {
                Err(XFlatError::KeyNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(XFlatError::KeyNotFound(id.to_string()))
    }

    /// Retire every open shard that has been idle past its threshold,
    /// persisting its metadata afterwards.
    fn retire_idle_shards(&self) {
        let candidates: Vec<(Interval<T>, Arc<TableMetadata>)> = self
            .open_shards
            .read()
            .iter()
            .filter(|(_, metadata)| metadata.can_spin_down())
            .map(|(interval, metadata)| (*interval, Arc::clone(metadata)))
            .collect();

        for (interval, metadata) in candidates {
            // remove right away: activity between the check and the remove
            // just spins up a fresh child later
            self.open_shards.write().remove(&interval);
            trace!(table = %self.table_name, shard = %metadata.name(), "retiring idle shard");

            if let Err(err) = metadata.spin_down(false) {
                warn!(
                    table = %self.table_name,
                    shard = %metadata.name(),
                    "failed to spin down idle shard: {err}"
                );
                continue;
            }
            if let Err(err) = self.metadata_factory.save_table_metadata(&metadata) {
                warn!(
                    table = %self.table_name,
                    shard = %metadata.name(),
                    "failed to save metadata for retired shard: {err}"
                );
            }
        }
    }
}

// ============================================================================
// Shard Cursor
// ============================================================================

/// Chains the child cursors of every shard, resolving each child lazily.
struct ShardCursor<T: ShardKey> {
    engine: Arc<ShardedEngine<T>>,
    query: Query,
    intervals: std::vec::IntoIter<Interval<T>>,
    current: Option<Cursor>,
}

impl<T: ShardKey> Iterator for ShardCursor<T> {
    type Item = Element;

    fn next(&mut self) -> Option<Element> {
        loop {
            if let Some(cursor) = &mut self.current {
                if let Some(element) = cursor.next() {
                    return Some(element);
                }
            }

            let interval = self.intervals.next()?;
            let query = self.query.clone();
            self.current = match self
                .engine
                .with_shard(&interval, |child| child.query_table(&query))
            {
                Ok(cursor) => Some(cursor),
                Err(err) => {
                    warn!(
                        table = %self.engine.table_name,
                        "skipping unreadable shard during query: {err}"
                    );
                    None
                }
            };
        }
    }
}

// ============================================================================
// Engine implementation
// ============================================================================

impl<T: ShardKey> Engine for ShardedEngine<T> {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }

    fn insert_row(&self, id: &str, element: Element) -> Result<()> {
        self.touch();
        let interval = self.interval_for_row(id, &element)?;
        self.with_shard(&interval, |child| child.insert_row(id, element.clone()))
    }

    fn read_row(&self, id: &str) -> Result<Option<Element>> {
        self.touch();
        match &self.selector {
            ShardSelector::RowId => {
                let interval = self.interval_for_id(id)?;
                self.with_shard(&interval, |child| child.read_row(id))
            }
            ShardSelector::Property(_) => {
                for interval in self.all_intervals() {
                    if let Some(element) =
                        self.with_shard(&interval, |child| child.read_row(id))?
                    {
                        return Ok(Some(element));
                    }
                }
                Ok(None)
            }
        }
    }

    fn replace_row(&self, id: &str, element: Element) -> Result<()> {
        self.touch();
        match &self.selector {
            ShardSelector::RowId => {
                let interval = self.interval_for_id(id)?;
                self.with_shard(&interval, |child| child.replace_row(id, element.clone()))
            }
            ShardSelector::Property(_) => {
                self.scan_shards(id, |child| child.replace_row(id, element.clone()))
            }
        }
    }

    fn update_row(&self, id: &str, update: &dyn RowUpdate) -> Result<bool> {
        self.touch();
        match &self.selector {
            ShardSelector::RowId => {
                let interval = self.interval_for_id(id)?;
                self.with_shard(&interval, |child| child.update_row(id, update))
            }
            ShardSelector::Property(_) => self.scan_shards(id, |child| child.update_row(id, update)),
        }
    }

    fn update_matching(&self, query: &Query, update: &dyn RowUpdate) -> Result<usize> {
        self.touch();
        let mut updated = 0;
        for interval in self.all_intervals() {
            updated += self.with_shard(&interval, |child| child.update_matching(query, update))?;
        }
        Ok(updated)
    }

    fn upsert_row(&self, id: &str, element: Element) -> Result<bool> {
        self.touch();
        let interval = self.interval_for_row(id, &element)?;
        self.with_shard(&interval, |child| child.upsert_row(id, element.clone()))
    }

    fn delete_row(&self, id: &str) -> Result<()> {
        self.touch();
        match &self.selector {
            ShardSelector::RowId => {
                let interval = self.interval_for_id(id)?;
                self.with_shard(&interval, |child| child.delete_row(id))
            }
            ShardSelector::Property(_) => self.scan_shards(id, |child| child.delete_row(id)),
        }
    }

    fn delete_matching(&self, query: &Query) -> Result<usize> {
        self.touch();
        let mut removed = 0;
        for interval in self.all_intervals() {
            removed += self.with_shard(&interval, |child| child.delete_matching(query))?;
        }
        Ok(removed)
    }

    fn query_table(&self, query: &Query) -> Result<Cursor> {
        self.touch();
        let engine = self
            .weak_self
            .upgrade()
            .ok_or_else(|| XFlatError::EngineState("engine has been dropped".to_string()))?;
        Ok(Box::new(ShardCursor {
            engine,
            query: query.clone(),
            intervals: self.all_intervals().into_iter(),
            current: None,
        }))
    }

    fn commit(&self, _tx_id: i64, _commit_id: i64, _options: &TransactionOptions) -> Result<()> {
        // children bind themselves to transactions when written through, so
        // the manager commits them directly
        Ok(())
    }

    fn revert(&self, tx_id: i64, recovering: bool) -> Result<()> {
        if recovering {
            for interval in self.all_intervals() {
                self.with_shard(&interval, |child| child.revert(tx_id, true))?;
            }
        }
        Ok(())
    }

    fn spin_up(&self) -> Result<bool> {
        if !self
            .state
            .compare_and_set(EngineState::Uninitialized, EngineState::SpinningUp)
        {
            return Ok(false);
        }

        if self.directory.exists() && !self.directory.is_dir() {
            return Err(XFlatError::Internal(format!(
                "cannot create sharded engine over existing non-sharded table file {}",
                self.directory.display()
            )));
        }

        if !self.directory.exists() {
            fs::create_dir_all(&self.directory)?;
        } else {
            // discover the shards already on disk; foreign files are ignored
            let mut known = self.known_shards.write();
            for entry in fs::read_dir(&self.directory)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(stem) = file_name.strip_suffix(".xml") else {
                    continue;
                };
                if let Some(interval) = self.provider.interval_named(stem) {
                    known.insert(interval, path);
                }
            }
        }

        // children spin up as they are needed; only retirement runs here
        let weak = self.weak_self.clone();
        let handle = self.deps.pool.schedule_with_fixed_delay(
            RETIREMENT_DELAY,
            RETIREMENT_DELAY,
            move || {
                let Some(engine) = weak.upgrade() else {
                    return TaskControl::Stop;
                };
                if matches!(
                    engine.state.get(),
                    EngineState::SpinningDown | EngineState::SpunDown
                ) {
                    return TaskControl::Stop;
                }
                engine.retire_idle_shards();
                TaskControl::Continue
            },
        );
        *self.maintenance.lock() = Some(handle);

        self.state
            .compare_and_set(EngineState::SpinningUp, EngineState::SpunUp);
        Ok(true)
    }

    fn begin_operations(&self) -> Result<bool> {
        self.state.mark_ready();
        Ok(self
            .state
            .compare_and_set(EngineState::SpunUp, EngineState::Running))
    }

    fn spin_down(&self, on_complete: Option<SpinDownCallback>) -> Result<bool> {
        if !self
            .state
            .compare_and_set(EngineState::Running, EngineState::SpinningDown)
        {
            return Ok(false);
        }

        trace!(table = %self.table_name, "sharded engine spinning down");
        if let Some(handle) = self.maintenance.lock().take() {
            handle.cancel();
        }

        {
            let mut draining = self.draining.lock();
            for (interval, metadata) in self.open_shards.read().iter() {
                match metadata.spin_down(false) {
                    Ok(Some(child)) => {
                        draining.insert(*interval, child);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(
                        table = %self.table_name,
                        shard = %metadata.name(),
                        "failed to start shard spin-down: {err}"
                    ),
                }
            }
        }

        let weak = self.weak_self.clone();
        let mut callback = on_complete;
        let monitor = self.deps.pool.schedule_with_fixed_delay(
            Duration::from_millis(5),
            Duration::from_millis(10),
            move || {
                let Some(engine) = weak.upgrade() else {
                    return TaskControl::Stop;
                };
                if engine.state.get() != EngineState::SpinningDown {
                    return TaskControl::Stop;
                }

                let mut draining = engine.draining.lock();
                // retire children that finished; nudge ones that slipped
                // back to running
                draining.retain(|_, child| {
                    !matches!(
                        child.state(),
                        EngineState::SpunDown | EngineState::Uninitialized
                    )
                });
                for child in draining.values() {
                    if child.state() == EngineState::Running {
                        let _ = child.spin_down(None);
                    }
                }

                if draining.is_empty() {
                    drop(draining);
                    if engine
                        .state
                        .compare_and_set(EngineState::SpinningDown, EngineState::SpunDown)
                    {
                        if let Some(callback) = callback.take() {
                            callback(&engine.table_name);
                        }
                    } else {
                        let _ = engine.force_spin_down();
                    }
                    return TaskControl::Stop;
                }
                TaskControl::Continue
            },
        );
        *self.monitor.lock() = Some(monitor);
        Ok(true)
    }

    fn force_spin_down(&self) -> Result<()> {
        self.state.set(EngineState::SpunDown);

        let mut draining = self.draining.lock();
        for (interval, metadata) in self.open_shards.read().iter() {
            if let Ok(Some(child)) = metadata.spin_down(true) {
                draining.insert(*interval, child);
            }
        }
        for child in draining.values() {
            let _ = child.force_spin_down();
        }
        draining.clear();
        Ok(())
    }

    fn has_uncommitted_data(&self) -> bool {
        match self.state.get() {
            EngineState::SpinningDown => self
                .draining
                .lock()
                .values()
                .any(|child| child.has_uncommitted_data()),
            EngineState::Running => self
                .open_shards
                .read()
                .values()
                .any(|metadata| metadata.has_uncommitted_data()),
            _ => false,
        }
    }

    fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    fn save_metadata(&self, element: &mut Element) {
        if let Some(saved) = &*self.metadata.lock() {
            *element = saved.clone();
        }
    }

    fn load_metadata(&self, element: &Element) {
        *self.metadata.lock() = Some(element.clone());
    }

    fn with_table_write_lock(&self, f: &mut dyn FnMut()) {
        let _guard = self.table_lock.write();
        f();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ChildTextSelector;
    use crate::scaling::FixedWidthIntervalProvider;
    use crate::task::TaskPool;
    use crate::txn::TransactionManager;
    use std::path::Path;
    use std::time::Instant;
    use xmltree::XMLNode;

    fn element(text: &str) -> Element {
        let mut e = Element::new("x");
        e.children.push(XMLNode::Text(text.to_string()));
        e
    }

    fn keyed_element(key: &str, text: &str) -> Element {
        let mut e = Element::new("data");
        let mut k = Element::new("k");
        k.children.push(XMLNode::Text(key.to_string()));
        e.children.push(XMLNode::Element(k));
        e.children.push(XMLNode::Text(text.to_string()));
        e
    }

    fn deps() -> EngineDeps {
        EngineDeps {
            pool: Arc::new(TaskPool::new(2)),
            transactions: Arc::new(TransactionManager::new(None).unwrap()),
        }
    }

    fn id_sharded(dir: &Path, config: TableConfig) -> Arc<ShardedEngine<i64>> {
        let engine = ShardedEngine::by_row_id(
            dir.join("sharded"),
            "sharded",
            Arc::new(FixedWidthIntervalProvider::<i64>::new(0, 100)),
            config,
            deps(),
        );
        assert!(engine.spin_up().unwrap());
        engine.begin_operations().unwrap();
        engine
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_inserts_create_interval_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = id_sharded(dir.path(), TableConfig::default());

        engine.insert_row("5", element("a")).unwrap();
        engine.insert_row("105", element("b")).unwrap();
        engine.insert_row("-95", element("c")).unwrap();

        assert_eq!(
            engine.read_row("5").unwrap().unwrap().get_text().unwrap(),
            "a"
        );
        assert_eq!(
            engine.read_row("105").unwrap().unwrap().get_text().unwrap(),
            "b"
        );

        assert!(engine.spin_down(None).unwrap());
        wait_for(|| engine.state() == EngineState::SpunDown);

        let shard_dir = dir.path().join("sharded");
        assert!(shard_dir.join("0.xml").exists());
        assert!(shard_dir.join("100.xml").exists());
        assert!(shard_dir.join("-100.xml").exists());
    }

    #[test]
    fn test_read_creates_shard_on_demand() {
        let dir = tempfile::tempdir().unwrap();

        {
            let engine = id_sharded(dir.path(), TableConfig::default());
            engine.insert_row("5", element("a")).unwrap();
            engine.spin_down(None).unwrap();
            wait_for(|| engine.state() == EngineState::SpunDown);
        }

        let engine = id_sharded(dir.path(), TableConfig::default());
        // discovered from disk
        assert!(engine.read_row("5").unwrap().is_some());
        // untouched interval: reading opens the shard on demand
        assert!(engine.read_row("205").unwrap().is_none());

        engine.spin_down(None).unwrap();
        wait_for(|| engine.state() == EngineState::SpunDown);
        assert!(dir.path().join("sharded").join("200.xml").exists());
    }

    #[test]
    fn test_query_chains_all_shards() {
        let dir = tempfile::tempdir().unwrap();
        let engine = id_sharded(dir.path(), TableConfig::default());

        for id in ["-95", "5", "105", "205"] {
            engine.insert_row(id, element(id)).unwrap();
        }

        let cursor = engine.query_table(&Query::all()).unwrap();
        let mut seen: Vec<String> = cursor.map(|e| e.get_text().unwrap().into_owned()).collect();
        seen.sort();
        assert_eq!(seen, vec!["-95", "105", "205", "5"]);
    }

    #[test]
    fn test_update_and_delete_span_shards() {
        let dir = tempfile::tempdir().unwrap();
        let engine = id_sharded(dir.path(), TableConfig::default());

        engine.insert_row("5", element("a")).unwrap();
        engine.insert_row("105", element("a")).unwrap();

        let updated = engine
            .update_matching(&Query::all(), &crate::query::SetChildText::new("y", "1"))
            .unwrap();
        assert_eq!(updated, 2);

        assert_eq!(engine.delete_matching(&Query::all()).unwrap(), 2);
        assert!(engine.read_row("5").unwrap().is_none());
    }

    #[test]
    fn test_idle_shards_retire_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let config = TableConfig {
            inactivity_shutdown_ms: 50,
            ..TableConfig::default()
        };
        let engine = id_sharded(dir.path(), config);

        engine.insert_row("5", element("a")).unwrap();
        assert_eq!(engine.open_shards.read().len(), 1);

        wait_for(|| engine.open_shards.read().is_empty());
        wait_for(|| dir.path().join("sharded").join("0.xml").exists());

        // the shard comes back on demand
        assert!(engine.read_row("5").unwrap().is_some());
        assert_eq!(engine.open_shards.read().len(), 1);
    }

    #[test]
    fn test_non_numeric_id_is_a_routing_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = id_sharded(dir.path(), TableConfig::default());

        assert!(matches!(
            engine.insert_row("not-a-number", element("a")),
            Err(XFlatError::Conversion(_))
        ));
    }

    #[test]
    fn test_property_selector_routing() {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<ShardedEngine<i64>> = ShardedEngine::new(
            dir.path().join("sharded"),
            "sharded",
            ShardSelector::Property(Box::new(ChildTextSelector::new("k"))),
            Arc::new(FixedWidthIntervalProvider::<i64>::new(0, 100)),
            TableConfig::default(),
            deps(),
        );
        assert!(engine.spin_up().unwrap());
        engine.begin_operations().unwrap();

        engine.insert_row("a", keyed_element("5", "first")).unwrap();
        engine
            .insert_row("b", keyed_element("150", "second"))
            .unwrap();

        // id lookups scan the shards
        assert!(engine.read_row("a").unwrap().is_some());
        assert!(engine.read_row("b").unwrap().is_some());
        assert!(engine.read_row("c").unwrap().is_none());

        // a row without the sharding property cannot be routed
        assert!(matches!(
            engine.insert_row("d", element("no-key")),
            Err(XFlatError::Conversion(_))
        ));

        engine.spin_down(None).unwrap();
        wait_for(|| engine.state() == EngineState::SpunDown);
        let shard_dir = dir.path().join("sharded");
        assert!(shard_dir.join("0.xml").exists());
        assert!(shard_dir.join("100.xml").exists());
    }

    #[test]
    fn test_operations_fail_after_spin_down() {
        let dir = tempfile::tempdir().unwrap();
        let engine = id_sharded(dir.path(), TableConfig::default());

        engine.spin_down(None).unwrap();
        wait_for(|| engine.state() == EngineState::SpunDown);

        assert!(matches!(
            engine.insert_row("5", element("a")),
            Err(XFlatError::EngineState(_))
        ));
        assert!(!engine.spin_down(None).unwrap());
    }
}
