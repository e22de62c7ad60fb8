//! Table metadata
//!
//! One metadata object exists per logical table. It owns the table's engine
//! cell, spins engines up on demand and down on inactivity, and persists the
//! per-table metadata document (engine metadata element plus id-generator
//! state) across engine generations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;
use xmltree::{Element, XMLNode};

use crate::id::{IdGenerator, IdGeneratorKind};
use crate::storage::{DocumentFile, Engine, EngineDeps, EngineFactory, EngineState};
use crate::{now_ms, Result};

const METADATA_TAG: &str = "metadata";
const ENGINE_TAG: &str = "engine";
const GENERATOR_TAG: &str = "generator";
const NAME_ATTR: &str = "name";

/// How long a losing thread spin-waits for the winning engine install.
const ENGINE_INSTALL_SPIN: Duration = Duration::from_nanos(250);

// ============================================================================
// Table Config
// ============================================================================

/// Which row property a shardset is keyed on. Only sharding by row id is
/// supported by the default engine factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardProperty {
    RowId,
    Property { expression: String },
}

/// Configuration of a sharded table: fixed-width intervals over the
/// sharding value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardsetConfig {
    pub base: i64,
    pub width: i64,
    pub by: ShardProperty,
}

/// Per-table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Idle time after which the table's engine may spin down.
    pub inactivity_shutdown_ms: i64,
    pub id_generator: IdGeneratorKind,
    pub shardset: Option<ShardsetConfig>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            inactivity_shutdown_ms: 3000,
            id_generator: IdGeneratorKind::Uuid,
            shardset: None,
        }
    }
}

// ============================================================================
// Table Metadata
// ============================================================================

/// Metadata about one table, and the ability to provide a running engine
/// for it.
pub struct TableMetadata {
    name: String,
    engine_file: PathBuf,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    /// Serialises spin-down decisions against each other.
    sync: Mutex<()>,
    engine_metadata: Mutex<Element>,
    id_generator: Arc<dyn IdGenerator>,
    config: TableConfig,
    last_activity_ms: AtomicI64,
    factory: Arc<dyn EngineFactory>,
    deps: EngineDeps,
}

impl TableMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.id_generator
    }

    pub fn engine_state(&self) -> EngineState {
        match &*self.engine.lock() {
            Some(engine) => engine.state(),
            None => EngineState::Uninitialized,
        }
    }

    pub fn has_uncommitted_data(&self) -> bool {
        self.engine
            .lock()
            .as_ref()
            .map(|engine| engine.has_uncommitted_data())
            .unwrap_or(false)
    }

    /// A table may spin down once it has been idle past the configured
    /// threshold and its engine (when present) holds no uncommitted data.
    /// An absent engine counts as having none.
    pub fn can_spin_down(&self) -> bool {
        let idle = self.last_activity_ms.load(Ordering::SeqCst) + self.config.inactivity_shutdown_ms
            < now_ms();
        idle && !self.has_uncommitted_data()
    }

    /// Return a live engine for this table, spinning one up if the cell is
    /// empty or holds a spun-down engine.
    pub fn provide_engine(&self) -> Result<Arc<dyn Engine>> {
        self.last_activity_ms.store(now_ms(), Ordering::SeqCst);
        self.ensure_spin_up()
    }

    fn make_new_engine(&self) -> Result<Arc<dyn Engine>> {
        let engine =
            self.factory
                .new_engine(&self.engine_file, &self.name, &self.config, &self.deps)?;
        engine.load_metadata(&self.engine_metadata.lock());
        Ok(engine)
    }

    fn ensure_spin_up(&self) -> Result<Arc<dyn Engine>> {
        loop {
            let current = self.engine.lock().clone();
            if let Some(engine) = &current {
                match engine.state() {
                    EngineState::SpinningUp | EngineState::SpunUp | EngineState::Running => {
                        return Ok(Arc::clone(engine));
                    }
                    _ => {}
                }
            }

            let replacement = self.make_new_engine()?;
            let installed = {
                let mut cell = self.engine.lock();
                let unchanged = match (&*cell, &current) {
                    (None, None) => true,
                    (Some(held), Some(seen)) => Arc::ptr_eq(held, seen),
                    _ => false,
                };
                if unchanged {
                    *cell = Some(Arc::clone(&replacement));
                }
                unchanged
            };

            if installed {
                trace!(table = %self.name, "spinning up new engine");
                // only the thread whose spin-up succeeded begins operations
                if replacement.spin_up()? {
                    replacement.begin_operations()?;
                }
                return Ok(replacement);
            }

            // another thread swapped the cell; give its engine a moment to
            // reach a live state before retrying
            let wait_until = Instant::now() + ENGINE_INSTALL_SPIN;
            while Instant::now() < wait_until {
                if let Some(winner) = self.engine.lock().clone() {
                    match winner.state() {
                        EngineState::SpinningUp
                        | EngineState::SpunUp
                        | EngineState::Running => return Ok(winner),
                        _ => {}
                    }
                }
                std::hint::spin_loop();
            }
        }
    }

    /// Spin the engine down. Without `force`, an engine holding uncommitted
    /// data is left running and returned unchanged. On a graceful spin-down
    /// the engine's metadata element is captured for the next spin-up.
    pub fn spin_down(&self, force: bool) -> Result<Option<Arc<dyn Engine>>> {
        let _sync = self.sync.lock();

        let engine = match self.engine.lock().clone() {
            Some(engine) => engine,
            None => return Ok(None),
        };
        if matches!(
            engine.state(),
            EngineState::SpinningDown | EngineState::SpunDown
        ) {
            // another thread is already spinning it down
            return Ok(Some(engine));
        }

        let mut retained = false;
        {
            let cell = &self.engine;
            let target = Arc::clone(&engine);
            engine.with_table_write_lock(&mut || {
                if target.has_uncommitted_data() && !force {
                    retained = true;
                } else {
                    let mut held = cell.lock();
                    if held
                        .as_ref()
                        .map(|h| Arc::ptr_eq(h, &target))
                        .unwrap_or(false)
                    {
                        *held = None;
                    }
                }
            });
        }
        if retained {
            return Ok(Some(engine));
        }

        trace!(table = %self.name, "spinning down table");
        if engine.spin_down(Some(Box::new(|_table: &str| {})))? {
            let mut metadata = self.engine_metadata.lock();
            engine.save_metadata(&mut metadata);
        } else {
            engine.force_spin_down()?;
        }
        Ok(Some(engine))
    }
}

// ============================================================================
// Table Metadata Factory
// ============================================================================

/// Creates [`TableMetadata`] objects, reading and writing their per-table
/// metadata documents under `directory/metadata/`.
pub struct TableMetadataFactory {
    directory: PathBuf,
    engine_factory: Arc<dyn EngineFactory>,
    deps: EngineDeps,
    default_config: TableConfig,
}

impl TableMetadataFactory {
    pub fn new(
        directory: impl Into<PathBuf>,
        engine_factory: Arc<dyn EngineFactory>,
        deps: EngineDeps,
    ) -> Self {
        Self {
            directory: directory.into(),
            engine_factory,
            deps,
            default_config: TableConfig::default(),
        }
    }

    /// Override the config handed to tables this factory creates.
    pub fn with_default_config(mut self, config: TableConfig) -> Self {
        self.default_config = config;
        self
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.directory.join("metadata").join(format!("{name}.xml"))
    }

    pub fn make_table_metadata(
        &self,
        name: &str,
        engine_file: &Path,
    ) -> Result<Arc<TableMetadata>> {
        self.make_table_metadata_with(name, engine_file, self.default_config.clone())
    }

    pub fn make_table_metadata_with(
        &self,
        name: &str,
        engine_file: &Path,
        config: TableConfig,
    ) -> Result<Arc<TableMetadata>> {
        let mut engine_metadata = Element::new(ENGINE_TAG);
        let id_generator: Arc<dyn IdGenerator> = Arc::from(config.id_generator.create());

        let path = self.metadata_path(name);
        if path.exists() {
            let doc = DocumentFile::new(&path).read()?;
            if let Some(saved) = doc.get_child(ENGINE_TAG) {
                engine_metadata = saved.clone();
            }
            if let Some(generator_state) = doc.get_child(GENERATOR_TAG) {
                id_generator.load_state(generator_state)?;
            }
        }

        Ok(Arc::new(TableMetadata {
            name: name.to_string(),
            engine_file: engine_file.to_path_buf(),
            engine: Mutex::new(None),
            sync: Mutex::new(()),
            engine_metadata: Mutex::new(engine_metadata),
            id_generator,
            config,
            last_activity_ms: AtomicI64::new(now_ms()),
            factory: Arc::clone(&self.engine_factory),
            deps: self.deps.clone(),
        }))
    }

    /// Persist a table's metadata document so the next spin-up starts from
    /// the saved engine metadata and generator state.
    pub fn save_table_metadata(&self, metadata: &TableMetadata) -> Result<()> {
        let mut root = Element::new(METADATA_TAG);
        root.attributes
            .insert(NAME_ATTR.to_string(), metadata.name.clone());

        let mut generator_el = Element::new(GENERATOR_TAG);
        metadata.id_generator.save_state(&mut generator_el);
        root.children.push(XMLNode::Element(generator_el));

        root.children
            .push(XMLNode::Element(metadata.engine_metadata.lock().clone()));

        DocumentFile::new(self.metadata_path(&metadata.name)).write(&root)
    }
}

// ============================================================================
// Tests
// ============================================================================
