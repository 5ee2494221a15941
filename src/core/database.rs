use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};
use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::outcome::{Outcome, Rejection};
use crate::core::state::{Catalog, EngineState};
use crate::core::stats::EngineStats;
use crate::core::types::Record;
use crate::query::cache::QueryCache;
use crate::storage::layout::StorageLayout;
use crate::storage::partitioned_table::PartitionedTable;
use crate::storage::save_queue::{DatabaseSnapshot, SaveQueue, SnapshotSource};
use crate::storage::sqlite_store::{SaveReport, SqliteStore, StoreSettings};
use crate::storage::table_lock::{LockManager, TableLock};

/// Shape of a new table. Unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub columns: Vec<String>,
    pub primary_key: Option<String>,
    pub num_partitions: Option<usize>,
    pub compressed: bool,
}

impl TableSpec {
    pub fn keyed(primary_key: impl Into<String>, num_partitions: usize) -> Self {
        TableSpec {
            primary_key: Some(primary_key.into()),
            num_partitions: Some(num_partitions),
            ..TableSpec::default()
        }
    }

    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// `{ data: [...] }` returned by `select_data`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectResult {
    pub data: Vec<Record>,
}

/// Reads the live catalog when the save worker asks for a database.
struct StateSnapshots {
    state: Arc<RwLock<EngineState>>,
    layout: StorageLayout,
}

impl SnapshotSource for StateSnapshots {
    fn snapshot(&self, database: &str) -> Option<DatabaseSnapshot> {
        let state = self.state.read();
        let catalog = state.databases.get(database)?;
        Some(DatabaseSnapshot {
            path: state
                .mounts
                .get(database)
                .cloned()
                .unwrap_or_else(|| self.layout.database_path(database)),
            tables: catalog.values().cloned().collect(),
        })
    }
}

/// Embedded engine: partitioned in-memory tables, secondary indexes and
/// SQLite-backed persistence through a single save worker.
pub struct HypercubeDb {
    pub(crate) config: Config,
    layout: StorageLayout,

    pub(crate) state: Arc<RwLock<EngineState>>,
    pub(crate) locks: LockManager,
    pub(crate) cache: QueryCache,
    saves: SaveQueue,
    closed: AtomicBool,

    // Metrics
    start_time: SystemTime,
    pub(crate) query_count: AtomicU64,
    pub(crate) write_count: AtomicU64,
}

impl HypercubeDb {
    /// Open the engine over `config.data_dir`, replaying every `*.db` file
    /// found there when `load_on_open` is set. Needs a tokio runtime.
    pub async fn open(config: Config) -> Result<Self> {
        let layout = StorageLayout::new(config.data_dir.clone())?;
        let state = Arc::new(RwLock::new(EngineState::default()));

        let store = SqliteStore::new(StoreSettings {
            batch_size: config.save_batch_size,
            page_size: config.load_page_size,
            default_primary_key: config.default_primary_key.clone(),
            default_partitions: config.default_partitions,
        });
        let saves = SaveQueue::start(
            store,
            Arc::new(StateSnapshots {
                state: Arc::clone(&state),
                layout: layout.clone(),
            }),
        );

        let db = HypercubeDb {
            cache: QueryCache::new(config.query_cache_size),
            config,
            layout,
            state,
            locks: LockManager::new(),
            saves,
            closed: AtomicBool::new(false),
            start_time: SystemTime::now(),
            query_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        };

        if db.config.load_on_open {
            for (name, path) in db.layout.discover()? {
                match db.load_into(&name, path).await {
                    Ok(tables) => info!(database = %name, tables, "database loaded"),
                    Err(err) => warn!(database = %name, error = %err, "skipping database that failed to load"),
                }
            }
        }
        info!(data_dir = %db.layout.base_dir.display(), databases = db.state.read().databases.len(), "engine opened");
        Ok(db)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn load_into(&self, name: &str, path: PathBuf) -> Result<usize> {
        let tables = self.saves.load(name, path).await?;
        let count = tables.len();
        let catalog: Catalog = tables.into_iter().map(|t| (t.name.clone(), t)).collect();

        let mut state = self.state.write();
        state.forget_database(name);
        state.databases.insert(name.to_string(), catalog);
        drop(state);

        self.cache.invalidate_database(name);
        Ok(count)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current database, or the reason there is none to work in.
    pub(crate) fn current_or_reject(&self, state: &EngineState) -> std::result::Result<String, Rejection> {
        if self.is_closed() {
            return Err(Rejection::Closed);
        }
        let current = state.current.clone().ok_or(Rejection::NoDatabaseSelected)?;
        if !state.databases.contains_key(&current) {
            return Err(Rejection::DatabaseNotFound(current));
        }
        Ok(current)
    }

    /// Database holding `table`, checked against the current selection.
    pub(crate) fn table_context(&self, table: &str) -> std::result::Result<String, Rejection> {
        let state = self.state.read();
        let current = self.current_or_reject(&state)?;
        if state.table(&current, table).is_none() {
            return Err(Rejection::TableNotFound(table.to_string()));
        }
        Ok(current)
    }

    /// Table context plus its write lock; the lock is released when the guard drops.
    pub(crate) fn acquire(&self, table: &str) -> std::result::Result<(String, TableLock<'_>), Rejection> {
        let database = self.table_context(table)?;
        match self.locks.try_acquire(&database, table) {
            Some(guard) => Ok((database, guard)),
            None => {
                warn!(database = %database, table, "table is locked");
                Err(Rejection::TableLocked(table.to_string()))
            }
        }
    }

    /// Cache invalidation, write accounting and the follow-up save of one mutation.
    pub(crate) fn after_mutation(&self, database: &str, table: &str) {
        self.cache.invalidate_table(database, table);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.schedule_save(database);
    }

    pub(crate) fn schedule_save(&self, database: &str) {
        if self.config.autosave && !self.is_closed() {
            self.saves.schedule_save(database);
        }
    }

    // Catalog

    pub fn create_database(&self, name: &str) -> Outcome<()> {
        if self.is_closed() {
            return Outcome::Skipped(Rejection::Closed);
        }
        let name = name.trim();
        if name.is_empty() {
            return Outcome::Skipped(Rejection::InvalidArgument("database name is empty".to_string()));
        }
        {
            let mut state = self.state.write();
            if state.databases.contains_key(name) {
                return Outcome::Skipped(Rejection::DatabaseExists(name.to_string()));
            }
            state.databases.insert(name.to_string(), Catalog::new());
        }
        info!(database = name, "database created");
        self.schedule_save(name);
        Outcome::Applied(())
    }

    pub fn use_database(&self, name: &str) -> Outcome<()> {
        if self.is_closed() {
            return Outcome::Skipped(Rejection::Closed);
        }
        let mut state = self.state.write();
        if !state.databases.contains_key(name) {
            return Outcome::Skipped(Rejection::DatabaseNotFound(name.to_string()));
        }
        state.current = Some(name.to_string());
        debug!(database = name, "database selected");
        Outcome::Applied(())
    }

    pub fn current_database(&self) -> Option<String> {
        self.state.read().current.clone()
    }

    /// Names of every database, sorted.
    pub fn list_databases(&self) -> Vec<String> {
        self.state.read().databases.keys().cloned().collect()
    }

    /// Tables of the current database, in creation order.
    pub fn list_tables(&self) -> Outcome<Vec<String>> {
        let state = self.state.read();
        match self.current_or_reject(&state) {
            Ok(current) => Outcome::Applied(
                state
                    .databases
                    .get(&current)
                    .map(|c| c.keys().cloned().collect())
                    .unwrap_or_default(),
            ),
            Err(rejection) => Outcome::Skipped(rejection),
        }
    }

    pub fn create_table(&self, name: &str, spec: TableSpec) -> Outcome<()> {
        let name = name.trim();
        if name.is_empty() {
            return Outcome::Skipped(Rejection::InvalidArgument("table name is empty".to_string()));
        }
        let database = {
            let mut state = self.state.write();
            let current = match self.current_or_reject(&state) {
                Ok(current) => current,
                Err(rejection) => return Outcome::Skipped(rejection),
            };
            let Some(catalog) = state.databases.get_mut(&current) else {
                return Outcome::Skipped(Rejection::DatabaseNotFound(current));
            };
            if catalog.contains_key(name) {
                return Outcome::Skipped(Rejection::TableExists(name.to_string()));
            }

            let mut table = PartitionedTable::new(
                name,
                spec.primary_key.unwrap_or_else(|| self.config.default_primary_key.clone()),
                spec.num_partitions.unwrap_or(self.config.default_partitions),
            );
            table.columns = spec.columns;
            table.compressed = spec.compressed;
            info!(
                database = %current,
                table = name,
                primary_key = %table.primary_key,
                partitions = table.num_partitions,
                "table created"
            );
            catalog.insert(name.to_string(), table);
            current
        };
        self.after_mutation(&database, name);
        Outcome::Applied(())
    }

    pub fn drop_table(&self, name: &str) -> Outcome<()> {
        let (database, _guard) = match self.acquire(name) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        {
            let mut state = self.state.write();
            let removed = state
                .databases
                .get_mut(&database)
                .and_then(|c| c.shift_remove(name));
            if removed.is_none() {
                return Outcome::Skipped(Rejection::TableNotFound(name.to_string()));
            }
            state.forget_table(&database, name);
        }
        info!(database = %database, table = name, "table dropped");
        self.after_mutation(&database, name);
        Outcome::Applied(())
    }

    /// Remove a database with its indexes. Its backing file is deleted unless
    /// it was mounted from an external path.
    pub fn drop_database(&self, name: &str) -> Outcome<()> {
        if self.is_closed() {
            return Outcome::Skipped(Rejection::Closed);
        }
        let mounted = {
            let mut state = self.state.write();
            if state.remove_database(name).is_none() {
                return Outcome::Skipped(Rejection::DatabaseNotFound(name.to_string()));
            }
            state.mounts.remove(name).is_some()
        };
        self.cache.invalidate_database(name);

        let remove_file = (!mounted).then(|| self.layout.database_path(name));
        self.saves.evict_later(name, remove_file);
        info!(database = name, mounted, "database dropped");
        Outcome::Applied(())
    }

    /// Deep copy of `source` under a new name.
    pub fn clone_database(&self, source: &str, target: &str) -> Outcome<()> {
        if self.is_closed() {
            return Outcome::Skipped(Rejection::Closed);
        }
        {
            let mut state = self.state.write();
            if state.databases.contains_key(target) {
                return Outcome::Skipped(Rejection::DatabaseExists(target.to_string()));
            }
            let Some(catalog) = state.databases.get(source).cloned() else {
                return Outcome::Skipped(Rejection::DatabaseNotFound(source.to_string()));
            };
            state.databases.insert(target.to_string(), catalog);
        }
        info!(source, target, "database cloned");
        self.schedule_save(target);
        Outcome::Applied(())
    }

    /// Hold the write lock of `table` until the guard is dropped.
    pub fn lock_table(&self, table: &str) -> Outcome<TableLock<'_>> {
        match self.acquire(table) {
            Ok((_, guard)) => Outcome::Applied(guard),
            Err(rejection) => Outcome::Skipped(rejection),
        }
    }

    pub fn is_locked(&self, table: &str) -> bool {
        let current = self.current_database().unwrap_or_default();
        self.locks.is_locked(&current, table)
    }

    // Persistence

    /// Bind `name` to an external database file and load it, replacing any
    /// in-memory database of that name. The binding stays even when the file
    /// does not exist yet, so the next save creates it.
    pub async fn mount(&self, name: &str, path: impl Into<PathBuf>) -> Result<Outcome<usize>> {
        if self.is_closed() {
            return Ok(Outcome::Skipped(Rejection::Closed));
        }
        let path = path.into();
        self.state.write().mounts.insert(name.to_string(), path.clone());
        self.saves.evict(name, None).await?;

        if !path.exists() {
            warn!(database = name, path = %path.display(), "mounted file not found");
            return Ok(Outcome::Skipped(Rejection::StoreNotFound(path)));
        }
        let tables = self.load_into(name, path.clone()).await?;
        info!(database = name, path = %path.display(), tables, "database mounted");
        Ok(Outcome::Applied(tables))
    }

    /// Save a mounted database, then evict its state, indexes and connection.
    pub async fn demount(&self, name: &str) -> Result<Outcome<()>> {
        if self.is_closed() {
            return Ok(Outcome::Skipped(Rejection::Closed));
        }
        if !self.state.read().mounts.contains_key(name) {
            return Ok(Outcome::Skipped(Rejection::NotMounted(name.to_string())));
        }

        self.saves.save_now(name).await?;
        {
            let mut state = self.state.write();
            state.remove_database(name);
            state.mounts.remove(name);
        }
        self.cache.invalidate_database(name);
        self.saves.evict(name, None).await?;
        info!(database = name, "database demounted");
        Ok(Outcome::Applied(()))
    }

    /// Save `name` now, behind any queued work, and wait for the commit.
    pub async fn save_database(&self, name: &str) -> Result<Outcome<SaveReport>> {
        if self.is_closed() {
            return Ok(Outcome::Skipped(Rejection::Closed));
        }
        if !self.state.read().databases.contains_key(name) {
            return Ok(Outcome::Skipped(Rejection::DatabaseNotFound(name.to_string())));
        }
        Ok(Outcome::Applied(self.saves.save_now(name).await?))
    }

    /// Wait until every queued save has run.
    pub async fn flush(&self) {
        self.saves.wait_idle().await;
    }

    /// Refuse further commands, drain the save queue and close every connection.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.saves.wait_idle().await;
        self.saves.shutdown().await;
        info!("engine closed");
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.read();
        let uptime_secs = SystemTime::now()
            .duration_since(self.start_time)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        EngineStats {
            uptime_secs,
            start_time: self.start_time,
            current_database: state.current.clone(),
            databases: state.databases.len(),
            tables: state.databases.values().map(|c| c.len()).sum(),
            records: state
                .databases
                .values()
                .flat_map(|c| c.values())
                .map(|t| t.len())
                .sum(),
            mounted: state.mounts.len(),
            dimension_indexes: state.indexes.values().map(|i| i.dimensions.len()).sum(),
            composite_indexes: state.indexes.values().map(|i| i.composites.len()).sum(),
            pyramid_index: state.pyramid.as_ref().map(|s| format!("{}.{}", s.database, s.table)),
            sphere_index: state.sphere.as_ref().map(|s| format!("{}.{}", s.database, s.table)),
            locked_tables: self.locks.held_count(),
            pending_saves: self.saves.pending(),
            queries: self.query_count.load(Ordering::Relaxed),
            writes: self.write_count.load(Ordering::Relaxed),
            cache_stats: self.cache.stats(),
        }
    }
}
