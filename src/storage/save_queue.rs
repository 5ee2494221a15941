use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::partitioned_table::PartitionedTable;
use crate::storage::sqlite_store::{SaveReport, SqliteStore};

/// Everything the worker needs to persist one database
#[derive(Debug, Clone)]
pub struct DatabaseSnapshot {
    pub path: PathBuf,
    pub tables: Vec<PartitionedTable>,
}

/// Where the worker reads in-memory state from, at the moment a save runs.
pub trait SnapshotSource: Send + Sync + 'static {
    /// `None` when the database no longer exists.
    fn snapshot(&self, database: &str) -> Option<DatabaseSnapshot>;
}

enum StoreJob {
    Save {
        database: String,
        done: Option<oneshot::Sender<Result<SaveReport>>>,
    },
    Load {
        database: String,
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<PartitionedTable>>>,
    },
    Evict {
        database: String,
        remove_file: Option<PathBuf>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Single background worker that serializes every SQLite operation.
/// Saves for the same database coalesce while one is still queued.
pub struct SaveQueue {
    sender: mpsc::UnboundedSender<StoreJob>,
    pending: Arc<Mutex<HashSet<String>>>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl SaveQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(store: SqliteStore, source: Arc<dyn SnapshotSource>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let (outstanding, _) = watch::channel(0usize);
        let outstanding = Arc::new(outstanding);

        tokio::spawn(run_worker(
            receiver,
            store,
            source,
            Arc::clone(&pending),
            Arc::clone(&outstanding),
        ));

        SaveQueue { sender, pending, outstanding }
    }

    fn submit(&self, job: StoreJob) -> bool {
        self.outstanding.send_modify(|n| *n += 1);
        if self.sender.send(job).is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            warn!("store worker is gone, job dropped");
            return false;
        }
        true
    }

    /// Queue a save of `database` unless one is already waiting.
    pub fn schedule_save(&self, database: &str) -> bool {
        if !self.pending.lock().insert(database.to_string()) {
            debug!(database, "save already queued");
            return false;
        }
        let queued = self.submit(StoreJob::Save { database: database.to_string(), done: None });
        if !queued {
            self.pending.lock().remove(database);
        }
        queued
    }

    /// Save `database` behind any queued work and wait for the result.
    pub async fn save_now(&self, database: &str) -> Result<SaveReport> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(database.to_string());
        if !self.submit(StoreJob::Save { database: database.to_string(), done: Some(tx) }) {
            return Err(worker_gone());
        }
        rx.await.map_err(|_| worker_gone())?
    }

    pub async fn load(&self, database: &str, path: PathBuf) -> Result<Vec<PartitionedTable>> {
        let (tx, rx) = oneshot::channel();
        if !self.submit(StoreJob::Load { database: database.to_string(), path, reply: tx }) {
            return Err(worker_gone());
        }
        rx.await.map_err(|_| worker_gone())?
    }

    /// Close the connection of `database`, then delete `remove_file` if given.
    pub async fn evict(&self, database: &str, remove_file: Option<PathBuf>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let job = StoreJob::Evict { database: database.to_string(), remove_file, reply: Some(tx) };
        if !self.submit(job) {
            return Err(worker_gone());
        }
        rx.await.map_err(|_| worker_gone())?
    }

    /// Same as `evict` without waiting for completion.
    pub fn evict_later(&self, database: &str, remove_file: Option<PathBuf>) {
        self.submit(StoreJob::Evict { database: database.to_string(), remove_file, reply: None });
    }

    /// Resolves once every job submitted so far has finished.
    pub async fn wait_idle(&self) {
        let mut idle = self.outstanding.subscribe();
        if idle.wait_for(|n| *n == 0).await.is_err() {
            debug!("store worker stopped while waiting for idle");
        }
    }

    /// Databases with a save still waiting in the queue.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drain the queue, close every connection and stop the worker.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.submit(StoreJob::Shutdown { reply: tx }) {
            let _ = rx.await;
        }
    }
}

fn worker_gone() -> Error {
    Error::new(ErrorKind::InvalidState, "store worker has stopped".to_string())
}

/// Run `f` on the blocking pool and hand the store back. A panicking job
/// loses the store's connections; a fresh store takes its place.
async fn blocking<T, F>(mut store: SqliteStore, f: F) -> (SqliteStore, Result<T>)
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteStore) -> Result<T> + Send + 'static,
{
    let settings = store.settings().clone();
    match tokio::task::spawn_blocking(move || {
        let out = f(&mut store);
        (store, out)
    })
    .await
    {
        Ok((store, out)) => (store, out),
        Err(err) => {
            error!(error = %err, "store job panicked, reopening connections lazily");
            (SqliteStore::new(settings), Err(err.into()))
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<StoreJob>,
    mut store: SqliteStore,
    source: Arc<dyn SnapshotSource>,
    pending: Arc<Mutex<HashSet<String>>>,
    outstanding: Arc<watch::Sender<usize>>,
) {
    while let Some(job) = receiver.recv().await {
        let mut stop = None;
        store = match job {
            StoreJob::Save { database, done } => {
                pending.lock().remove(&database);
                let (store, result) = match source.snapshot(&database) {
                    Some(snapshot) => {
                        let name = database.clone();
                        blocking(store, move |s| s.save(&name, &snapshot.path, &snapshot.tables)).await
                    }
                    None => {
                        debug!(database = %database, "database dropped before save");
                        (store, Ok(SaveReport::default()))
                    }
                };
                match &result {
                    Ok(report) => info!(database = %database, tables = report.tables, rows = report.rows, "database saved"),
                    Err(err) => error!(database = %database, error = %err, "save failed, nothing committed"),
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                store
            }
            StoreJob::Load { database, path, reply } => {
                let (store, result) = blocking(store, move |s| s.load(&database, &path)).await;
                let _ = reply.send(result);
                store
            }
            StoreJob::Evict { database, remove_file, reply } => {
                let (store, result) = blocking(store, move |s| {
                    s.evict(&database);
                    if let Some(path) = remove_file.filter(|p| p.exists()) {
                        std::fs::remove_file(&path)?;
                        info!(database = %database, path = %path.display(), "database file removed");
                    }
                    Ok(())
                })
                .await;
                if let Err(err) = &result {
                    warn!(error = %err, "evicting backing store failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                store
            }
            StoreJob::Shutdown { reply } => {
                let (store, _) = blocking(store, |s| {
                    s.close_all();
                    Ok(())
                })
                .await;
                stop = Some(reply);
                store
            }
        };
        outstanding.send_modify(|n| *n = n.saturating_sub(1));
        if let Some(reply) = stop {
            let _ = reply.send(());
            break;
        }
    }
    debug!("store worker stopped");
}
