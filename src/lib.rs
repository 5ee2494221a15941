pub mod core;
pub mod storage;
pub mod index;
pub mod query;
pub mod compression;

pub use crate::core::config::Config;
pub use crate::core::database::{HypercubeDb, SelectResult, TableSpec};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::index_ops::DimRange;
pub use crate::core::outcome::{Outcome, Rejection};
pub use crate::core::types::{FieldValue, Record};

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                            HYPERCUBEDB STRUCT ARCHITECTURE                                 │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── CORE LAYER ─────────────────────────────────────────┐
│                                                                                            │
│  ┌──────────────────────────────────────────────────────────────────────────────────────┐  │
│  │                               struct HypercubeDb                                     │  │
│  │  ┌────────────────────────────────────────────────────────────────────────────────┐  │  │
│  │  │ config: Config                      // Defaults, data_dir, autosave            │  │  │
│  │  │ layout: StorageLayout               // <data_dir>/<db>.db                      │  │  │
│  │  │ state: Arc<RwLock<EngineState>>     // Tables, indexes, mounts, current db     │  │  │
│  │  │ locks: LockManager                  // Fail-fast per-table write flags         │  │  │
│  │  │ cache: QueryCache                   // LRU of select results                   │  │  │
│  │  │ saves: SaveQueue                    // Single SQLite worker                    │  │  │
│  │  │ // Metrics                                                                     │  │  │
│  │  │ start_time, query_count, write_count                                           │  │  │
│  │  └────────────────────────────────────────────────────────────────────────────────┘  │  │
│  └──────────────────────────────────────────────────────────────────────────────────────┘  │
│                                                                                            │
│  ┌──────────────────────┐  ┌──────────────────────┐  ┌──────────────────────────────────┐  │
│  │ struct EngineState   │  │ enum FieldValue      │  │ enum Outcome<T>                  │  │
│  │ • databases          │  │ • Null               │  │ • Applied(T)                     │  │
│  │ • current            │  │ • Number(f64)        │  │ • Skipped(Rejection)             │  │
│  │ • indexes            │  │ • Text(String)       │  └──────────────────────────────────┘  │
│  │ • pyramid: Slot      │  └──────────────────────┘                                        │
│  │ • sphere: Slot       │  ┌──────────────────────┐  ┌──────────────────────────────────┐  │
│  │ • mounts             │  │ struct Record        │  │ struct EngineStats               │  │
│  └──────────────────────┘  │ • fields: IndexMap   │  │ • databases / tables / records   │  │
│                            └──────────────────────┘  │ • pending_saves, cache_stats     │  │
│                                                      └──────────────────────────────────┘  │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── STORAGE LAYER ─────────────────────────────────────────┐
│                                                                                            │
│  ┌────────────────────────┐  ┌──────────────────────┐  ┌────────────────────────────────┐  │
│  │ struct PartitionedTable│  │ struct SaveQueue     │  │ struct SqliteStore             │  │
│  │ • name, primary_key    │  │ • sender: mpsc       │  │ • connections: Map<db, Conn>   │  │
│  │ • num_partitions       │  │ • pending: Set<db>   │  │ • save(): one transaction      │  │
│  │ • partitions: Vec<Map> │  │ • outstanding: watch │  │ • load(): paged replay         │  │
│  │ • compressed, columns  │  └──────────────────────┘  │ • _dbms_meta per table         │  │
│  └────────────────────────┘                            └────────────────────────────────┘  │
│  ┌────────────────────────┐  ┌──────────────────────┐                                      │
│  │ struct LockManager     │  │ struct StorageLayout │                                      │
│  │ • held: Set<(db, t)>   │  │ • base_dir: PathBuf  │                                      │
│  │ • TableLock guard      │  └──────────────────────┘                                      │
│  └────────────────────────┘                                                                │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌───────────────────────────────────── INDEXING LAYER ───────────────────────────────────────┐
│                                                                                            │
│  trait SecondaryIndex { insert, delete, update }    order: inverted → composite → pyramid  │
│                                                            → sphere weaving                │
│  ┌──────────────────────┐  ┌──────────────────────┐  ┌──────────────────────────────────┐  │
│  │ struct DimensionIndex│  │ struct DimensionsTree│  │ struct PyramidIndex              │  │
│  │ • value → [keys]     │  │ • trie per dimension │  │ • median split, max capacity     │  │
│  └──────────────────────┘  │ • string ranges      │  │ • k nearest, neighbour leaves    │  │
│                            └──────────────────────┘  └──────────────────────────────────┘  │
│  ┌──────────────────────────────────┐                                                      │
│  │ struct RecursiveSphereWeaving    │                                                      │
│  │ • key → Riemann sphere point     │                                                      │
│  └──────────────────────────────────┘                                                      │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── QUERY LAYER ─────────────────────────────────────────┐
│                                                                                            │
│  ┌──────────────────────┐  ┌──────────────────────┐  ┌──────────────────────────────────┐  │
│  │ enum Predicate (AST) │  │ struct PredicateMatch│  │ fn parse_subquery                │  │
│  │ • MatchAll / And / Or│  │ • resolver: &dyn     │  │ select <cols> from <t> where ... │  │
│  │ • Not / Fields       │  │   SubqueryResolver   │  └──────────────────────────────────┘  │
│  └──────────────────────┘  └──────────────────────┘                                        │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────── COMPRESSION LAYER ──────────────────────────────────────┐
│                                                                                            │
│  fn map_to_riemann_sphere(v) → [x, y, z]      struct ConicalProjection                     │
│                                               • compress → [tanθ, φ°, intensity, stamp]    │
│                                               • decompress → unit direction                │
└────────────────────────────────────────────────────────────────────────────────────────────┘
*/
