use std::time::SystemTime;
use serde::{Serialize, Deserialize};
use crate::query::cache::CacheStats;

/// Engine statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    // General info
    pub uptime_secs: u64,
    pub start_time: SystemTime,
    pub current_database: Option<String>,

    // Catalog
    pub databases: usize,
    pub tables: usize,
    pub records: usize,
    pub mounted: usize,

    // Indexes
    pub dimension_indexes: usize,
    pub composite_indexes: usize,
    pub pyramid_index: Option<String>,          // "db.table" the slot was built over
    pub sphere_index: Option<String>,

    // Activity
    pub locked_tables: usize,
    pub pending_saves: usize,
    pub queries: u64,
    pub writes: u64,
    pub cache_stats: CacheStats,
}

impl EngineStats {
    pub fn queries_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            return self.queries as f64;
        }
        self.queries as f64 / self.uptime_secs as f64
    }
}
