use lru::LruCache;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::core::types::Record;
use crate::query::ast::Predicate;

/// Query cache for avoiding repeated scans of unchanged tables
pub struct QueryCache {
    cache: Option<Mutex<LruCache<QueryKey, Vec<Record>>>>,
    size_limit: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct QueryKey {
    pub database: String,
    pub table: String,
    pub predicate: String,
    pub fields: Vec<String>,
}

impl QueryKey {
    /// None for predicates whose result depends on other tables.
    pub fn for_query(database: &str, table: &str, predicate: &Predicate, fields: &[String]) -> Option<Self> {
        if predicate.is_correlated() {
            return None;
        }
        Some(QueryKey {
            database: database.to_string(),
            table: table.to_string(),
            predicate: format!("{:?}", predicate),
            fields: fields.to_vec(),
        })
    }
}

impl QueryCache {
    /// A zero size disables caching.
    pub fn new(size_limit: usize) -> Self {
        QueryCache {
            cache: NonZeroUsize::new(size_limit).map(|cap| Mutex::new(LruCache::new(cap))),
            size_limit,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<Vec<Record>> {
        let cache = self.cache.as_ref()?;
        if let Some(results) = cache.lock().get(key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            Some(results.clone())
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, key: QueryKey, results: Vec<Record>) {
        if let Some(cache) = &self.cache {
            cache.lock().put(key, results);
        }
    }

    /// Drop every cached result of one table.
    pub fn invalidate_table(&self, database: &str, table: &str) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let stale: Vec<QueryKey> = cache
                .iter()
                .filter(|(k, _)| k.database == database && k.table == table)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
            }
        }
    }

    pub fn invalidate_database(&self, database: &str) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let stale: Vec<QueryKey> = cache
                .iter()
                .filter(|(k, _)| k.database == database)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
            }
        }
    }

    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.cache.as_ref().map(|c| c.lock().len()).unwrap_or(0),
            capacity: self.size_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}
