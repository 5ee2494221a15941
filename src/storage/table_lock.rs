use std::collections::HashSet;
use parking_lot::Mutex;
use tracing::debug;

/// Fail-fast, per-table write flags. Acquisition never blocks.
#[derive(Debug, Default)]
pub struct LockManager {
    held: Mutex<HashSet<(String, String)>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager::default()
    }

    /// `None` when another holder has the table.
    pub fn try_acquire(&self, database: &str, table: &str) -> Option<TableLock<'_>> {
        let key = (database.to_string(), table.to_string());
        let mut held = self.held.lock();
        if !held.insert(key.clone()) {
            debug!(database, table, "table lock busy");
            return None;
        }
        Some(TableLock { manager: self, key })
    }

    pub fn is_locked(&self, database: &str, table: &str) -> bool {
        self.held
            .lock()
            .contains(&(database.to_string(), table.to_string()))
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, key: &(String, String)) {
        self.held.lock().remove(key);
    }
}

/// Held table lock, released on drop
#[derive(Debug)]
pub struct TableLock<'a> {
    manager: &'a LockManager,
    key: (String, String),
}

impl TableLock<'_> {
    pub fn table(&self) -> &str {
        &self.key.1
    }
}

impl Drop for TableLock<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = LockManager::new();
        let guard = locks.try_acquire("d", "t").unwrap();
        assert!(locks.try_acquire("d", "t").is_none());
        assert!(locks.try_acquire("d", "other").is_some());
        drop(guard);
        assert!(locks.try_acquire("d", "t").is_some());
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn fails(locks: &LockManager) -> Result<(), ()> {
            let _guard = locks.try_acquire("d", "t").ok_or(())?;
            Err(())
        }
        let locks = LockManager::new();
        assert!(fails(&locks).is_err());
        assert!(!locks.is_locked("d", "t"));
    }
}
