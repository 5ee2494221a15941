use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use indexmap::IndexMap;
use tracing::warn;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::Record;
use crate::index::pyramid::PyramidIndex;
use crate::index::registry::{maintenance_targets, IndexSlot, TableIndexes};
use crate::index::sphere_weaving::RecursiveSphereWeaving;
use crate::index::{propagate, IndexChange};
use crate::query::ast::Predicate;
use crate::query::matcher::SubqueryResolver;
use crate::storage::partitioned_table::{has_usable_key, PartitionedTable};

/// Tables of one database, in creation order
pub type Catalog = IndexMap<String, PartitionedTable>;

/// Everything guarded by the engine's state lock
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub databases: BTreeMap<String, Catalog>,
    pub current: Option<String>,
    pub indexes: HashMap<(String, String), TableIndexes>,
    pub pyramid: Option<IndexSlot<PyramidIndex>>,
    pub sphere: Option<IndexSlot<RecursiveSphereWeaving>>,
    pub mounts: HashMap<String, PathBuf>,
}

fn index_key(database: &str, table: &str) -> (String, String) {
    (database.to_string(), table.to_string())
}

impl EngineState {
    pub fn table(&self, database: &str, table: &str) -> Option<&PartitionedTable> {
        self.databases.get(database).and_then(|c| c.get(table))
    }

    pub fn table_mut(&mut self, database: &str, table: &str) -> Option<&mut PartitionedTable> {
        self.databases.get_mut(database).and_then(|c| c.get_mut(table))
    }

    pub fn table_indexes(&self, database: &str, table: &str) -> Option<&TableIndexes> {
        self.indexes.get(&index_key(database, table))
    }

    pub fn table_indexes_mut(&mut self, database: &str, table: &str) -> &mut TableIndexes {
        self.indexes.entry(index_key(database, table)).or_default()
    }

    pub fn resolver<'a>(&'a self, database: &'a str) -> CatalogResolver<'a> {
        CatalogResolver {
            database,
            tables: self.databases.get(database),
        }
    }

    /// Insert or overwrite a record and bring every index of the table along.
    /// With `auto_index`, fields without an inverted index get one first.
    pub fn put_record(&mut self, database: &str, table: &str, record: Record, auto_index: bool) -> bool {
        let EngineState { databases, indexes, pyramid, sphere, .. } = self;
        let Some(target) = databases.get_mut(database).and_then(|c| c.get_mut(table)) else {
            return false;
        };
        let slot = index_key(database, table);

        if auto_index {
            let existing: &PartitionedTable = target;
            indexes
                .entry(slot.clone())
                .or_default()
                .ensure_dimensions(&record, || existing.partitions().iter().flat_map(|p| p.iter()));
        }

        let key = target.key_of(&record);
        let previous = target.insert(record);
        let Some(current) = target.get(&key) else {
            return false;
        };

        let mut targets = maintenance_targets(indexes.get_mut(&slot), pyramid.as_mut(), sphere.as_mut(), database, table);
        let change = match &previous {
            Some(old) => IndexChange::Update { old_key: &key, old, new_key: &key, new: current },
            None => IndexChange::Insert { key: &key, record: current },
        };
        propagate(&mut targets, change);
        true
    }

    /// Apply `edit` to the record stored under `key`. A changed primary key
    /// moves the record; a record already under the new key is replaced.
    /// Edits leaving a null or empty key are refused.
    pub fn edit_record(&mut self, database: &str, table: &str, key: &str, edit: impl FnOnce(&mut Record)) -> bool {
        let EngineState { databases, indexes, pyramid, sphere, .. } = self;
        let Some(target) = databases.get_mut(database).and_then(|c| c.get_mut(table)) else {
            return false;
        };
        let Some(old) = target.get(key).cloned() else {
            return false;
        };

        let mut edited = old.clone();
        edit(&mut edited);
        if edited == old {
            return true;
        }
        if !has_usable_key(&edited, &target.primary_key) {
            warn!(database, table, key, "edit would clear the primary key, record left unchanged");
            return false;
        }

        let new_key = target.key_of(&edited);
        let displaced = if new_key == key {
            target.insert(edited);
            None
        } else {
            target.remove(key);
            target.insert(edited)
        };
        let Some(current) = target.get(&new_key) else {
            return false;
        };

        let slot = index_key(database, table);
        let mut targets = maintenance_targets(indexes.get_mut(&slot), pyramid.as_mut(), sphere.as_mut(), database, table);
        if let Some(displaced) = &displaced {
            propagate(&mut targets, IndexChange::Delete { key: &new_key, record: displaced });
        }
        propagate(
            &mut targets,
            IndexChange::Update { old_key: key, old: &old, new_key: &new_key, new: current },
        );
        true
    }

    pub fn remove_record(&mut self, database: &str, table: &str, key: &str) -> Option<Record> {
        let EngineState { databases, indexes, pyramid, sphere, .. } = self;
        let removed = databases.get_mut(database)?.get_mut(table)?.remove(key)?;
        let slot = index_key(database, table);
        let mut targets = maintenance_targets(indexes.get_mut(&slot), pyramid.as_mut(), sphere.as_mut(), database, table);
        propagate(&mut targets, IndexChange::Delete { key, record: &removed });
        Some(removed)
    }

    /// Remove the inverted index of one dimension.
    pub fn drop_dimension(&mut self, database: &str, table: &str, dimension: &str) -> bool {
        self.indexes
            .get_mut(&index_key(database, table))
            .is_some_and(|ix| ix.dimensions.shift_remove(dimension).is_some())
    }

    /// Drop every index built over one table.
    pub fn forget_table(&mut self, database: &str, table: &str) {
        self.indexes.remove(&index_key(database, table));
        if self.pyramid.as_ref().is_some_and(|s| s.belongs_to(database, table)) {
            self.pyramid = None;
        }
        if self.sphere.as_ref().is_some_and(|s| s.belongs_to(database, table)) {
            self.sphere = None;
        }
    }

    /// Drop every index built over any table of `database`.
    pub fn forget_database(&mut self, database: &str) {
        self.indexes.retain(|(db, _), _| db != database);
        if self.pyramid.as_ref().is_some_and(|s| s.database == database) {
            self.pyramid = None;
        }
        if self.sphere.as_ref().is_some_and(|s| s.database == database) {
            self.sphere = None;
        }
    }

    /// Remove a database with its indexes; it stops being the current one.
    pub fn remove_database(&mut self, database: &str) -> Option<Catalog> {
        let removed = self.databases.remove(database)?;
        self.forget_database(database);
        if self.current.as_deref() == Some(database) {
            self.current = None;
        }
        Some(removed)
    }

    /// Live records for `keys`, skipping keys no longer present and repeats.
    pub fn resolve_keys<'k>(&self, database: &str, table: &str, keys: impl IntoIterator<Item = &'k String>) -> Vec<Record> {
        let Some(target) = self.table(database, table) else {
            return Vec::new();
        };
        let mut seen = std::collections::HashSet::new();
        keys.into_iter()
            .filter(|key| seen.insert(key.as_str()))
            .filter_map(|key| target.get(key).cloned())
            .collect()
    }
}

/// Subquery access to the tables of one database
pub(crate) struct CatalogResolver<'a> {
    database: &'a str,
    tables: Option<&'a Catalog>,
}

impl SubqueryResolver for CatalogResolver<'_> {
    fn resolve(&self, table: &str, predicate: &Predicate) -> Result<Vec<Record>> {
        let target = self.tables.and_then(|c| c.get(table)).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("Table {} does not exist in database {}", table, self.database),
            )
        })?;
        Ok(target.query(predicate, &[], self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldValue;
    use serde_json::json;

    fn state_with_table() -> EngineState {
        let mut state = EngineState::default();
        let mut catalog = Catalog::new();
        catalog.insert("t".into(), PartitionedTable::new("t", "id", 4));
        state.databases.insert("d".into(), catalog);
        state
    }

    fn rec(value: serde_json::Value) -> Record {
        Record::from_json(&value).unwrap()
    }

    #[test]
    fn edits_follow_a_changed_primary_key() {
        let mut state = state_with_table();
        state.put_record("d", "t", rec(json!({"id": 1, "a": 5})), true);
        assert!(state.edit_record("d", "t", "1", |r| {
            r.insert("id", 9);
        }));

        let table = state.table("d", "t").unwrap();
        assert!(table.get("1").is_none());
        assert_eq!(table.get("9").and_then(|r| r.get("a")), Some(&FieldValue::Number(5.0)));
        let by_a = state.table_indexes("d", "t").unwrap().dimensions["a"].lookup(&5.into());
        assert_eq!(by_a, ["9".to_string()]);
    }

    #[test]
    fn edits_cannot_clear_the_primary_key() {
        let mut state = state_with_table();
        state.put_record("d", "t", rec(json!({"id": 1, "a": 5})), true);
        assert!(!state.edit_record("d", "t", "1", |r| {
            r.insert("id", FieldValue::Null);
        }));
        assert!(!state.edit_record("d", "t", "1", |r| {
            r.insert("id", "");
        }));
        assert!(!state.edit_record("d", "t", "1", |r| {
            r.remove("id");
        }));

        let table = state.table("d", "t").unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get("null").is_none() && table.get("").is_none());
        assert_eq!(table.get("1").and_then(|r| r.get("id")), Some(&FieldValue::Number(1.0)));
    }

    #[test]
    fn resolver_reports_missing_tables() {
        let state = state_with_table();
        let resolver = state.resolver("d");
        assert!(resolver.resolve("t", &Predicate::MatchAll).unwrap().is_empty());
        assert!(resolver.resolve("nope", &Predicate::MatchAll).is_err());
    }
}
