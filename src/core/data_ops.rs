use std::collections::HashSet;
use std::sync::atomic::Ordering;
use serde_json::Value;
use tracing::{debug, info, warn};
use crate::core::database::{HypercubeDb, SelectResult};
use crate::core::error::Result;
use crate::core::outcome::{Outcome, Rejection};
use crate::core::types::{FieldValue, Record, ValueKey};
use crate::query::ast::Predicate;
use crate::query::cache::QueryKey;
use crate::storage::partitioned_table::has_usable_key;

/// Record from a JSON object: keys trimmed, empty keys dropped.
fn record_from_object(value: &Value) -> std::result::Result<Record, Rejection> {
    let Value::Object(map) = value else {
        return Err(Rejection::InvalidRecord("expected a JSON object".to_string()));
    };
    Ok(map
        .iter()
        .filter_map(|(field, v)| {
            let field = field.trim();
            (!field.is_empty()).then(|| (field.to_string(), FieldValue::from_json(v)))
        })
        .collect())
}

/// Inserted records need a usable primary key; 0 is a valid key.
fn keyed_record(value: &Value, primary_key: &str) -> std::result::Result<Record, Rejection> {
    let record = record_from_object(value)?;
    if !has_usable_key(&record, primary_key) {
        return Err(Rejection::InvalidRecord(format!("missing or empty primary key {}", primary_key)));
    }
    Ok(record)
}

/// Drop rows equal by value, keeping the first occurrence.
fn distinct(rows: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let mut signature: Vec<(String, ValueKey)> = row
                .iter()
                .map(|(field, value)| (field.clone(), ValueKey::from(value)))
                .collect();
            signature.sort();
            seen.insert(signature)
        })
        .collect()
}

impl HypercubeDb {
    pub fn insert_data(&self, table: &str, record: &Value) -> Outcome<()> {
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        {
            let mut state = self.state.write();
            let Some(primary_key) = state.table(&database, table).map(|t| t.primary_key.clone()) else {
                return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
            };
            let record = match keyed_record(record, &primary_key) {
                Ok(record) => record,
                Err(rejection) => {
                    warn!(table, reason = %rejection, "insert rejected");
                    return Outcome::Skipped(rejection);
                }
            };
            state.put_record(&database, table, record, self.config.auto_index_dimensions);
        }
        debug!(database = %database, table, "record inserted");
        self.after_mutation(&database, table);
        Outcome::Applied(())
    }

    /// Insert many records under one lock. Invalid records are logged and skipped.
    pub fn insert_batch(&self, table: &str, records: &[Value]) -> Outcome<usize> {
        if records.is_empty() {
            return Outcome::Skipped(Rejection::InvalidArgument("empty insert batch".to_string()));
        }
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        let inserted = {
            let mut state = self.state.write();
            let Some(primary_key) = state.table(&database, table).map(|t| t.primary_key.clone()) else {
                return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
            };
            let mut inserted = 0;
            for (position, value) in records.iter().enumerate() {
                match keyed_record(value, &primary_key) {
                    Ok(record) => {
                        if state.put_record(&database, table, record, self.config.auto_index_dimensions) {
                            inserted += 1;
                        }
                    }
                    Err(rejection) => warn!(table, position, reason = %rejection, "skipping batch record"),
                }
            }
            inserted
        };
        info!(database = %database, table, inserted, total = records.len(), "batch inserted");
        if inserted > 0 {
            self.after_mutation(&database, table);
        }
        Outcome::Applied(inserted)
    }

    /// Merge `patch` into every record matching `predicate`.
    pub fn update_data(&self, table: &str, predicate: &Value, patch: &Value) -> Result<Outcome<usize>> {
        self.patch_where(table, predicate, patch, "records updated")
    }

    /// Same merge as `update_data`, reported as a column update.
    pub fn update_batch_column(&self, table: &str, predicate: &Value, patch: &Value) -> Result<Outcome<usize>> {
        self.patch_where(table, predicate, patch, "batch column update")
    }

    fn patch_where(&self, table: &str, predicate: &Value, patch: &Value, action: &str) -> Result<Outcome<usize>> {
        let predicate = Predicate::from_json(predicate)?;
        let patch = match record_from_object(patch) {
            Ok(patch) if !patch.is_empty() => patch,
            Ok(_) => return Ok(Outcome::Skipped(Rejection::InvalidArgument("empty patch".to_string()))),
            Err(rejection) => return Ok(Outcome::Skipped(rejection)),
        };
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Ok(Outcome::Skipped(rejection)),
        };

        let updated = {
            let mut state = self.state.write();
            let keys = match state.table(&database, table) {
                Some(target) => target.matching_keys(&predicate, &state.resolver(&database)),
                None => return Ok(Outcome::Skipped(Rejection::TableNotFound(table.to_string()))),
            };
            keys.iter()
                .filter(|key| state.edit_record(&database, table, key, |record| record.merge(&patch)))
                .count()
        };

        info!(database = %database, table, updated, "{}", action);
        if updated > 0 {
            self.after_mutation(&database, table);
        }
        Ok(Outcome::Applied(updated))
    }

    /// Merge each patch into the record under its key. On compressed tables a
    /// key may also be given as its published digest.
    pub fn update_batch(&self, table: &str, updates: &[(FieldValue, Value)]) -> Outcome<usize> {
        if updates.is_empty() {
            return Outcome::Skipped(Rejection::InvalidArgument("empty update batch".to_string()));
        }
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };

        let updated = {
            let mut state = self.state.write();
            let mut updated = 0;
            for (key, patch) in updates {
                let patch = match record_from_object(patch) {
                    Ok(patch) => patch,
                    Err(rejection) => {
                        warn!(table, key = %key, reason = %rejection, "skipping batch update");
                        continue;
                    }
                };
                let Some(raw_key) = state.table(&database, table).map(|t| t.get_raw_key(&key.to_text())) else {
                    return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
                };
                if state.edit_record(&database, table, &raw_key, |record| record.merge(&patch)) {
                    updated += 1;
                } else {
                    debug!(table, key = %raw_key, "no record under key");
                }
            }
            updated
        };

        info!(database = %database, table, updated, "batch updated");
        if updated > 0 {
            self.after_mutation(&database, table);
        }
        Outcome::Applied(updated)
    }

    /// Remove every record matching `predicate`; returns how many went.
    pub fn delete_data(&self, table: &str, predicate: &Value) -> Result<Outcome<usize>> {
        let predicate = Predicate::from_json(predicate)?;
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Ok(Outcome::Skipped(rejection)),
        };

        let deleted = {
            let mut state = self.state.write();
            let keys = match state.table(&database, table) {
                Some(target) => target.matching_keys(&predicate, &state.resolver(&database)),
                None => return Ok(Outcome::Skipped(Rejection::TableNotFound(table.to_string()))),
            };
            keys.iter()
                .filter(|key| state.remove_record(&database, table, key).is_some())
                .count()
        };

        info!(database = %database, table, deleted, "records deleted");
        if deleted > 0 {
            self.after_mutation(&database, table);
        }
        Ok(Outcome::Applied(deleted))
    }

    /// Matching records projected to `fields` (`*` or none for whole records),
    /// without repeats.
    pub fn select_data(&self, table: &str, predicate: &Value, fields: &[&str]) -> Result<Outcome<SelectResult>> {
        let predicate = Predicate::from_json(predicate)?;
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Ok(Outcome::Skipped(rejection)),
        };
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let cache_key = QueryKey::for_query(&database, table, &predicate, &fields);
        if let Some(data) = cache_key.as_ref().and_then(|key| self.cache.get(key)) {
            debug!(table, rows = data.len(), "select served from cache");
            return Ok(Outcome::Applied(SelectResult { data }));
        }

        let rows = {
            let state = self.state.read();
            match state.table(&database, table) {
                Some(target) => target.query(&predicate, &fields, &state.resolver(&database)),
                None => return Ok(Outcome::Skipped(Rejection::TableNotFound(table.to_string()))),
            }
        };
        let data = distinct(rows);
        if let Some(key) = cache_key {
            self.cache.put(key, data.clone());
        }
        Ok(Outcome::Applied(SelectResult { data }))
    }

    /// Remove `column` from every matching record and drop its inverted index.
    pub fn delete_column(&self, table: &str, column: &str, predicate: &Value) -> Result<Outcome<usize>> {
        let predicate = Predicate::from_json(predicate)?;
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Ok(Outcome::Skipped(rejection)),
        };

        let removed = {
            let mut state = self.state.write();
            let keys: Vec<String> = match state.table(&database, table) {
                Some(target) if target.primary_key == column => {
                    return Ok(Outcome::Skipped(Rejection::InvalidArgument(format!(
                        "{} is the primary key",
                        column
                    ))));
                }
                Some(target) => target
                    .matching_keys(&predicate, &state.resolver(&database))
                    .into_iter()
                    .filter(|key| target.get(key).is_some_and(|r| r.contains(column)))
                    .collect(),
                None => return Ok(Outcome::Skipped(Rejection::TableNotFound(table.to_string()))),
            };
            let removed = keys
                .iter()
                .filter(|key| {
                    state.edit_record(&database, table, key, |record| {
                        record.remove(column);
                    })
                })
                .count();
            if removed > 0 {
                state.drop_dimension(&database, table, column);
            }
            removed
        };

        if removed == 0 {
            debug!(table, column, "no matching record has the column");
            return Ok(Outcome::Applied(0));
        }
        info!(database = %database, table, column, removed, "column deleted");
        self.after_mutation(&database, table);
        Ok(Outcome::Applied(removed))
    }

    /// Copy `source` into a new table of the current database. Indexes are not copied.
    pub fn clone_table(&self, source: &str, target: &str) -> Outcome<()> {
        let database = match self.table_context(source) {
            Ok(database) => database,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        {
            let mut state = self.state.write();
            let Some(catalog) = state.databases.get_mut(&database) else {
                return Outcome::Skipped(Rejection::DatabaseNotFound(database));
            };
            if catalog.contains_key(target) {
                return Outcome::Skipped(Rejection::TableExists(target.to_string()));
            }
            let Some(copy) = catalog.get(source).map(|t| t.clone_as(target)) else {
                return Outcome::Skipped(Rejection::TableNotFound(source.to_string()));
            };
            catalog.insert(target.to_string(), copy);
        }
        info!(database = %database, source, target, "table cloned");
        self.after_mutation(&database, target);
        Outcome::Applied(())
    }

    /// Persist `table` through the conical projection from the next save on.
    pub fn enable_compression(&self, table: &str) -> Outcome<()> {
        self.set_compression(table, true)
    }

    pub fn disable_compression(&self, table: &str) -> Outcome<()> {
        self.set_compression(table, false)
    }

    fn set_compression(&self, table: &str, compressed: bool) -> Outcome<()> {
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        match self.state.write().table_mut(&database, table) {
            Some(target) => target.compressed = compressed,
            None => return Outcome::Skipped(Rejection::TableNotFound(table.to_string())),
        }
        info!(database = %database, table, compressed, "compression toggled");
        self.after_mutation(&database, table);
        Outcome::Applied(())
    }
}
