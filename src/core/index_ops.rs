use std::sync::atomic::Ordering;
use serde_json::Value;
use tracing::{debug, info, warn};
use crate::core::database::HypercubeDb;
use crate::core::error::{Error, Result};
use crate::core::outcome::{Outcome, Rejection};
use crate::core::types::{FieldValue, Record, ValueKey};
use crate::index::dimensions_tree::DimensionsTree;
use crate::index::inverted::DimensionIndex;
use crate::index::pyramid::PyramidIndex;
use crate::index::registry::IndexSlot;
use crate::index::sphere_weaving::RecursiveSphereWeaving;
use crate::index::SecondaryIndex;

/// Bound on one dimension of a composite range query
#[derive(Debug, Clone, PartialEq)]
pub enum DimRange {
    Exact(FieldValue),
    Between(FieldValue, FieldValue),
}

impl DimRange {
    /// A two-element array is `[min, max]`; anything else is an exact value.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) if items.len() == 2 => {
                DimRange::Between(FieldValue::from_json(&items[0]), FieldValue::from_json(&items[1]))
            }
            other => DimRange::Exact(FieldValue::from_json(other)),
        }
    }

    /// Inclusive string bounds, as the trie compares them.
    pub fn bounds(&self) -> (String, String) {
        match self {
            DimRange::Exact(value) => (value.to_text(), value.to_text()),
            DimRange::Between(min, max) => (min.to_text(), max.to_text()),
        }
    }
}

impl HypercubeDb {
    /// Build a composite trie over `dimensions` from the table's current records.
    /// Returns the index key (`a|b|c`).
    pub fn create_composite_index(&self, table: &str, dimensions: &[&str]) -> Outcome<String> {
        if dimensions.is_empty() || dimensions.iter().any(|d| d.is_empty()) {
            return Outcome::Skipped(Rejection::InvalidArgument("composite index needs named dimensions".to_string()));
        }
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };

        let key = dimensions.join("|");
        let mut state = self.state.write();
        if state
            .table_indexes(&database, table)
            .is_some_and(|ix| ix.composites.contains_key(&key))
        {
            return Outcome::Skipped(Rejection::IndexExists(key));
        }

        let mut tree = DimensionsTree::new(dimensions.iter().map(|d| d.to_string()).collect());
        let Some(target) = state.table(&database, table) else {
            return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
        };
        for (record_key, record) in target.partitions().iter().flat_map(|p| p.iter()) {
            if let Err(err) = tree.insert(record_key, record) {
                warn!(table, key = %record_key, error = %err, "record left out of composite index");
            }
        }
        let entries = tree.len();
        state.table_indexes_mut(&database, table).composites.insert(key.clone(), tree);
        info!(database = %database, table, index = %key, entries, "composite index created");
        Outcome::Applied(key)
    }

    /// Records whose values fall inside every bound of `ranges`
    /// (`{dim: value | [min, max]}`). The dimension set must equal an existing
    /// composite index, in any order.
    pub fn query_composite_index_range(&self, table: &str, ranges: &Value) -> Result<Outcome<Vec<Record>>> {
        let Value::Object(map) = ranges else {
            return Err(Error::parse("composite range query must be an object"));
        };
        let database = match self.table_context(table) {
            Ok(database) => database,
            Err(rejection) => return Ok(Outcome::Skipped(rejection)),
        };
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let dims: Vec<&str> = map.keys().map(String::as_str).collect();
        let state = self.state.read();
        let Some(tree) = state.table_indexes(&database, table).and_then(|ix| ix.composite_for(&dims)) else {
            return Ok(Outcome::Skipped(Rejection::IndexMissing(dims.join("|"))));
        };
        let bounds: Option<Vec<(String, String)>> = tree
            .dimensions()
            .iter()
            .map(|d| map.get(d.as_str()).map(|v| DimRange::from_json(v).bounds()))
            .collect();
        let Some(bounds) = bounds else {
            return Ok(Outcome::Skipped(Rejection::IndexMissing(dims.join("|"))));
        };
        let keys = tree.query(&bounds);
        debug!(table, index = %tree.key(), hits = keys.len(), "composite range query");
        Ok(Outcome::Applied(state.resolve_keys(&database, table, &keys)))
    }

    /// Give every record a `dimension` field (null where absent) and index it.
    /// Returns how many records gained the field.
    pub fn add_dimension(&self, table: &str, dimension: &str) -> Outcome<usize> {
        if dimension.trim().is_empty() {
            return Outcome::Skipped(Rejection::InvalidArgument("dimension name is empty".to_string()));
        }
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };

        let filled = {
            let mut state = self.state.write();
            let Some(target) = state.table(&database, table) else {
                return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
            };
            let missing: Vec<String> = target
                .partitions()
                .iter()
                .flat_map(|p| p.iter())
                .filter(|(_, record)| !record.contains(dimension))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &missing {
                state.edit_record(&database, table, key, |record| {
                    record.insert(dimension, FieldValue::Null);
                });
            }

            let indexed = state
                .table_indexes(&database, table)
                .is_some_and(|ix| ix.dimensions.contains_key(dimension));
            if !indexed {
                if let Some(target) = state.table(&database, table) {
                    let index = DimensionIndex::build(dimension, target.partitions().iter().flat_map(|p| p.iter()));
                    state
                        .table_indexes_mut(&database, table)
                        .dimensions
                        .insert(dimension.to_string(), index);
                }
            }
            missing.len()
        };

        info!(database = %database, table, dimension, filled, "dimension added");
        self.after_mutation(&database, table);
        Outcome::Applied(filled)
    }

    /// Drop the inverted index of `dimension` and the field from every record.
    /// Returns how many records lost the field.
    pub fn remove_dimension(&self, table: &str, dimension: &str) -> Outcome<usize> {
        let (database, _guard) = match self.acquire(table) {
            Ok(held) => held,
            Err(rejection) => return Outcome::Skipped(rejection),
        };

        let removed = {
            let mut state = self.state.write();
            let keys: Vec<String> = match state.table(&database, table) {
                Some(target) if target.primary_key == dimension => {
                    return Outcome::Skipped(Rejection::InvalidArgument(format!("{} is the primary key", dimension)));
                }
                Some(target) => target
                    .partitions()
                    .iter()
                    .flat_map(|p| p.iter())
                    .filter(|(_, record)| record.contains(dimension))
                    .map(|(key, _)| key.clone())
                    .collect(),
                None => return Outcome::Skipped(Rejection::TableNotFound(table.to_string())),
            };
            state.drop_dimension(&database, table, dimension);
            keys.iter()
                .filter(|key| {
                    state.edit_record(&database, table, key, |record| {
                        record.remove(dimension);
                    })
                })
                .count()
        };

        info!(database = %database, table, dimension, removed, "dimension removed");
        self.after_mutation(&database, table);
        Outcome::Applied(removed)
    }

    /// Records the inverted index of `dimension` lists under `value`.
    pub fn query_dimension(&self, table: &str, dimension: &str, value: impl Into<FieldValue>) -> Outcome<Vec<Record>> {
        let database = match self.table_context(table) {
            Ok(database) => database,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let value = value.into();
        let state = self.state.read();
        let Some(index) = state
            .table_indexes(&database, table)
            .and_then(|ix| ix.dimensions.get(dimension))
        else {
            return Outcome::Skipped(Rejection::IndexMissing(dimension.to_string()));
        };
        // postings can be stale after updates
        let wanted = ValueKey::from(&value);
        let records = state
            .resolve_keys(&database, table, index.lookup(&value))
            .into_iter()
            .filter(|record| record.get(dimension).map(ValueKey::from) == Some(wanted.clone()))
            .collect();
        Outcome::Applied(records)
    }

    /// Drop every composite index of `table`; returns how many there were.
    pub fn drop_composite_indexes(&self, table: &str) -> Outcome<usize> {
        let database = match self.table_context(table) {
            Ok(database) => database,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        let dropped = {
            let mut state = self.state.write();
            let ix = state.table_indexes_mut(&database, table);
            let dropped = ix.composites.len();
            ix.composites.clear();
            dropped
        };
        info!(database = %database, table, dropped, "composite indexes destroyed");
        Outcome::Applied(dropped)
    }

    /// Build the pyramid index over `table`, replacing any previous one.
    /// Returns the number of indexed points.
    pub fn create_pyramid_index(&self, table: &str, max_capacity: usize, k: usize) -> Outcome<usize> {
        if max_capacity == 0 || k == 0 {
            return Outcome::Skipped(Rejection::InvalidArgument("capacity and k must be positive".to_string()));
        }
        let database = match self.table_context(table) {
            Ok(database) => database,
            Err(rejection) => return Outcome::Skipped(rejection),
        };

        let mut state = self.state.write();
        let Some(target) = state.table(&database, table) else {
            return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
        };
        let points: Vec<(String, Vec<f64>)> = target
            .partitions()
            .iter()
            .flat_map(|p| p.iter())
            .map(|(key, record)| (key.clone(), PyramidIndex::point_of(record)))
            .collect();
        let index = PyramidIndex::build(points, max_capacity, k);
        let size = index.len();
        if let Some(previous) = &state.pyramid {
            debug!(database = %previous.database, table = %previous.table, "replacing pyramid index");
        }
        info!(database = %database, table, points = size, leaves = index.leaf_count(), "pyramid index created");
        state.pyramid = Some(IndexSlot::new(&database, table, index));
        Outcome::Applied(size)
    }

    /// The k nearest records of the table the pyramid index was built over.
    pub fn query_pyramid_index(&self, point: &[f64]) -> Outcome<Vec<Record>> {
        if self.is_closed() {
            return Outcome::Skipped(Rejection::Closed);
        }
        self.query_count.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        let Some(slot) = &state.pyramid else {
            return Outcome::Skipped(Rejection::IndexMissing("pyramid".to_string()));
        };
        let keys = slot.index.query(point);
        Outcome::Applied(state.resolve_keys(&slot.database, &slot.table, &keys))
    }

    pub fn drop_pyramid_index(&self) -> bool {
        let dropped = self.state.write().pyramid.take().is_some();
        if dropped {
            info!("pyramid index destroyed");
        }
        dropped
    }

    /// Build the sphere weaving index over `table`, replacing any previous one.
    /// Without dimensions, the first record's fields are used. Returns the
    /// dimensions in use.
    pub fn create_recursive_sphere_weaving(&self, table: &str, dimensions: Option<&[&str]>) -> Outcome<Vec<String>> {
        let database = match self.table_context(table) {
            Ok(database) => database,
            Err(rejection) => return Outcome::Skipped(rejection),
        };

        let mut state = self.state.write();
        let Some(target) = state.table(&database, table) else {
            return Outcome::Skipped(Rejection::TableNotFound(table.to_string()));
        };
        let index = RecursiveSphereWeaving::build(
            dimensions.map(|dims| dims.iter().map(|d| d.to_string()).collect()),
            target.partitions().iter().flat_map(|p| p.iter()),
        );
        let used = index.dimensions().to_vec();
        info!(database = %database, table, points = index.len(), dimensions = ?used, "sphere weaving created");
        state.sphere = Some(IndexSlot::new(&database, table, index));
        Outcome::Applied(used)
    }

    /// The `k` records of `table` nearest to `point` in sphere space.
    pub fn query_recursive_sphere_weaving(&self, table: &str, point: &[f64], k: usize) -> Outcome<Vec<Record>> {
        let database = match self.table_context(table) {
            Ok(database) => database,
            Err(rejection) => return Outcome::Skipped(rejection),
        };
        self.query_count.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        let Some(slot) = state.sphere.as_ref().filter(|s| s.belongs_to(&database, table)) else {
            return Outcome::Skipped(Rejection::IndexMissing(format!("sphere weaving on {}", table)));
        };
        let keys = slot.index.query(point, k);
        Outcome::Applied(state.resolve_keys(&database, table, &keys))
    }

    pub fn drop_sphere_index(&self) -> bool {
        let dropped = self.state.write().sphere.take().is_some();
        if dropped {
            info!("sphere weaving destroyed");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairs_are_ranges_and_everything_else_is_exact() {
        assert_eq!(DimRange::from_json(&json!([1, 5])).bounds(), ("1".to_string(), "5".to_string()));
        assert_eq!(DimRange::from_json(&json!("x")).bounds(), ("x".to_string(), "x".to_string()));
        assert_eq!(
            DimRange::from_json(&json!([1, 2, 3])),
            DimRange::Exact(FieldValue::Text("[1,2,3]".to_string()))
        );
    }
}
