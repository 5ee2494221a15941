use indexmap::IndexMap;
use crate::core::types::Record;
use crate::index::dimensions_tree::DimensionsTree;
use crate::index::inverted::DimensionIndex;
use crate::index::pyramid::PyramidIndex;
use crate::index::sphere_weaving::RecursiveSphereWeaving;
use crate::index::SecondaryIndex;

/// Indexes owned by one table
#[derive(Debug, Clone, Default)]
pub struct TableIndexes {
    pub dimensions: IndexMap<String, DimensionIndex>,   // dimension -> inverted index
    pub composites: IndexMap<String, DimensionsTree>,   // "a|b|c" -> tree
}

impl TableIndexes {
    pub fn new() -> Self {
        TableIndexes::default()
    }

    /// Create inverted indexes for fields of `record` that have none yet,
    /// seeded from the table's current records.
    pub fn ensure_dimensions<'r, I>(&mut self, record: &Record, existing: impl Fn() -> I)
    where
        I: IntoIterator<Item = (&'r String, &'r Record)>,
    {
        for field in record.keys() {
            if !self.dimensions.contains_key(field) {
                let index = DimensionIndex::build(field.clone(), existing());
                self.dimensions.insert(field.clone(), index);
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.dimensions
            .keys()
            .chain(self.composites.keys())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty() && self.composites.is_empty()
    }

    /// Composite whose dimension set equals `dims`, in any order.
    pub fn composite_for(&self, dims: &[&str]) -> Option<&DimensionsTree> {
        self.composites.values().find(|tree| {
            tree.dimensions().len() == dims.len()
                && dims.iter().all(|d| tree.dimensions().iter().any(|t| t == d))
        })
    }
}

/// Facade-wide single slot for an index built over one table
#[derive(Debug, Clone)]
pub struct IndexSlot<T> {
    pub database: String,
    pub table: String,
    pub index: T,
}

impl<T> IndexSlot<T> {
    pub fn new(database: &str, table: &str, index: T) -> Self {
        IndexSlot {
            database: database.to_string(),
            table: table.to_string(),
            index,
        }
    }

    pub fn belongs_to(&self, database: &str, table: &str) -> bool {
        self.database == database && self.table == table
    }
}

/// Every live index of one table in maintenance order:
/// inverted, composite, pyramid, sphere weaving.
pub fn maintenance_targets<'a>(
    indexes: Option<&'a mut TableIndexes>,
    pyramid: Option<&'a mut IndexSlot<PyramidIndex>>,
    sphere: Option<&'a mut IndexSlot<RecursiveSphereWeaving>>,
    database: &str,
    table: &str,
) -> Vec<&'a mut dyn SecondaryIndex> {
    let mut targets: Vec<&'a mut dyn SecondaryIndex> = Vec::new();
    if let Some(indexes) = indexes {
        let TableIndexes { dimensions, composites } = indexes;
        targets.extend(dimensions.values_mut().map(|i| i as &mut dyn SecondaryIndex));
        targets.extend(composites.values_mut().map(|i| i as &mut dyn SecondaryIndex));
    }
    if let Some(slot) = pyramid.filter(|s| s.belongs_to(database, table)) {
        targets.push(&mut slot.index);
    }
    if let Some(slot) = sphere.filter(|s| s.belongs_to(database, table)) {
        targets.push(&mut slot.index);
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{propagate, IndexChange};
    use serde_json::json;

    #[test]
    fn slots_of_other_tables_are_skipped() {
        let mut indexes = TableIndexes::new();
        indexes.composites.insert("a".into(), DimensionsTree::new(vec!["a".into()]));
        let mut pyramid = IndexSlot::new("d", "other", PyramidIndex::new(4, 2));
        let targets = maintenance_targets(Some(&mut indexes), Some(&mut pyramid), None, "d", "t");
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn propagation_reaches_every_target() {
        let record = Record::from_json(&json!({"id": 1, "a": 3})).unwrap();
        let mut indexes = TableIndexes::new();
        indexes.ensure_dimensions(&record, || std::iter::empty());
        indexes.composites.insert("a".into(), DimensionsTree::new(vec!["a".into()]));
        let mut sphere = IndexSlot::new("d", "t", RecursiveSphereWeaving::new(vec!["a".into()]));
        let mut targets = maintenance_targets(Some(&mut indexes), None, Some(&mut sphere), "d", "t");
        let failures = propagate(&mut targets, IndexChange::Insert { key: "1", record: &record });
        assert!(failures.is_empty());
        drop(targets);
        assert_eq!(indexes.dimensions["a"].lookup(&3.into()), ["1".to_string()]);
        assert_eq!(indexes.composite_for(&["a"]).map(|t| t.len()), Some(1));
        assert_eq!(sphere.index.len(), 1);
    }
}
