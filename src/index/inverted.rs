use std::collections::HashMap;
use crate::core::error::Result;
use crate::core::types::{FieldValue, Record, ValueKey};
use crate::index::SecondaryIndex;

/// Inverted index over one dimension: value -> primary keys
#[derive(Debug, Clone, Default)]
pub struct DimensionIndex {
    pub dimension: String,
    postings: HashMap<ValueKey, Vec<String>>,
}

impl DimensionIndex {
    pub fn new(dimension: impl Into<String>) -> Self {
        DimensionIndex {
            dimension: dimension.into(),
            postings: HashMap::new(),
        }
    }

    /// Index every record that carries the dimension.
    pub fn build<'r>(dimension: impl Into<String>, records: impl IntoIterator<Item = (&'r String, &'r Record)>) -> Self {
        let mut index = DimensionIndex::new(dimension);
        for (key, record) in records {
            index.add(key, record);
        }
        index
    }

    fn add(&mut self, key: &str, record: &Record) {
        if let Some(value) = record.get(&self.dimension) {
            self.postings
                .entry(ValueKey::from(value))
                .or_default()
                .push(key.to_string());
        }
    }

    /// Keys posted under `value`. May contain repeats after updates.
    pub fn lookup(&self, value: &FieldValue) -> &[String] {
        self.postings
            .get(&ValueKey::from(value))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn distinct_values(&self) -> usize {
        self.postings.len()
    }

    pub fn posting_count(&self) -> usize {
        self.postings.values().map(Vec::len).sum()
    }
}

impl SecondaryIndex for DimensionIndex {
    fn label(&self) -> String {
        format!("dimension:{}", self.dimension)
    }

    fn insert(&mut self, key: &str, record: &Record) -> Result<()> {
        self.add(key, record);
        Ok(())
    }

    fn delete(&mut self, key: &str, _record: &Record) -> Result<()> {
        for keys in self.postings.values_mut() {
            keys.retain(|k| k != key);
        }
        self.postings.retain(|_, keys| !keys.is_empty());
        Ok(())
    }

    /// Appends under the new value; the old posting is left in place.
    fn update(&mut self, old_key: &str, old: &Record, new_key: &str, new: &Record) -> Result<()> {
        if old_key != new_key {
            self.delete(old_key, old)?;
            self.add(new_key, new);
            return Ok(());
        }
        match (old.get(&self.dimension), new.get(&self.dimension)) {
            (_, None) => {}
            (Some(before), Some(after)) if before == after => {}
            _ => self.add(new_key, new),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        Record::from_json(&v).unwrap()
    }

    #[test]
    fn numbers_and_text_post_separately() {
        let mut idx = DimensionIndex::new("a");
        idx.insert("1", &rec(json!({"id": 1, "a": 5}))).unwrap();
        idx.insert("2", &rec(json!({"id": 2, "a": "5"}))).unwrap();
        assert_eq!(idx.lookup(&FieldValue::Number(5.0)), ["1".to_string()]);
        assert_eq!(idx.lookup(&"5".into()), ["2".to_string()]);
    }

    #[test]
    fn updates_append_and_deletes_filter() {
        let mut idx = DimensionIndex::new("a");
        let v1 = rec(json!({"id": 1, "a": 5}));
        let v2 = rec(json!({"id": 1, "a": 6}));
        idx.insert("1", &v1).unwrap();
        idx.update("1", &v1, "1", &v2).unwrap();
        idx.update("1", &v2, "1", &v1).unwrap();
        assert_eq!(idx.lookup(&FieldValue::Number(5.0)).len(), 2);
        idx.delete("1", &v1).unwrap();
        assert_eq!(idx.posting_count(), 0);
    }
}
