use indexmap::IndexMap;
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};
use crate::core::types::{FieldValue, Record};
use crate::query::ast::Predicate;
use crate::query::matcher::{PredicateMatcher, SubqueryResolver};

/// Stringified primary key -> record, in insertion order.
pub type Partition = IndexMap<String, Record>;

/// Rolling 32-bit hash over UTF-16 code units, folded to a non-negative value.
pub fn partition_hash(key: &str) -> u64 {
    let mut hash: i32 = 0;
    for unit in key.encode_utf16() {
        hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(unit as i32);
    }
    (hash as i64).unsigned_abs()
}

/// A record can be stored only under a non-null, non-empty key. 0 is a valid key.
pub fn has_usable_key(record: &Record, primary_key: &str) -> bool {
    match record.get(primary_key) {
        None | Some(FieldValue::Null) => false,
        Some(FieldValue::Text(text)) => !text.is_empty(),
        Some(FieldValue::Number(_)) => true,
    }
}

/// Hash-partitioned table keyed by one primary-key field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionedTable {
    pub name: String,
    pub primary_key: String,
    pub num_partitions: usize,
    pub compressed: bool,
    pub columns: Vec<String>,       // Declared columns, advisory only
    partitions: Vec<Partition>,
}

impl PartitionedTable {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>, num_partitions: usize) -> Self {
        let num_partitions = num_partitions.max(1);
        PartitionedTable {
            name: name.into(),
            primary_key: primary_key.into(),
            num_partitions,
            compressed: false,
            columns: Vec::new(),
            partitions: (0..num_partitions).map(|_| Partition::new()).collect(),
        }
    }

    /// Stringified key of a record; a missing key reads as "undefined".
    pub fn key_of(&self, record: &Record) -> String {
        record
            .get(&self.primary_key)
            .map(|v| v.to_text())
            .unwrap_or_else(|| "undefined".to_string())
    }

    pub fn partition_of_key(&self, key: &str) -> usize {
        (partition_hash(key) % self.num_partitions as u64) as usize
    }

    pub fn get_partition_index(&self, record: &Record) -> usize {
        self.partition_of_key(&self.key_of(record))
    }

    /// Insert or overwrite; returns the previous record under the same key.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        let key = self.key_of(&record);
        let idx = self.partition_of_key(&key);
        self.partitions[idx].insert(key, record)
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.partitions[self.partition_of_key(key)].get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Record> {
        let idx = self.partition_of_key(key);
        self.partitions[idx].get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        let idx = self.partition_of_key(key);
        self.partitions[idx].shift_remove(key)
    }

    /// Matching records projected to `fields` (`*` or empty for whole records).
    pub fn query(&self, predicate: &Predicate, fields: &[String], resolver: &dyn SubqueryResolver) -> Vec<Record> {
        let matcher = PredicateMatcher::new(resolver);
        self.matching(predicate, &matcher)
            .into_iter()
            .map(|(_, record)| record.project(fields))
            .collect()
    }

    /// Keys of matching records, in scan order.
    pub fn matching_keys(&self, predicate: &Predicate, resolver: &dyn SubqueryResolver) -> Vec<String> {
        let matcher = PredicateMatcher::new(resolver);
        self.matching(predicate, &matcher)
            .into_iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn matching<'t>(&'t self, predicate: &Predicate, matcher: &PredicateMatcher<'_>) -> Vec<(&'t String, &'t Record)> {
        // Primary-key equality: look in one partition, then check the rest of the predicate there
        if let Some(value) = predicate.key_equality(&self.primary_key) {
            let key = value.to_text();
            return self.partitions[self.partition_of_key(&key)]
                .get_key_value(&key)
                .filter(|(_, record)| matcher.is_match(record, predicate))
                .into_iter()
                .collect();
        }

        self.partitions
            .iter()
            .flat_map(|p| p.iter())
            .filter(|(_, record)| matcher.is_match(record, predicate))
            .collect()
    }

    /// Hex digest a key is published under when the table is compressed.
    pub fn hashed_key(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    /// Map a published key back to the stored key. Identity when uncompressed or unknown.
    pub fn get_raw_key(&self, processed: &str) -> String {
        if !self.compressed {
            return processed.to_string();
        }
        self.keys()
            .find(|key| Self::hashed_key(key) == processed)
            .cloned()
            .unwrap_or_else(|| processed.to_string())
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.partitions.iter().flat_map(|p| p.values())
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.partitions.iter_mut().flat_map(|p| p.values_mut())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.partitions.iter().flat_map(|p| p.keys())
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same records under a new name.
    pub fn clone_as(&self, name: impl Into<String>) -> Self {
        PartitionedTable {
            name: name.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(partition_hash(""), 0);
        assert_eq!(partition_hash("1"), 49);
        // "ab" = 97 * 31 + 98
        assert_eq!(partition_hash("ab"), 3105);
    }

    #[test]
    fn hash_folds_negative_values() {
        // long keys overflow 32 bits; the result stays non-negative and in range
        let h = partition_hash("a fairly long primary key that overflows");
        assert!(h <= 2_147_483_648);
    }

    #[test]
    fn raw_key_reverses_digest_only_when_compressed() {
        let mut t = PartitionedTable::new("t", "id", 3);
        t.insert([("id", "k1")].into_iter().collect());
        let digest = PartitionedTable::hashed_key("k1");
        assert_eq!(t.get_raw_key(&digest), digest);
        t.compressed = true;
        assert_eq!(t.get_raw_key(&digest), "k1");
        assert_eq!(t.get_raw_key("unknown"), "unknown");
    }
}
