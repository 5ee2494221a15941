use std::collections::BTreeMap;
use crate::core::error::Result;
use crate::core::types::Record;
use crate::index::SecondaryIndex;

#[derive(Debug, Clone, Default)]
struct TreeNode {
    children: BTreeMap<String, TreeNode>,
    bucket: Vec<String>,
}

/// Composite index: one trie level per dimension, keyed by the value's text form.
/// Range queries compare those keys as strings, so "10" sorts before "9".
#[derive(Debug, Clone)]
pub struct DimensionsTree {
    dimensions: Vec<String>,
    root: TreeNode,
    entries: usize,
}

impl DimensionsTree {
    pub fn new(dimensions: Vec<String>) -> Self {
        DimensionsTree {
            dimensions,
            root: TreeNode::default(),
            entries: 0,
        }
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    /// Registry key: dimensions joined by `|`.
    pub fn key(&self) -> String {
        self.dimensions.join("|")
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn path_of(&self, record: &Record) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|d| record.get(d).map(|v| v.to_text()).unwrap_or_else(|| "undefined".to_string()))
            .collect()
    }

    fn insert_path(&mut self, path: &[String], key: &str) {
        let mut node = &mut self.root;
        for part in path {
            node = node.children.entry(part.clone()).or_default();
        }
        node.bucket.push(key.to_string());
        self.entries += 1;
    }

    fn remove_path(&mut self, path: &[String], key: &str) {
        let mut node = &mut self.root;
        for part in path {
            node = match node.children.get_mut(part) {
                Some(child) => child,
                None => return,
            };
        }
        let before = node.bucket.len();
        node.bucket.retain(|k| k != key);
        self.entries -= before - node.bucket.len();
    }

    /// Keys whose every dimension text lies within the inclusive `(min, max)` bound
    /// for that level. Bounds are given in dimension order.
    pub fn query(&self, ranges: &[(String, String)]) -> Vec<String> {
        let mut results = Vec::new();
        if ranges.len() == self.dimensions.len() {
            Self::collect(&self.root, ranges, &mut results);
        }
        results
    }

    fn collect(node: &TreeNode, ranges: &[(String, String)], results: &mut Vec<String>) {
        let Some(((min, max), rest)) = ranges.split_first() else {
            results.extend(node.bucket.iter().cloned());
            return;
        };
        if min > max {
            return;
        }
        for (_, child) in node.children.range(min.clone()..=max.clone()) {
            Self::collect(child, rest, results);
        }
    }
}

impl SecondaryIndex for DimensionsTree {
    fn label(&self) -> String {
        format!("composite:{}", self.key())
    }

    fn insert(&mut self, key: &str, record: &Record) -> Result<()> {
        let path = self.path_of(record);
        self.insert_path(&path, key);
        Ok(())
    }

    fn delete(&mut self, key: &str, record: &Record) -> Result<()> {
        let path = self.path_of(record);
        self.remove_path(&path, key);
        Ok(())
    }

    fn update(&mut self, old_key: &str, old: &Record, new_key: &str, new: &Record) -> Result<()> {
        let old_path = self.path_of(old);
        self.remove_path(&old_path, old_key);
        let new_path = self.path_of(new);
        self.insert_path(&new_path, new_key);
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

    fn range(min: &str, max: &str) -> (String, String) {
        (min.to_string(), max.to_string())
    }

    #[test]
    fn range_query_is_lexicographic() {
        let mut tree = DimensionsTree::new(vec!["x".into(), "y".into()]);
        tree.insert("a", &rec(json!({"x": 1, "y": 2}))).unwrap();
        tree.insert("b", &rec(json!({"x": 10, "y": 2}))).unwrap();
        tree.insert("c", &rec(json!({"x": 9, "y": 3}))).unwrap();

        let mut hits = tree.query(&[range("1", "9"), range("2", "2")]);
        hits.sort();
        // "10" falls between "1" and "9" as text
        assert_eq!(hits, vec!["a", "b"]);
        assert!(tree.query(&[range("9", "1"), range("0", "9")]).is_empty());
    }

    #[test]
    fn update_moves_entry_to_new_path() {
        let mut tree = DimensionsTree::new(vec!["x".into()]);
        let old = rec(json!({"x": 1}));
        let new = rec(json!({"x": 2}));
        tree.insert("k", &old).unwrap();
        tree.update("k", &old, "k", &new).unwrap();
        assert!(tree.query(&[range("1", "1")]).is_empty());
        assert_eq!(tree.query(&[range("2", "2")]), vec!["k"]);
        assert_eq!(tree.len(), 1);
    }
}
