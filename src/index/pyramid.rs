use rayon::prelude::*;
use crate::core::error::Result;
use crate::core::types::Record;
use crate::index::{euclidean_distance, SecondaryIndex};

#[derive(Debug, Clone)]
enum Node {
    Leaf(usize),
    Split { dim: usize, median: f64, left: Box<Node>, right: Box<Node> },
}

/// Pyramid-technique k-NN index: points are split on the median of one
/// dimension per level (round robin) until a leaf holds at most `max_capacity`.
#[derive(Debug, Clone)]
pub struct PyramidIndex {
    max_capacity: usize,
    k: usize,
    dimensions: usize,
    points: Vec<(String, Vec<f64>)>,
    leaves: Vec<Vec<usize>>,        // In-order: neighbouring leaves are siblings
    root: Node,
}

impl PyramidIndex {
    pub fn new(max_capacity: usize, k: usize) -> Self {
        PyramidIndex {
            max_capacity: max_capacity.max(1),
            k: k.max(1),
            dimensions: 0,
            points: Vec::new(),
            leaves: vec![Vec::new()],
            root: Node::Leaf(0),
        }
    }

    /// Build over `(key, point)` pairs. Dimensionality comes from the first point.
    pub fn build(points: impl IntoIterator<Item = (String, Vec<f64>)>, max_capacity: usize, k: usize) -> Self {
        let mut index = PyramidIndex::new(max_capacity, k);
        index.points = points.into_iter().collect();
        index.rebuild();
        index
    }

    /// Coordinates a record contributes: its numeric field values in field order.
    pub fn point_of(record: &Record) -> Vec<f64> {
        record.numeric_values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    fn rebuild(&mut self) {
        if self.dimensions == 0 {
            self.dimensions = self.points.first().map(|(_, p)| p.len()).unwrap_or(0);
        }
        self.leaves.clear();
        let all: Vec<usize> = (0..self.points.len()).collect();
        self.root = self.partition(all, 0, 0);
    }

    fn leaf(&mut self, members: Vec<usize>) -> Node {
        self.leaves.push(members);
        Node::Leaf(self.leaves.len() - 1)
    }

    fn partition(&mut self, members: Vec<usize>, depth: usize, stalled: usize) -> Node {
        if members.len() <= self.max_capacity || self.dimensions == 0 || stalled >= self.dimensions {
            return self.leaf(members);
        }
        let dim = depth % self.dimensions;
        let mut values: Vec<f64> = members
            .iter()
            .filter_map(|&i| self.points[i].1.get(dim).copied())
            .collect();
        if values.is_empty() {
            return self.partition(members, depth + 1, stalled + 1);
        }
        values.sort_by(f64::total_cmp);
        let median = values[values.len() / 2];

        // Points without this coordinate count as the median
        let (left, right): (Vec<usize>, Vec<usize>) = members
            .iter()
            .partition(|&&i| self.points[i].1.get(dim).copied().unwrap_or(median) < median);
        if left.is_empty() || right.is_empty() {
            return self.partition(members, depth + 1, stalled + 1);
        }

        let left = self.partition(left, depth + 1, 0);
        let right = self.partition(right, depth + 1, 0);
        Node::Split { dim, median, left: Box::new(left), right: Box::new(right) }
    }

    fn descend(&self, point: &[f64]) -> usize {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf(id) => return *id,
                Node::Split { dim, median, left, right } => {
                    let v = point.get(*dim).copied().unwrap_or(*median);
                    node = if v < *median { &**left } else { &**right };
                }
            }
        }
    }

    /// Keys of the k nearest points: the target leaf plus its neighbours,
    /// or every point when those hold fewer than k.
    pub fn query(&self, point: &[f64]) -> Vec<String> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let target = self.descend(point);
        let from = target.saturating_sub(1);
        let to = (target + 1).min(self.leaves.len() - 1);
        let mut candidates: Vec<usize> = self.leaves[from..=to].iter().flatten().copied().collect();
        if candidates.len() < self.k {
            candidates = (0..self.points.len()).collect();
        }

        let mut ranked: Vec<(f64, usize)> = candidates
            .par_iter()
            .map(|&i| (euclidean_distance(&self.points[i].1, point), i))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(self.k)
            .map(|(_, i)| self.points[i].0.clone())
            .collect()
    }
}

impl SecondaryIndex for PyramidIndex {
    fn label(&self) -> String {
        "pyramid".to_string()
    }

    fn insert(&mut self, key: &str, record: &Record) -> Result<()> {
        self.points.push((key.to_string(), Self::point_of(record)));
        self.rebuild();
        Ok(())
    }

    fn delete(&mut self, key: &str, _record: &Record) -> Result<()> {
        self.points.retain(|(k, _)| k != key);
        self.rebuild();
        Ok(())
    }

    fn update(&mut self, old_key: &str, _old: &Record, new_key: &str, new: &Record) -> Result<()> {
        self.points.retain(|(k, _)| k != old_key);
        self.points.push((new_key.to_string(), Self::point_of(new)));
        self.rebuild();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<(String, Vec<f64>)> {
        (0..n)
            .map(|i| (format!("p{}", i), vec![(i % 10) as f64, (i / 10) as f64]))
            .collect()
    }

    #[test]
    fn splits_into_bounded_leaves() {
        let index = PyramidIndex::build(grid(100), 8, 3);
        assert!(index.leaf_count() > 1);
        assert!(index.leaves.iter().all(|l| l.len() <= 8));
        assert_eq!(index.leaves.iter().map(Vec::len).sum::<usize>(), 100);
    }

    #[test]
    fn nearest_point_comes_first() {
        let index = PyramidIndex::build(grid(100), 8, 3);
        let hits = index.query(&[4.0, 7.0]);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0], "p74");
    }

    #[test]
    fn identical_points_do_not_recurse_forever() {
        let same: Vec<_> = (0..20).map(|i| (i.to_string(), vec![1.0, 1.0])).collect();
        let index = PyramidIndex::build(same, 2, 5);
        assert_eq!(index.leaf_count(), 1);
        assert_eq!(index.query(&[1.0, 1.0]).len(), 5);
    }

    #[test]
    fn small_candidate_sets_fall_back_to_full_scan() {
        let index = PyramidIndex::build(grid(30), 2, 10);
        assert_eq!(index.query(&[0.0, 0.0]).len(), 10);
    }
}
