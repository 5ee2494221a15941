use rayon::prelude::*;
use crate::compression::riemann::map_to_riemann_sphere;
use crate::core::error::Result;
use crate::core::types::Record;
use crate::index::{euclidean_distance, SecondaryIndex};

/// k-NN over records projected onto the Riemann sphere
#[derive(Debug, Clone)]
pub struct RecursiveSphereWeaving {
    dimensions: Vec<String>,
    points: Vec<(String, [f64; 3])>,
}

impl RecursiveSphereWeaving {
    pub fn new(dimensions: Vec<String>) -> Self {
        RecursiveSphereWeaving { dimensions, points: Vec::new() }
    }

    /// Project every `(key, record)`. Without explicit dimensions the first
    /// record's field names are used.
    pub fn build<'r>(dimensions: Option<Vec<String>>, records: impl IntoIterator<Item = (&'r String, &'r Record)>) -> Self {
        let mut records = records.into_iter().peekable();
        let dimensions = dimensions.unwrap_or_else(|| {
            records
                .peek()
                .map(|(_, r)| r.keys().cloned().collect())
                .unwrap_or_default()
        });
        let mut index = RecursiveSphereWeaving::new(dimensions);
        for (key, record) in records {
            index.add(key, record);
        }
        index
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Coordinates along the index dimensions. Numeric text counts as its
    /// number, since reloaded values are text; anything else reads as 0.
    pub fn vector_of(&self, record: &Record) -> Vec<f64> {
        self.dimensions
            .iter()
            .map(|d| record.get(d).and_then(|v| v.as_coordinate()).unwrap_or(0.0))
            .collect()
    }

    fn add(&mut self, key: &str, record: &Record) {
        let sphere = map_to_riemann_sphere(&self.vector_of(record));
        self.points.push((key.to_string(), sphere));
    }

    /// Keys of the `k` records nearest to `point` in sphere space.
    pub fn query(&self, point: &[f64], k: usize) -> Vec<String> {
        let target = map_to_riemann_sphere(point);
        let mut ranked: Vec<(f64, usize)> = self
            .points
            .par_iter()
            .enumerate()
            .map(|(i, (_, sphere))| (euclidean_distance(sphere, &target), i))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(k)
            .map(|(_, i)| self.points[i].0.clone())
            .collect()
    }

    pub fn query_record(&self, point: &Record, k: usize) -> Vec<String> {
        self.query(&self.vector_of(point), k)
    }
}

impl SecondaryIndex for RecursiveSphereWeaving {
    fn label(&self) -> String {
        "sphere-weaving".to_string()
    }

    fn insert(&mut self, key: &str, record: &Record) -> Result<()> {
        self.add(key, record);
        Ok(())
    }

    fn delete(&mut self, key: &str, _record: &Record) -> Result<()> {
        self.points.retain(|(k, _)| k != key);
        Ok(())
    }

    fn update(&mut self, old_key: &str, old: &Record, new_key: &str, new: &Record) -> Result<()> {
        self.delete(old_key, old)?;
        self.add(new_key, new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dimensions_default_to_first_record_fields() {
        let keys = ["1".to_string(), "2".to_string()];
        let recs = [
            Record::from_json(&json!({"x": 0.0, "y": 0.0})).unwrap(),
            Record::from_json(&json!({"x": 5.0, "y": 5.0})).unwrap(),
        ];
        let index = RecursiveSphereWeaving::build(None, keys.iter().zip(recs.iter()));
        assert_eq!(index.dimensions(), ["x".to_string(), "y".to_string()]);
        assert_eq!(index.query(&[4.0, 6.0], 1), vec!["2"]);
        assert_eq!(index.query(&[0.1, 0.0], 5).len(), 2);
    }

    #[test]
    fn numeric_text_is_a_coordinate_and_other_text_is_zero() {
        let index = RecursiveSphereWeaving::new(vec!["x".into(), "y".into()]);
        let reloaded = Record::from_json(&json!({"x": "3", "y": " 4.5 "})).unwrap();
        assert_eq!(index.vector_of(&reloaded), vec![3.0, 4.5]);

        let words = Record::from_json(&json!({"x": "north", "y": null})).unwrap();
        assert_eq!(index.vector_of(&words), vec![0.0, 0.0]);
        assert_eq!(index.vector_of(&Record::new()), vec![0.0, 0.0]);
    }
}
