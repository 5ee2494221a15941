pub mod inverted;
pub mod dimensions_tree;
pub mod pyramid;
pub mod sphere_weaving;
pub mod registry;

use tracing::warn;
use crate::core::error::{Error, Result};
use crate::core::types::Record;

/// Index maintained by explicit calls from the table mutation path.
/// Entries are primary keys; readers resolve them against the live table.
pub trait SecondaryIndex {
    fn label(&self) -> String;

    fn insert(&mut self, key: &str, record: &Record) -> Result<()>;

    fn delete(&mut self, key: &str, record: &Record) -> Result<()>;

    /// `old_key` differs from `new_key` only when the primary key itself changed.
    fn update(&mut self, old_key: &str, old: &Record, new_key: &str, new: &Record) -> Result<()>;
}

/// One table mutation as seen by the indexes
#[derive(Debug, Clone, Copy)]
pub enum IndexChange<'r> {
    Insert { key: &'r str, record: &'r Record },
    Delete { key: &'r str, record: &'r Record },
    Update { old_key: &'r str, old: &'r Record, new_key: &'r str, new: &'r Record },
}

/// Apply `change` to every index in order. A failing index is logged and skipped;
/// the remaining indexes still run. Returns the collected failures.
pub fn propagate(indexes: &mut [&mut dyn SecondaryIndex], change: IndexChange<'_>) -> Vec<Error> {
    let mut failures = Vec::new();
    for index in indexes.iter_mut() {
        let result = match change {
            IndexChange::Insert { key, record } => index.insert(key, record),
            IndexChange::Delete { key, record } => index.delete(key, record),
            IndexChange::Update { old_key, old, new_key, new } => index.update(old_key, old, new_key, new),
        };
        if let Err(err) = result {
            warn!(index = %index.label(), error = %err, "index maintenance failed");
            failures.push(err);
        }
    }
    failures
}

/// Euclidean distance over the shared prefix of two points.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
