use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use regex::Regex;
use tracing::warn;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{FieldValue, Record};
use crate::query::ast::{CompareOp, Condition, FieldCondition, Predicate};
use crate::query::parser::parse_subquery;

/// Read access to sibling tables for subqueries and column references.
pub trait SubqueryResolver {
    /// Full records of `table` that satisfy `predicate`.
    fn resolve(&self, table: &str, predicate: &Predicate) -> Result<Vec<Record>>;
}

/// Resolver for evaluation outside a database: every lookup fails.
pub struct Detached;

impl SubqueryResolver for Detached {
    fn resolve(&self, table: &str, _predicate: &Predicate) -> Result<Vec<Record>> {
        Err(Error::new(
            ErrorKind::InvalidState,
            format!("No catalog available to resolve table {}", table),
        ))
    }
}

/// Record matcher. Evaluation errors never escape: they are logged and count as no match.
pub struct PredicateMatcher<'a> {
    resolver: &'a dyn SubqueryResolver,
    patterns: RefCell<HashMap<String, Regex>>,
}

impl<'a> PredicateMatcher<'a> {
    pub fn new(resolver: &'a dyn SubqueryResolver) -> Self {
        PredicateMatcher {
            resolver,
            patterns: RefCell::new(HashMap::new()),
        }
    }

    pub fn is_match(&self, record: &Record, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::MatchAll => true,
            Predicate::And(items) => items.iter().all(|p| self.is_match(record, p)),
            Predicate::Or(items) => items.iter().any(|p| self.is_match(record, p)),
            Predicate::Not(inner) => !self.is_match(record, inner),
            Predicate::Unsupported(op) => {
                warn!(operator = %op, "unsupported logical operator");
                false
            }
            Predicate::Fields(conditions) => match self.fields_match(record, conditions) {
                Ok(matched) => matched,
                Err(err) => {
                    warn!(error = %err, "predicate evaluation failed");
                    false
                }
            },
        }
    }

    fn fields_match(&self, record: &Record, conditions: &[FieldCondition]) -> Result<bool> {
        for cond in conditions {
            let value = match record.get(&cond.field) {
                Some(value) => value,
                None => return Ok(false),
            };
            if !self.condition_holds(record, value, &cond.condition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn condition_holds(&self, record: &Record, value: &FieldValue, condition: &Condition) -> Result<bool> {
        match condition {
            Condition::Literal(expected) => Ok(value == expected),
            Condition::Compare(op, operand) => Ok(compare(value, *op, operand)),
            Condition::In(options) => Ok(options.iter().any(|o| o == value)),
            Condition::Between(low, high) => Ok(
                loose_cmp(value, low) != Ordering::Less && loose_cmp(value, high) != Ordering::Greater
            ),
            Condition::Like(pattern) => Ok(self.like_pattern(pattern)?.is_match(&value.to_text())),
            Condition::Subquery { column, subquery } => {
                match self.subquery_value(column, subquery)? {
                    Some(found) => Ok(compare(value, CompareOp::Eq, &found)),
                    None => Ok(false),
                }
            }
            Condition::ColumnRef { table, column } => {
                let key = record.get(column).ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, format!("Record has no column {}", column))
                })?;
                let rows = self.resolver.resolve(
                    table,
                    &Predicate::field(column.clone(), Condition::Literal(key.clone())),
                )?;
                if rows.len() != 1 {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        format!("Expected exactly one row in {} for {} = {}, found {}", table, column, key, rows.len()),
                    ));
                }
                Ok(rows[0].get(column) == Some(value))
            }
            Condition::Unsupported(_) => Ok(false),
        }
    }

    /// First non-empty projected row's `column`, if any.
    fn subquery_value(&self, column: &str, subquery: &str) -> Result<Option<FieldValue>> {
        let statement = parse_subquery(subquery)?;
        let rows = self.resolver.resolve(&statement.table, &statement.predicate)?;
        Ok(rows
            .iter()
            .map(|row| row.project(&statement.columns))
            .find(|row| !row.is_empty())
            .and_then(|row| row.get(column).cloned()))
    }

    fn like_pattern(&self, pattern: &str) -> Result<Regex> {
        if let Some(regex) = self.patterns.borrow().get(pattern) {
            return Ok(regex.clone());
        }
        let regex = like_to_regex(pattern)?;
        self.patterns.borrow_mut().insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

/// Numeric ordering when both sides read as numbers, string ordering otherwise.
pub fn loose_cmp(left: &FieldValue, right: &FieldValue) -> Ordering {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        if let Some(ordering) = a.partial_cmp(&b) {
            return ordering;
        }
    }
    left.to_text().cmp(&right.to_text())
}

pub fn compare(left: &FieldValue, op: CompareOp, right: &FieldValue) -> bool {
    let ordering = loose_cmp(left, right);
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Gte => ordering != Ordering::Less,
        CompareOp::Lte => ordering != Ordering::Greater,
    }
}

/// `%` is any run, `_` any single character. Case-insensitive, unanchored.
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::from("(?i)");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    Ok(Regex::new(&source)?)
}
