use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::core::error::{Error, Result};
use crate::core::types::FieldValue;

/// Predicate tree evaluated against one record at a time
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    MatchAll,                       // Empty predicate
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Fields(Vec<FieldCondition>),    // Every field present, every condition true
    Unsupported(String),            // Unknown logical operator, never matches
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    pub field: String,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(FieldValue),
    Compare(CompareOp, FieldValue),
    In(Vec<FieldValue>),
    Between(FieldValue, FieldValue),
    Like(String),
    Subquery { column: String, subquery: String },
    ColumnRef { table: String, column: String },
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    Ne,
}

impl CompareOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "=" => Some(CompareOp::Eq),
            ">" => Some(CompareOp::Gt),
            "<" => Some(CompareOp::Lt),
            ">=" => Some(CompareOp::Gte),
            "<=" => Some(CompareOp::Lte),
            "<>" => Some(CompareOp::Ne),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Gte => ">=",
            CompareOp::Lte => "<=",
            CompareOp::Ne => "<>",
        }
    }
}

impl Predicate {
    /// Single-field comparison, the most common shape.
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<FieldValue>) -> Self {
        Predicate::Fields(vec![FieldCondition {
            field: field.into(),
            condition: Condition::Compare(op, value.into()),
        }])
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::compare(field, CompareOp::Eq, value)
    }

    pub fn field(field: impl Into<String>, condition: Condition) -> Self {
        Predicate::Fields(vec![FieldCondition { field: field.into(), condition }])
    }

    /// Build from the JSON predicate shape:
    /// `{ _op: "AND"|"OR"|"NOT", _conditions | _condition }` or `{ field: condition, .. }`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Null => return Ok(Predicate::MatchAll),
            Value::Object(map) => map,
            other => return Err(Error::parse(format!("Predicate must be an object, got {}", other))),
        };
        if map.is_empty() {
            return Ok(Predicate::MatchAll);
        }

        if let Some(op) = map.get("_op") {
            let op = match op {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return match op.to_lowercase().as_str() {
                "and" | "or" => {
                    let conditions = match map.get("_conditions") {
                        Some(Value::Array(items)) => items
                            .iter()
                            .map(Predicate::from_json)
                            .collect::<Result<Vec<_>>>()?,
                        _ => return Err(Error::parse(format!("{} requires a _conditions array", op))),
                    };
                    if op.eq_ignore_ascii_case("and") {
                        Ok(Predicate::And(conditions))
                    } else {
                        Ok(Predicate::Or(conditions))
                    }
                }
                "not" => match map.get("_condition") {
                    Some(inner) => Ok(Predicate::Not(Box::new(Predicate::from_json(inner)?))),
                    None => Err(Error::parse("NOT requires a _condition")),
                },
                _ => Ok(Predicate::Unsupported(op)),
            };
        }

        let conditions = map
            .iter()
            .map(|(field, cond)| {
                Ok(FieldCondition {
                    field: field.clone(),
                    condition: Condition::from_json(cond)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Predicate::Fields(conditions))
    }

    /// True when evaluation reads other tables.
    pub fn is_correlated(&self) -> bool {
        match self {
            Predicate::And(items) | Predicate::Or(items) => items.iter().any(Predicate::is_correlated),
            Predicate::Not(inner) => inner.is_correlated(),
            Predicate::Fields(conds) => conds.iter().any(|c| {
                matches!(c.condition, Condition::Subquery { .. } | Condition::ColumnRef { .. })
            }),
            Predicate::MatchAll | Predicate::Unsupported(_) => false,
        }
    }

    /// Value of an `=` comparison on `key_field`, if this predicate has one at the top level.
    pub fn key_equality(&self, key_field: &str) -> Option<&FieldValue> {
        match self {
            Predicate::Fields(conds) => conds.iter().find_map(|c| match &c.condition {
                Condition::Compare(CompareOp::Eq, value) if c.field == key_field => Some(value),
                _ => None,
            }),
            _ => None,
        }
    }
}

impl Condition {
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            other => return Ok(Condition::Literal(FieldValue::from_json(other))),
        };

        if let (Some(column), Some(Value::String(subquery))) = (map.get("column"), map.get("subquery")) {
            return Ok(Condition::Subquery {
                column: json_text(column),
                subquery: subquery.clone(),
            });
        }
        if let (Some(column), Some(table)) = (map.get("_column"), map.get("_table")) {
            return Ok(Condition::ColumnRef {
                table: json_text(table),
                column: json_text(column),
            });
        }

        let op = match map.get("_op") {
            Some(op) => json_text(op),
            None => return Ok(Condition::Literal(FieldValue::from_json(value))),
        };
        let operand = map.get("_value").unwrap_or(&Value::Null);

        if let Some(cmp) = CompareOp::from_symbol(&op) {
            return Ok(Condition::Compare(cmp, FieldValue::from_json(operand)));
        }

        match op.to_lowercase().as_str() {
            "in" => match operand {
                Value::Array(items) => Ok(Condition::In(items.iter().map(FieldValue::from_json).collect())),
                _ => Err(Error::parse("in requires an array _value")),
            },
            "between" => match operand {
                Value::Array(items) if items.len() == 2 => Ok(Condition::Between(
                    FieldValue::from_json(&items[0]),
                    FieldValue::from_json(&items[1]),
                )),
                _ => Err(Error::parse("between requires a [low, high] _value")),
            },
            "like" => match operand {
                Value::String(pattern) => Ok(Condition::Like(pattern.clone())),
                _ => Err(Error::parse("like requires a string _value")),
            },
            _ => Ok(Condition::Unsupported(op)),
        }
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_and_null_match_all() {
        assert_eq!(Predicate::from_json(&json!({})).unwrap(), Predicate::MatchAll);
        assert_eq!(Predicate::from_json(&Value::Null).unwrap(), Predicate::MatchAll);
    }

    #[test]
    fn logical_operators_are_case_insensitive() {
        let p = Predicate::from_json(&json!({
            "_op": "and",
            "_conditions": [{"a": {"_op": ">", "_value": 1}}, {"_op": "NOT", "_condition": {"b": 2}}]
        }))
        .unwrap();
        match p {
            Predicate::And(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[1], Predicate::Not(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_operands_are_parse_errors() {
        assert!(Predicate::from_json(&json!({"a": {"_op": "in", "_value": 3}})).unwrap_err().is_parse());
        assert!(Predicate::from_json(&json!({"a": {"_op": "between", "_value": [1]}})).is_err());
        assert!(Predicate::from_json(&json!({"_op": "OR", "_conditions": 5})).is_err());
        assert!(Predicate::from_json(&json!("a = 1")).is_err());
    }

    #[test]
    fn unknown_operators_are_kept_as_unsupported() {
        assert_eq!(
            Predicate::from_json(&json!({"_op": "XOR"})).unwrap(),
            Predicate::Unsupported("XOR".into())
        );
        assert_eq!(
            Condition::from_json(&json!({"_op": "!=", "_value": 1})).unwrap(),
            Condition::Unsupported("!=".into())
        );
    }

    #[test]
    fn key_equality_is_found_among_other_fields() {
        let p = Predicate::from_json(&json!({"a": 5, "id": {"_op": "=", "_value": 7}})).unwrap();
        assert_eq!(p.key_equality("id"), Some(&FieldValue::Number(7.0)));
        assert_eq!(p.key_equality("a"), None);
    }
}
