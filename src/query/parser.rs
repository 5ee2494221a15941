use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_until, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::{opt, rest, value, verify};
use nom::multi::separated_list1;
use nom::sequence::preceded;
use nom::{IResult, Parser};
use regex::Regex;
use crate::core::error::{Error, Result};
use crate::core::types::{parse_number, FieldValue};
use crate::query::ast::{CompareOp, Condition, FieldCondition, Predicate};

type Res<'a, O> = IResult<&'a str, O>;

/// `select <columns> from <table> [where <conditions>]`
#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryStatement {
    pub columns: Vec<String>,
    pub table: String,
    pub predicate: Predicate,
}

/// Parse a subquery statement. Keywords are case-insensitive, identifiers keep their case.
pub fn parse_subquery(text: &str) -> Result<SubqueryStatement> {
    let (remaining, (columns, table, where_clause)) = select_statement(text)
        .map_err(|e| Error::parse(format!("Invalid subquery '{}': {}", text, e)))?;
    if !remaining.is_empty() {
        return Err(Error::parse(format!("Unexpected trailing input in subquery: '{}'", remaining)));
    }

    let predicate = match where_clause {
        Some(clause) => parse_conditions(clause)?,
        None => Predicate::MatchAll,
    };

    Ok(SubqueryStatement {
        columns: columns.into_iter().map(str::to_string).collect(),
        table: table.to_string(),
        predicate,
    })
}

/// Parse a textual where clause.
/// `and` binds first, then `or`, then a leading `not`; leaves are
/// `field <op> value` or `field = {column: c, subquery: select ...}`.
pub fn parse_conditions(text: &str) -> Result<Predicate> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::parse("Empty condition"));
    }

    let and_split = Regex::new(r"(?i)\s+and\s+")?;
    if and_split.is_match(text) {
        let parts = and_split
            .split(text)
            .map(parse_conditions)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Predicate::And(parts));
    }

    let or_split = Regex::new(r"(?i)\s+or\s+")?;
    if or_split.is_match(text) {
        let parts = or_split
            .split(text)
            .map(parse_conditions)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Predicate::Or(parts));
    }

    if let Some(negated) = text.get(..4).filter(|p| p.eq_ignore_ascii_case("not ")).and(text.get(4..)) {
        return Ok(Predicate::Not(Box::new(parse_conditions(negated)?)));
    }

    if let Ok(("", condition)) = subquery_condition(text) {
        return Ok(Predicate::Fields(vec![condition]));
    }

    match basic_condition(text) {
        Ok(("", condition)) => Ok(Predicate::Fields(vec![condition])),
        _ => Err(Error::parse(format!("Invalid condition format: '{}'", text))),
    }
}

fn ws(input: &str) -> Res<'_, &str> {
    multispace0(input)
}

fn ws1(input: &str) -> Res<'_, &str> {
    multispace1(input)
}

fn identifier(input: &str) -> Res<'_, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.').parse(input)
}

fn column(input: &str) -> Res<'_, &str> {
    alt((
        tag("*"),
        verify(identifier, |s: &str| !s.eq_ignore_ascii_case("from")),
    ))
    .parse(input)
}

fn list_separator(input: &str) -> Res<'_, ()> {
    alt((value((), (ws, char(','), ws)), value((), ws1))).parse(input)
}

fn select_statement(input: &str) -> Res<'_, (Vec<&str>, &str, Option<&str>)> {
    let (input, _) = (ws, tag_no_case("select"), ws1).parse(input)?;
    let (input, columns) = separated_list1(list_separator, column).parse(input)?;
    let (input, _) = (ws1, tag_no_case("from"), ws1).parse(input)?;
    let (input, table) = identifier(input)?;
    let (input, where_clause) =
        opt(preceded((ws1, tag_no_case("where"), ws1), rest)).parse(input)?;
    let (input, _) = ws(input)?;
    Ok((input, (columns, table, where_clause)))
}

fn operator(input: &str) -> Res<'_, CompareOp> {
    alt((
        value(CompareOp::Gte, tag(">=")),
        value(CompareOp::Lte, tag("<=")),
        value(CompareOp::Ne, tag("<>")),
        value(CompareOp::Eq, tag("=")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Lt, tag("<")),
    ))
    .parse(input)
}

fn operand(input: &str) -> Res<'_, &str> {
    take_while1(|c: char| c != '=' && c != '<' && c != '>').parse(input)
}

fn basic_condition(input: &str) -> Res<'_, FieldCondition> {
    let (input, (field, _, op, _, raw)) = (identifier, ws, operator, ws, operand).parse(input)?;
    let condition = FieldCondition {
        field: field.to_string(),
        condition: Condition::Compare(op, literal(raw.trim())),
    };
    Ok((input, condition))
}

fn subquery_condition(input: &str) -> Res<'_, FieldCondition> {
    let (input, (field, _, _, _, _, _)) =
        (identifier, ws, char('='), ws, char('{'), ws).parse(input)?;
    let (input, (_, _, _, _, column, _, _, _)) =
        (tag_no_case("column"), ws, char(':'), ws, identifier, ws, char(','), ws).parse(input)?;
    let (input, (_, _, _, subquery, _, _)) =
        (tag_no_case("subquery"), ws, char(':'), take_until("}"), char('}'), ws).parse(input)?;
    let condition = FieldCondition {
        field: field.to_string(),
        condition: Condition::Subquery {
            column: column.to_string(),
            subquery: subquery.trim().to_string(),
        },
    };
    Ok((input, condition))
}

/// Quoted text keeps its content, numeric text becomes a number, anything else stays text.
fn literal(raw: &str) -> FieldValue {
    let quoted = (raw.starts_with('"') && raw.ends_with('"')) || (raw.starts_with('\'') && raw.ends_with('\''));
    if quoted && raw.len() >= 2 {
        return FieldValue::Text(raw[1..raw.len() - 1].to_string());
    }
    match parse_number(raw) {
        Some(n) => FieldValue::Number(n),
        None => FieldValue::Text(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_with_where() {
        let stmt = parse_subquery("SELECT id, name FROM users WHERE age >= 18").unwrap();
        assert_eq!(stmt.columns, vec!["id", "name"]);
        assert_eq!(stmt.table, "users");
        assert_eq!(stmt.predicate, Predicate::compare("age", CompareOp::Gte, 18.0));
    }

    #[test]
    fn parses_select_without_where() {
        let stmt = parse_subquery("select score from results").unwrap();
        assert_eq!(stmt.columns, vec!["score"]);
        assert_eq!(stmt.predicate, Predicate::MatchAll);
    }

    #[test]
    fn rejects_malformed_statements() {
        assert!(parse_subquery("select from t").is_err());
        assert!(parse_subquery("update t set a = 1").is_err());
        assert!(parse_conditions("a ~ 3").is_err());
    }

    #[test]
    fn splits_and_before_or() {
        let p = parse_conditions("a = 1 and b = 'x' or c < 3").unwrap();
        match p {
            Predicate::And(parts) => {
                assert_eq!(parts[0], Predicate::eq("a", 1.0));
                assert!(matches!(parts[1], Predicate::Or(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn quoted_values_stay_text() {
        assert_eq!(parse_conditions("name = \"42\"").unwrap(), Predicate::eq("name", "42"));
        assert_eq!(parse_conditions("qty <> 42").unwrap(), Predicate::compare("qty", CompareOp::Ne, 42.0));
    }

    #[test]
    fn parses_nested_subquery_condition() {
        let p = parse_conditions("score = {column: best, subquery: select best from stats}").unwrap();
        assert_eq!(
            p,
            Predicate::field(
                "score",
                Condition::Subquery { column: "best".into(), subquery: "select best from stats".into() }
            )
        );
    }
}
