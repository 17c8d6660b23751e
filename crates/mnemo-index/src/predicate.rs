//! The predicate language for `where` clauses.
//!
//! A clause is a JSON object whose keys are either the combinators
//! `allOf`/`anyOf`/`noneOf` (taking arrays of clauses) or dotted field
//! paths mapping to a literal (implicit equals) or an operator object.
//! Several operators in one object conjoin, so range queries read
//! naturally: `{"date": {"greaterEqual": a, "less": b}}`.

use serde_json::Value;

use mnemo_error::{MnemoError, Result};
use mnemo_types::{IndexValue, OrdF64};

/// One field-level operator.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Equals(IndexValue),
    NotEquals(IndexValue),
    Greater(OrdF64),
    GreaterEqual(OrdF64),
    Less(OrdF64),
    LessEqual(OrdF64),
    In(Vec<IndexValue>),
    NotIn(Vec<IndexValue>),
    /// Substring on string values, element membership on flattened arrays.
    Contains(IndexValue),
    StartsWith(String),
    EndsWith(String),
    Exists(bool),
    /// Unanchored match; only parsed when the store opts in.
    Regex(String),
}

/// A parsed predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    None(Vec<Predicate>),
    Field { path: String, op: FieldOp },
}

impl Predicate {
    /// Parse a `where` clause. `allow_regex` gates the `regex` operator.
    pub fn parse(clause: &Value, allow_regex: bool) -> Result<Self> {
        let Value::Object(map) = clause else {
            return Err(MnemoError::invalid("where clause", clause.to_string()));
        };
        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "allOf" => parts.push(Self::All(Self::parse_list(value, allow_regex)?)),
                "anyOf" => parts.push(Self::Any(Self::parse_list(value, allow_regex)?)),
                "noneOf" => parts.push(Self::None(Self::parse_list(value, allow_regex)?)),
                field => parts.extend(Self::parse_field(field, value, allow_regex)?),
            }
        }
        Ok(match parts.len() {
            1 => parts.remove(0),
            _ => Self::All(parts),
        })
    }

    fn parse_list(value: &Value, allow_regex: bool) -> Result<Vec<Self>> {
        let Value::Array(items) = value else {
            return Err(MnemoError::invalid("combinator operand", value.to_string()));
        };
        items
            .iter()
            .map(|item| Self::parse(item, allow_regex))
            .collect()
    }

    fn parse_field(field: &str, value: &Value, allow_regex: bool) -> Result<Vec<Self>> {
        let make = |op: FieldOp| Self::Field {
            path: field.to_owned(),
            op,
        };

        // A literal is an implicit equals. An object is operator syntax,
        // except objects with no recognized operator keys, which would be a
        // nested-literal match the index cannot answer.
        let Value::Object(ops) = value else {
            let scalar = IndexValue::from_json(value)
                .ok_or_else(|| MnemoError::invalid("predicate literal", value.to_string()))?;
            return Ok(vec![make(FieldOp::Equals(scalar))]);
        };

        let mut out = Vec::with_capacity(ops.len());
        for (op_name, operand) in ops {
            let op = match op_name.as_str() {
                "equals" => FieldOp::Equals(scalar_operand(op_name, operand)?),
                "notEquals" => FieldOp::NotEquals(scalar_operand(op_name, operand)?),
                "greater" => FieldOp::Greater(numeric_operand(op_name, operand)?),
                "greaterEqual" => FieldOp::GreaterEqual(numeric_operand(op_name, operand)?),
                "less" => FieldOp::Less(numeric_operand(op_name, operand)?),
                "lessEqual" => FieldOp::LessEqual(numeric_operand(op_name, operand)?),
                "in" => FieldOp::In(list_operand(op_name, operand)?),
                "notIn" => FieldOp::NotIn(list_operand(op_name, operand)?),
                "contains" => FieldOp::Contains(scalar_operand(op_name, operand)?),
                "startsWith" => FieldOp::StartsWith(string_operand(op_name, operand)?),
                "endsWith" => FieldOp::EndsWith(string_operand(op_name, operand)?),
                "exists" => FieldOp::Exists(bool_operand(op_name, operand)?),
                "regex" => {
                    if !allow_regex {
                        return Err(MnemoError::invalid(
                            "operator",
                            "regex (disabled; enable allow_regex)",
                        ));
                    }
                    let pattern = string_operand(op_name, operand)?;
                    regex::Regex::new(&pattern)
                        .map_err(|err| MnemoError::invalid("regex", err.to_string()))?;
                    FieldOp::Regex(pattern)
                }
                unknown => {
                    return Err(MnemoError::invalid("operator", unknown));
                }
            };
            out.push(make(op));
        }
        if out.is_empty() {
            return Err(MnemoError::invalid("predicate", "empty operator object"));
        }
        Ok(out)
    }
}

fn scalar_operand(op: &str, value: &Value) -> Result<IndexValue> {
    IndexValue::from_json(value)
        .ok_or_else(|| MnemoError::invalid("operand", format!("{op}: {value}")))
}

fn numeric_operand(op: &str, value: &Value) -> Result<OrdF64> {
    value
        .as_f64()
        .map(OrdF64::new)
        .ok_or_else(|| MnemoError::invalid("operand", format!("{op} requires a number: {value}")))
}

fn string_operand(op: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| MnemoError::invalid("operand", format!("{op} requires a string: {value}")))
}

fn bool_operand(op: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| MnemoError::invalid("operand", format!("{op} requires a bool: {value}")))
}

fn list_operand(op: &str, value: &Value) -> Result<Vec<IndexValue>> {
    let Value::Array(items) = value else {
        return Err(MnemoError::invalid(
            "operand",
            format!("{op} requires an array: {value}"),
        ));
    };
    items.iter().map(|v| scalar_operand(op, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_is_implicit_equals() {
        let p = Predicate::parse(&json!({"type": "Person"}), false).unwrap();
        assert_eq!(
            p,
            Predicate::Field {
                path: "type".to_owned(),
                op: FieldOp::Equals(IndexValue::Str("Person".into())),
            }
        );
    }

    #[test]
    fn test_multiple_fields_conjoin() {
        let p = Predicate::parse(&json!({"a": 1, "b": 2}), false).unwrap();
        match p {
            Predicate::All(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected All, got {other:?}"),
        }
    }

    #[test]
    fn test_range_object_conjoins_operators() {
        let p = Predicate::parse(
            &json!({"date": {"greaterEqual": 10, "less": 20}}),
            false,
        )
        .unwrap();
        match p {
            Predicate::All(parts) => {
                assert_eq!(parts.len(), 2, "case=two_bounds");
                assert!(parts.iter().all(|part| matches!(
                    part,
                    Predicate::Field { path, .. } if path == "date"
                )));
            }
            other => panic!("expected All, got {other:?}"),
        }
    }

    #[test]
    fn test_combinators_nest() {
        let p = Predicate::parse(
            &json!({"anyOf": [{"type": "Person"}, {"noneOf": [{"age": {"less": 18}}]}]}),
            false,
        )
        .unwrap();
        match p {
            Predicate::Any(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1], Predicate::None(_)));
            }
            other => panic!("expected Any, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = Predicate::parse(&json!({"a": {"fuzzyMatch": 1}}), false).unwrap_err();
        assert_eq!(err.kind_name(), "InvalidArgument");
    }

    #[test]
    fn test_regex_is_opt_in() {
        let clause = json!({"name": {"regex": "^Al.*"}});
        assert!(Predicate::parse(&clause, false).is_err(), "case=disabled");
        assert!(Predicate::parse(&clause, true).is_ok(), "case=enabled");
    }

    #[test]
    fn test_invalid_regex_rejected_at_parse() {
        let err =
            Predicate::parse(&json!({"name": {"regex": "("}}), true).unwrap_err();
        assert_eq!(err.kind_name(), "InvalidArgument");
    }

    #[test]
    fn test_range_operand_must_be_numeric() {
        let err = Predicate::parse(&json!({"a": {"greater": "x"}}), false).unwrap_err();
        assert_eq!(err.kind_name(), "InvalidArgument");
    }

    #[test]
    fn test_in_requires_scalar_array() {
        assert!(Predicate::parse(&json!({"a": {"in": [1, 2]}}), false).is_ok());
        assert!(Predicate::parse(&json!({"a": {"in": 1}}), false).is_err());
        assert!(Predicate::parse(&json!({"a": {"in": [[1]]}}), false).is_err());
    }
}
