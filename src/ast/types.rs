//! Condition and ordering AST produced by the criteria and text parsers.
//!
//! This is the backend-agnostic representation every parser targets and
//! every persister consumes. Field references stored here are always
//! resolved paths, never the logical names a caller typed.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// A resolved, backend-addressable field path (a column of the root entity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(column: impl Into<String>) -> Self {
        Self(column.into())
    }

    pub fn column(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Literal values carried by comparisons.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Only legal as the operand of `IN` / `NOT IN`.
    List(Vec<Value>),
}

impl Value {
    /// Convert a JSON scalar (or array of scalars) into a value.
    ///
    /// Objects and nested arrays have no value representation and yield `None`.
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Integer)
                .or_else(|| n.as_f64().map(Value::Float)),
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
                    scalar => Value::from_json(scalar),
                })
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            serde_json::Value::Object(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::List(_) => "list",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", items.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Comparison operators understood by every parser and persister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "<>",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
        }
    }

    /// Whether the operator takes a list operand.
    pub fn is_membership(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl FromStr for Operator {
    type Err = ();

    /// Accepts symbolic and word spellings, case-insensitively.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Ok(Operator::Eq),
            "!=" | "<>" | "neq" | "ne" => Ok(Operator::NotEq),
            "<" | "lt" => Ok(Operator::Lt),
            "<=" | "lte" => Ok(Operator::LtEq),
            ">" | "gt" => Ok(Operator::Gt),
            ">=" | "gte" => Ok(Operator::GtEq),
            "like" => Ok(Operator::Like),
            "not like" => Ok(Operator::NotLike),
            "in" => Ok(Operator::In),
            "not in" => Ok(Operator::NotIn),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition tree. `And(vec![])` is the always-true condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpression {
    Comparison {
        field: FieldPath,
        op: Operator,
        value: Value,
    },
    And(Vec<ConditionExpression>),
    Or(Vec<ConditionExpression>),
    /// Opaque fragment handed to the backend verbatim.
    Raw(String),
}

impl ConditionExpression {
    /// The always-true condition.
    pub fn always() -> Self {
        ConditionExpression::And(Vec::new())
    }

    /// Build a comparison; `None` means implicit equality.
    pub fn comparison(field: FieldPath, op: Option<Operator>, value: impl Into<Value>) -> Self {
        ConditionExpression::Comparison {
            field,
            op: op.unwrap_or(Operator::Eq),
            value: value.into(),
        }
    }

    pub fn raw(fragment: impl Into<String>) -> Self {
        ConditionExpression::Raw(fragment.into())
    }

    /// Conjunction of `children`.
    ///
    /// Directly nested conjunctions are flattened, always-true children are
    /// dropped and a single remaining child is returned as is.
    pub fn and(children: impl IntoIterator<Item = ConditionExpression>) -> Self {
        let mut flat = Vec::new();
        for child in children {
            match child {
                ConditionExpression::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        ConditionExpression::And(flat)
    }

    /// Disjunction of `children`, flattening directly nested disjunctions.
    pub fn or(children: impl IntoIterator<Item = ConditionExpression>) -> Self {
        let mut flat = Vec::new();
        for child in children {
            match child {
                ConditionExpression::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        ConditionExpression::Or(flat)
    }

    /// True for the always-true condition.
    pub fn is_trivial(&self) -> bool {
        matches!(self, ConditionExpression::And(children) if children.is_empty())
    }

    /// All comparisons in the tree, depth first.
    pub fn comparisons(&self) -> Vec<(&FieldPath, Operator, &Value)> {
        let mut out = Vec::new();
        self.collect_comparisons(&mut out);
        out
    }

    fn collect_comparisons<'a>(&'a self, out: &mut Vec<(&'a FieldPath, Operator, &'a Value)>) {
        match self {
            ConditionExpression::Comparison { field, op, value } => out.push((field, *op, value)),
            ConditionExpression::And(children) | ConditionExpression::Or(children) => {
                for child in children {
                    child.collect_comparisons(out);
                }
            }
            ConditionExpression::Raw(_) => {}
        }
    }
}

impl fmt::Display for ConditionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionExpression::Comparison { field, op, value } => {
                write!(f, "{} {} {}", field, op, value)
            }
            ConditionExpression::And(children) if children.is_empty() => write!(f, "TRUE"),
            ConditionExpression::Or(children) if children.is_empty() => write!(f, "FALSE"),
            ConditionExpression::And(children) | ConditionExpression::Or(children) => {
                let joiner = if matches!(self, ConditionExpression::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let parts: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(joiner))
            }
            ConditionExpression::Raw(fragment) => write!(f, "({})", fragment),
        }
    }
}

/// Sort direction of one ordering entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl FromStr for Direction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Direction::Asc),
            "desc" | "descending" => Ok(Direction::Desc),
            other => Err(QueryError::invalid_value(
                "order",
                format!("unknown sort direction: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub field: FieldPath,
    pub direction: Direction,
}

/// Ordered sequence of sort keys; insertion order is the tie-break order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderSpec(Vec<OrderItem>);

impl OrderSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: FieldPath, direction: Direction) {
        self.0.push(OrderItem { field, direction });
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(FieldPath, Direction)> for OrderSpec {
    fn from_iter<T: IntoIterator<Item = (FieldPath, Direction)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(field, direction)| OrderItem { field, direction })
                .collect(),
        )
    }
}
