//! Criteria map → Query.
use std::sync::Arc;

use tracing::debug;

use crate::ast::{ConditionExpression, Direction, Operator, OrderSpec, Query, Value};
use crate::error::{QueryError, Result};
use crate::persister::Persister;

/// Key under which a criteria map may embed a raw base-query fragment.
pub const DEFAULT_RESERVED_KEY: &str = "query";

/// Insertion-ordered field → value map.
pub type Criteria = serde_json::Map<String, serde_json::Value>;

/// Ordered `(field, direction)` pairs; directions are `ASC` / `DESC`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBy(Vec<(String, String)>);

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, field: impl Into<String>, direction: impl Into<String>) -> Self {
        self.0.push((field.into(), direction.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(f, d)| (f.as_str(), d.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(&str, &str)>> for OrderBy {
    fn from(pairs: Vec<(&str, &str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(f, d)| (f.to_string(), d.to_string()))
                .collect(),
        )
    }
}

/// Translates criteria maps into queries for one entity type.
#[derive(Debug, Clone)]
pub struct CriteriaParser {
    persister: Arc<Persister>,
    reserved_key: String,
}

impl CriteriaParser {
    pub fn new(persister: Arc<Persister>) -> Self {
        Self {
            persister,
            reserved_key: DEFAULT_RESERVED_KEY.to_string(),
        }
    }

    pub fn with_reserved_key(mut self, key: impl Into<String>) -> Self {
        self.reserved_key = key.into();
        self
    }

    pub fn reserved_key(&self) -> &str {
        &self.reserved_key
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    pub fn set_persister(&mut self, persister: Arc<Persister>) {
        self.persister = persister;
    }

    pub fn parse(
        &self,
        criteria: &Criteria,
        order_by: &OrderBy,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Query> {
        let condition = self.condition(criteria)?;
        let order = self.order(order_by)?;
        debug!(entity = self.persister.entity(), %condition, "parsed criteria");
        Ok(Query::from_parts(condition, order, limit, offset))
    }

    /// Conjunction of every non-reserved entry; always-true when none remain.
    pub fn condition(&self, criteria: &Criteria) -> Result<ConditionExpression> {
        let comparisons = criteria
            .iter()
            .filter(|(field, _)| field.as_str() != self.reserved_key)
            .map(|(field, value)| self.comparison(field, value))
            .collect::<Result<Vec<_>>>()?;
        Ok(ConditionExpression::and(comparisons))
    }

    fn comparison(&self, field: &str, value: &serde_json::Value) -> Result<ConditionExpression> {
        let mapping = self.persister.resolve_field(field)?;
        let (op, value) = match value {
            serde_json::Value::Object(obj) => structured(field, obj)?,
            serde_json::Value::Array(_) => {
                return Err(QueryError::invalid_value(
                    field,
                    "arrays require an explicit {\"op\": \"IN\", \"value\": [...]} comparison",
                ))
            }
            scalar => (Operator::Eq, scalar_value(field, scalar)?),
        };
        mapping.comparison(field, op, value)
    }

    fn order(&self, order_by: &OrderBy) -> Result<OrderSpec> {
        order_by
            .iter()
            .map(|(field, direction)| {
                let path = self.persister.resolve_field(field)?.path;
                let direction: Direction = direction.parse()?;
                Ok((path, direction))
            })
            .collect()
    }
}

/// `{"op": "...", "value": ...}` → operator and value.
fn structured(
    field: &str,
    obj: &serde_json::Map<String, serde_json::Value>,
) -> Result<(Operator, Value)> {
    let (Some(op), Some(value), 2) = (obj.get("op"), obj.get("value"), obj.len()) else {
        return Err(QueryError::invalid_value(
            field,
            "objects must be structured comparisons with exactly \"op\" and \"value\"",
        ));
    };
    let op = op
        .as_str()
        .and_then(|s| s.parse::<Operator>().ok())
        .ok_or_else(|| QueryError::invalid_value(field, format!("unknown operator {}", op)))?;
    let value = Value::from_json(value)
        .ok_or_else(|| QueryError::invalid_value(field, "value must be a scalar or a list of scalars"))?;
    Ok((op, value))
}

fn scalar_value(field: &str, value: &serde_json::Value) -> Result<Value> {
    Value::from_json(value)
        .ok_or_else(|| QueryError::invalid_value(field, "unsupported value"))
}
