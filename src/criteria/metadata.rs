//! Entity metadata: the narrow interface through which field names, tables
//! and identifiers are looked up.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ast::{ConditionExpression, FieldPath, Operator, Value};
use crate::error::{QueryError, Result};

/// Coercion applied to a comparison value once its field is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueTransform {
    #[default]
    Identity,
    Lowercase,
    Uppercase,
    Text,
    Integer,
    Boolean,
}

impl ValueTransform {
    /// Apply the coercion. `NULL` passes through; lists are coerced element-wise.
    pub fn apply(&self, field: &str, value: Value) -> Result<Value> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (_, Value::List(items)) => items
                .into_iter()
                .map(|item| self.apply(field, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            (ValueTransform::Identity, v) => Ok(v),
            (ValueTransform::Lowercase, Value::Text(s)) => Ok(Value::Text(s.to_lowercase())),
            (ValueTransform::Uppercase, Value::Text(s)) => Ok(Value::Text(s.to_uppercase())),
            (ValueTransform::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (ValueTransform::Text, Value::Integer(i)) => Ok(Value::Text(i.to_string())),
            (ValueTransform::Text, Value::Float(f)) => Ok(Value::Text(f.to_string())),
            (ValueTransform::Text, Value::Bool(b)) => Ok(Value::Text(b.to_string())),
            (ValueTransform::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
            (ValueTransform::Integer, Value::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| QueryError::invalid_value(field, format!("'{}' is not an integer", s))),
            (ValueTransform::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ValueTransform::Boolean, Value::Integer(i @ (0 | 1))) => Ok(Value::Bool(i == 1)),
            (ValueTransform::Boolean, Value::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(QueryError::invalid_value(field, format!("'{}' is not a boolean", s))),
            },
            (transform, v) => Err(QueryError::invalid_value(
                field,
                format!("cannot apply {:?} to a {} value", transform, v.type_name()),
            )),
        }
    }
}

/// Where a logical field lives in the backend, plus its value coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub path: FieldPath,
    pub transform: ValueTransform,
}

impl FieldMapping {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            path: FieldPath::new(column),
            transform: ValueTransform::Identity,
        }
    }

    pub fn with_transform(mut self, transform: ValueTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Build a validated comparison against this field.
    ///
    /// `field` is the logical name, used only in error messages.
    pub fn comparison(&self, field: &str, op: Operator, value: Value) -> Result<ConditionExpression> {
        match (&value, op) {
            (Value::List(_), op) if !op.is_membership() => {
                return Err(QueryError::invalid_value(
                    field,
                    format!("a list is only valid with IN / NOT IN, not {}", op),
                ))
            }
            (v, op) if op.is_membership() && !matches!(v, Value::List(_)) => {
                return Err(QueryError::invalid_value(
                    field,
                    format!("{} requires a list value", op),
                ))
            }
            (Value::List(items), _) if items.iter().any(Value::is_null) => {
                return Err(QueryError::invalid_value(field, "NULL is not allowed in a list"))
            }
            (Value::Null, Operator::Eq | Operator::NotEq) => {}
            (Value::Null, op) => {
                return Err(QueryError::invalid_value(
                    field,
                    format!("NULL can only be compared with = or <>, not {}", op),
                ))
            }
            (v, Operator::Like | Operator::NotLike) if !matches!(v, Value::Text(_)) => {
                return Err(QueryError::invalid_value(field, "LIKE requires a text pattern"))
            }
            _ => {}
        }
        let value = self.transform.apply(field, value)?;
        Ok(ConditionExpression::comparison(self.path.clone(), Some(op), value))
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableName {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
}

/// Entity metadata provider.
///
/// The core never introspects the storage schema itself; everything it knows
/// about an entity comes through this trait.
pub trait MetadataProvider: Send + Sync {
    /// Ordered identifier field names, or `None` when the entity is unknown.
    fn identifier_fields(&self, entity: &str) -> Option<Vec<String>>;

    fn is_composite_identifier(&self, entity: &str) -> bool {
        self.identifier_fields(entity)
            .is_some_and(|fields| fields.len() > 1)
    }

    fn field_mapping(&self, entity: &str, field: &str) -> Option<FieldMapping>;

    fn table(&self, entity: &str) -> Option<TableName>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    /// Column name; defaults to the logical name.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub transform: ValueTransform,
}

/// Declarative entity description, as found in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub identifier: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            schema: None,
            identifier: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn identifier(mut self, fields: &[&str]) -> Self {
        self.identifier = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn field(mut self, name: &str, column: &str) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            column: Some(column.to_string()),
            transform: ValueTransform::Identity,
        });
        self
    }

    pub fn field_with(mut self, name: &str, column: &str, transform: ValueTransform) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            column: Some(column.to_string()),
            transform,
        });
        self
    }
}

/// In-memory metadata built from entity definitions.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    entities: HashMap<String, EntityDefinition>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityDefinition) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl FromIterator<EntityDefinition> for StaticMetadata {
    fn from_iter<T: IntoIterator<Item = EntityDefinition>>(iter: T) -> Self {
        Self {
            entities: iter.into_iter().map(|e| (e.name.clone(), e)).collect(),
        }
    }
}

impl MetadataProvider for StaticMetadata {
    fn identifier_fields(&self, entity: &str) -> Option<Vec<String>> {
        self.entities.get(entity).map(|e| e.identifier.clone())
    }

    fn field_mapping(&self, entity: &str, field: &str) -> Option<FieldMapping> {
        let def = self.entities.get(entity)?;
        if let Some(f) = def.fields.iter().find(|f| f.name == field) {
            let column = f.column.clone().unwrap_or_else(|| f.name.clone());
            return Some(FieldMapping::new(column).with_transform(f.transform));
        }
        // Identifier fields are addressable even when not listed as fields.
        def.identifier
            .iter()
            .find(|id| id.as_str() == field)
            .map(|id| FieldMapping::new(id.clone()))
    }

    fn table(&self, entity: &str) -> Option<TableName> {
        self.entities.get(entity).map(|e| TableName {
            schema: e.schema.clone(),
            name: e.table.clone(),
        })
    }
}
