//! Backend-specific lowering and execution of parsed queries.
//!
//! ```text
//! Query (condition + order + pagination)
//!       ↓  lower()            (lowering.rs)
//! SelectQuery (SQL AST)  →  compile()  →  NativeQuery
//!       ↓  to_count_form()    (count.rs)
//! CountRewriteResult (no pagination, DISTINCT, walker strategy)
//!       ↓  execute*()         (execution.rs)
//! ExecutionBackend
//! ```
mod count;
mod execution;
mod lowering;

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::compiler::compile;
use crate::ast::sql::SelectQuery;
use crate::ast::FieldPath;
use crate::criteria::{FieldMapping, FieldResolver, MetadataProvider, TableName};
use crate::error::{QueryError, Result};

pub use count::{CountRewriteResult, CountStrategy, ResultShape, ScalarColumn};
pub use execution::{BackendError, ExecutionBackend, ResultSet, Row};
#[cfg(test)]
pub(crate) use execution::test_backend;

/// Alias the root entity's table is given in lowered statements.
pub const ROOT_ALIAS: &str = "e";

/// How the backend folds the case of unquoted result column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCasing {
    /// PostgreSQL folds unquoted identifiers to lower case.
    #[default]
    Lower,
    Upper,
    Preserve,
}

impl ResultCasing {
    pub fn apply(&self, column: &str) -> String {
        match self {
            ResultCasing::Lower => column.to_lowercase(),
            ResultCasing::Upper => column.to_uppercase(),
            ResultCasing::Preserve => column.to_string(),
        }
    }
}

/// Identity shape of an entity, decided once per persister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Composite(Vec<FieldPath>),
    Single(FieldPath),
}

impl Identity {
    pub fn columns(&self) -> Vec<&FieldPath> {
        match self {
            Identity::Composite(paths) => paths.iter().collect(),
            Identity::Single(path) => vec![path],
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Identity::Composite(_))
    }
}

/// Execution hints attached to a lowered query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryHints {
    pub distinct: bool,
    pub walker: Option<CountStrategy>,
}

/// A query in the backend's native executable form.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub select: SelectQuery,
    pub sql: String,
    pub hints: QueryHints,
}

impl NativeQuery {
    pub fn new(select: SelectQuery) -> Self {
        let sql = compile(&select);
        Self {
            select,
            sql,
            hints: QueryHints::default(),
        }
    }

    /// Copy of this query with its pagination replaced.
    pub fn paginated(&self, limit: Option<u64>, offset: Option<u64>) -> Self {
        let mut select = self.select.clone();
        select.limit = limit;
        select.offset = offset;
        Self {
            sql: compile(&select),
            select,
            hints: self.hints.clone(),
        }
    }
}

impl fmt::Display for NativeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Lowers and executes queries for one entity type against PostgreSQL.
///
/// A persister is shared (behind an `Arc`) by every query of its entity; the
/// field-resolution cache and the identity decision live here.
pub struct Persister {
    entity: String,
    metadata: Arc<dyn MetadataProvider>,
    resolver: FieldResolver,
    casing: ResultCasing,
    identity: OnceLock<Identity>,
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("entity", &self.entity)
            .field("casing", &self.casing)
            .field("identity", &self.identity.get())
            .finish_non_exhaustive()
    }
}

impl Persister {
    pub fn new(metadata: Arc<dyn MetadataProvider>, entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            metadata,
            resolver: FieldResolver::new(),
            casing: ResultCasing::default(),
            identity: OnceLock::new(),
        }
    }

    pub fn with_casing(mut self, casing: ResultCasing) -> Self {
        self.casing = casing;
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn casing(&self) -> ResultCasing {
        self.casing
    }

    pub fn resolver(&self) -> &FieldResolver {
        &self.resolver
    }

    pub fn resolve_field(&self, field: &str) -> Result<FieldMapping> {
        self.resolver
            .resolve(self.metadata.as_ref(), &self.entity, field)
    }

    pub(crate) fn table(&self) -> Result<TableName> {
        self.metadata
            .table(&self.entity)
            .ok_or_else(|| QueryError::UnsupportedEntity(self.entity.clone()))
    }

    /// Identity shape of the entity. Computed on first use.
    pub fn identity(&self) -> Result<&Identity> {
        if let Some(identity) = self.identity.get() {
            return Ok(identity);
        }
        let fields = self
            .metadata
            .identifier_fields(&self.entity)
            .filter(|fields| !fields.is_empty())
            .ok_or_else(|| QueryError::UnsupportedEntity(self.entity.clone()))?;
        let mut paths = fields
            .iter()
            .map(|field| {
                self.resolve_field(field)
                    .map(|mapping| mapping.path)
                    .map_err(|_| QueryError::UnsupportedEntity(self.entity.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let identity = if self.metadata.is_composite_identifier(&self.entity) {
            Identity::Composite(paths)
        } else {
            Identity::Single(paths.remove(0))
        };
        debug!(entity = %self.entity, composite = identity.is_composite(), "resolved identity");
        Ok(self.identity.get_or_init(|| identity))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::persister_for;
    use super::*;

    #[test]
    fn test_single_identity() {
        let p = persister_for("users");
        assert_eq!(p.identity().unwrap(), &Identity::Single(FieldPath::new("id")));
    }

    #[test]
    fn test_composite_identity_uses_columns() {
        let p = persister_for("memberships");
        assert_eq!(
            p.identity().unwrap(),
            &Identity::Composite(vec![FieldPath::new("user_id"), FieldPath::new("group_id")])
        );
    }

    #[test]
    fn test_missing_identity_is_unsupported() {
        let p = persister_for("events");
        assert_eq!(
            p.identity().unwrap_err(),
            QueryError::UnsupportedEntity("events".into())
        );
    }

    #[test]
    fn test_result_casing() {
        assert_eq!(ResultCasing::Lower.apply("DCTRN_Count"), "dctrn_count");
        assert_eq!(ResultCasing::Upper.apply("dctrn_count"), "DCTRN_COUNT");
        assert_eq!(ResultCasing::Preserve.apply("Dctrn"), "Dctrn");
    }
}
