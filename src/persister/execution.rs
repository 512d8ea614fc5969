//! Execution of lowered queries through a pluggable backend.
use std::future::Future;

use thiserror::Error;
use tracing::debug;

use super::{CountRewriteResult, Persister};
use crate::ast::{Query, Value};
use crate::error::{QueryError, Result};

/// Failures reported by an execution backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("query returned no rows")]
    NoResult,
    #[error("query returned more than one row")]
    NonUniqueResult,
    #[error("{0}")]
    Failed(String),
}

impl From<BackendError> for QueryError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoResult => QueryError::NotFound,
            BackendError::NonUniqueResult => QueryError::NonUniqueResult,
            BackendError::Failed(msg) => QueryError::Backend(msg),
        }
    }
}

/// One result row, columns in backend order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.push(column.into());
        self.values.push(value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object view of the row, preserving column order.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(column, value)| (column.clone(), value_to_json(value)))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
    }
}

/// Rows returned by a multi-row execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Runs native queries. The core never talks to a database directly.
pub trait ExecutionBackend: Send + Sync {
    fn fetch_all(
        &self,
        sql: &str,
    ) -> impl Future<Output = std::result::Result<ResultSet, BackendError>> + Send;

    /// Exactly one row, or `NoResult` / `NonUniqueResult`.
    fn fetch_one(&self, sql: &str)
        -> impl Future<Output = std::result::Result<Row, BackendError>> + Send;

    /// A single integer from a one-row result. `column` selects the output
    /// column by name; `None` takes the first one.
    fn fetch_scalar(
        &self,
        sql: &str,
        column: Option<&str>,
    ) -> impl Future<Output = std::result::Result<i64, BackendError>> + Send;
}

impl Persister {
    fn ensure_bound(&self, query: &Query) -> Result<()> {
        if query.is_bound_to(self) {
            Ok(())
        } else {
            Err(QueryError::NotBound)
        }
    }

    /// Run the bound query. Re-running an executed query sends the same
    /// cached statement again.
    pub async fn execute<B: ExecutionBackend>(
        &self,
        backend: &B,
        query: &mut Query,
    ) -> Result<ResultSet> {
        self.ensure_bound(query)?;
        let sql = query.native_query()?.sql.clone();
        debug!(entity = %self.entity, %sql, "execute");
        let rows = backend.fetch_all(&sql).await?;
        query.mark_executed();
        Ok(rows)
    }

    /// Execute for a single row; the lowered form is capped at one row.
    pub async fn execute_one<B: ExecutionBackend>(
        &self,
        backend: &B,
        query: &mut Query,
    ) -> Result<Row> {
        self.ensure_bound(query)?;
        let native = query.native_query()?;
        let single = native.paginated(Some(1), native.select.offset);
        debug!(entity = %self.entity, sql = %single.sql, "execute one");
        let row = backend.fetch_one(&single.sql).await?;
        query.mark_executed();
        Ok(row)
    }

    pub async fn execute_scalar<B: ExecutionBackend>(
        &self,
        backend: &B,
        count: &CountRewriteResult,
    ) -> Result<i64> {
        let column = count
            .result_shape()
            .and_then(|shape| shape.columns.first())
            .map(|c| c.column.as_str());
        debug!(entity = %self.entity, sql = %count.sql(), "execute scalar");
        Ok(backend.fetch_scalar(count.sql(), column).await?)
    }
}

#[cfg(test)]
pub(crate) mod test_backend {
    use std::sync::Mutex;

    use super::*;

    /// Canned-result backend that records every statement it receives.
    #[derive(Default)]
    pub struct MemoryBackend {
        pub rows: Vec<Row>,
        pub scalar: i64,
        pub failure: Option<BackendError>,
        pub seen: Mutex<Vec<String>>,
    }

    impl MemoryBackend {
        pub fn with_rows(rows: Vec<Row>) -> Self {
            Self {
                rows,
                ..Self::default()
            }
        }

        pub fn statements(&self) -> Vec<String> {
            self.seen.lock().map(|s| s.clone()).unwrap_or_default()
        }

        fn record(&self, sql: &str) -> std::result::Result<(), BackendError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(sql.to_string());
            }
            match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    impl ExecutionBackend for MemoryBackend {
        async fn fetch_all(&self, sql: &str) -> std::result::Result<ResultSet, BackendError> {
            self.record(sql)?;
            Ok(ResultSet {
                rows: self.rows.clone(),
            })
        }

        async fn fetch_one(&self, sql: &str) -> std::result::Result<Row, BackendError> {
            self.record(sql)?;
            match self.rows.as_slice() {
                [] => Err(BackendError::NoResult),
                [row] => Ok(row.clone()),
                _ => Err(BackendError::NonUniqueResult),
            }
        }

        async fn fetch_scalar(
            &self,
            sql: &str,
            _column: Option<&str>,
        ) -> std::result::Result<i64, BackendError> {
            self.record(sql)?;
            Ok(self.scalar)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_backend::MemoryBackend;
    use super::*;
    use crate::ast::{ConditionExpression, FieldPath, Operator, OrderSpec, QueryState};
    use crate::persister::test_support::{persister_for, users_persister};

    fn active_users(limit: Option<u64>) -> Query {
        let condition =
            ConditionExpression::comparison(FieldPath::new("status"), Some(Operator::Eq), "active");
        Query::from_parts(condition, OrderSpec::new(), limit, Some(5))
    }

    fn alice() -> Row {
        Row::new().with("id", 1).with("name", "alice")
    }

    #[tokio::test]
    async fn test_execute_marks_query_executed() {
        let persister = users_persister();
        let backend = MemoryBackend::with_rows(vec![alice()]);
        let mut query = active_users(Some(10));
        query.bind(persister.clone()).unwrap();

        let rows = persister.execute(&backend, &mut query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(query.state(), QueryState::Executed);
        assert_eq!(
            backend.statements(),
            vec!["SELECT e.* FROM users e WHERE e.status = 'active' LIMIT 10 OFFSET 5"]
        );
    }

    #[tokio::test]
    async fn test_executed_query_can_run_again() {
        let persister = users_persister();
        let backend = MemoryBackend::with_rows(vec![alice()]);
        let mut query = active_users(Some(10));
        query.bind(persister.clone()).unwrap();

        persister.execute(&backend, &mut query).await.unwrap();
        persister.execute(&backend, &mut query).await.unwrap();
        persister.execute_one(&backend, &mut query).await.unwrap();
        assert_eq!(query.state(), QueryState::Executed);
        assert_eq!(
            backend.statements(),
            vec![
                "SELECT e.* FROM users e WHERE e.status = 'active' LIMIT 10 OFFSET 5",
                "SELECT e.* FROM users e WHERE e.status = 'active' LIMIT 10 OFFSET 5",
                "SELECT e.* FROM users e WHERE e.status = 'active' LIMIT 1 OFFSET 5",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_requires_matching_binding() {
        let backend = MemoryBackend::default();
        let mut unbound = active_users(None);
        assert_eq!(
            users_persister().execute(&backend, &mut unbound).await.unwrap_err(),
            QueryError::NotBound
        );

        let mut foreign = active_users(None);
        foreign.bind(users_persister()).unwrap();
        assert_eq!(
            users_persister().execute(&backend, &mut foreign).await.unwrap_err(),
            QueryError::NotBound
        );
        assert!(backend.statements().is_empty());
    }

    #[tokio::test]
    async fn test_execute_one_forces_single_row() {
        let persister = users_persister();
        let backend = MemoryBackend::with_rows(vec![alice()]);
        let mut query = active_users(Some(50));
        query.bind(persister.clone()).unwrap();

        let row = persister.execute_one(&backend, &mut query).await.unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("alice".into())));
        assert_eq!(
            backend.statements(),
            vec!["SELECT e.* FROM users e WHERE e.status = 'active' LIMIT 1 OFFSET 5"]
        );
    }

    #[tokio::test]
    async fn test_backend_errors_are_mapped() {
        let persister = users_persister();

        let empty = MemoryBackend::default();
        let mut query = active_users(None);
        query.bind(persister.clone()).unwrap();
        assert_eq!(
            persister.execute_one(&empty, &mut query).await.unwrap_err(),
            QueryError::NotFound
        );

        let many = MemoryBackend::with_rows(vec![alice(), alice()]);
        let mut query = active_users(None);
        query.bind(persister.clone()).unwrap();
        assert_eq!(
            persister.execute_one(&many, &mut query).await.unwrap_err(),
            QueryError::NonUniqueResult
        );

        let broken = MemoryBackend {
            failure: Some(BackendError::Failed("relation does not exist".into())),
            ..MemoryBackend::default()
        };
        let mut query = active_users(None);
        query.bind(persister.clone()).unwrap();
        assert_eq!(
            persister.execute(&broken, &mut query).await.unwrap_err(),
            QueryError::Backend("relation does not exist".into())
        );
        assert_eq!(query.state(), QueryState::Lowered);
    }

    #[tokio::test]
    async fn test_execute_scalar_runs_count_form() {
        let persister = persister_for("memberships");
        let backend = MemoryBackend {
            scalar: 42,
            ..MemoryBackend::default()
        };
        let query = Query::from_parts(ConditionExpression::always(), OrderSpec::new(), Some(3), None);
        let count = persister.to_count_form(&query).unwrap();
        assert_eq!(persister.execute_scalar(&backend, &count).await.unwrap(), 42);
        assert_eq!(backend.statements(), vec![count.sql().to_string()]);
    }

    #[test]
    fn test_row_to_json_keeps_column_order() {
        let row = Row::new().with("z", 1).with("a", Value::Null);
        assert_eq!(row.to_json().to_string(), r#"{"z":1,"a":null}"#);
    }
}
