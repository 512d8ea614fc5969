use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::error::Error as StdError;
use std::fmt;
use std::time::Instant;
use tokio_postgres::{types::Type, Client};
use tracing::{debug, warn};

use crate::ast::Value;
use crate::persister::{BackendError, ExecutionBackend, ResultSet, Row};

/// Categorized error types for SQL execution failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE 42601 / 42000)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// `ExecutionBackend` over a live tokio-postgres client.
///
/// Statements arrive fully lowered with inlined literals. They go through
/// `Client::query` (extended protocol, unnamed statement) with no bind
/// parameters.
pub struct PgBackend {
    client: Client,
}

impl PgBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn query(&self, sql: &str) -> Result<Vec<tokio_postgres::Row>, BackendError> {
        let start = Instant::now();
        let rows = self.client.query(sql, &[]).await.map_err(|e| {
            let message = describe_pg_error(&e, sql);
            warn!(%sql, error = %message, "query failed");
            BackendError::Failed(message)
        })?;
        debug!(rows = rows.len(), elapsed = ?start.elapsed(), "query finished");
        Ok(rows)
    }
}

impl ExecutionBackend for PgBackend {
    async fn fetch_all(&self, sql: &str) -> Result<ResultSet, BackendError> {
        let rows = self.query(sql).await?;
        Ok(ResultSet {
            rows: rows.iter().map(convert_row).collect(),
        })
    }

    async fn fetch_one(&self, sql: &str) -> Result<Row, BackendError> {
        let rows = self.query(sql).await?;
        match rows.as_slice() {
            [] => Err(BackendError::NoResult),
            [row] => Ok(convert_row(row)),
            _ => Err(BackendError::NonUniqueResult),
        }
    }

    async fn fetch_scalar(&self, sql: &str, column: Option<&str>) -> Result<i64, BackendError> {
        let rows = self.query(sql).await?;
        let row = match rows.as_slice() {
            [] => return Err(BackendError::NoResult),
            [row] => row,
            _ => return Err(BackendError::NonUniqueResult),
        };
        let value = match column {
            Some(name) => row.try_get::<_, i64>(name),
            None => row.try_get::<_, i64>(0),
        };
        value.map_err(|e| BackendError::Failed(format!("count column is not an integer: {}", e)))
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.push(column.name(), extract_value(row, idx, column.type_()));
    }
    out
}

fn extract_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Integer(v.into()))
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Integer(v.into()))
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Float(v.into()))
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(|t| Value::Text(t.to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|t| Value::Text(t.to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(|t| Value::Text(t.to_rfc3339()))
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(|j| Value::Text(j.to_string()))
            .unwrap_or(Value::Null),
        _ => {
            // Fallback: try to get as string
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::Text)
                .unwrap_or(Value::Null)
        }
    }
}

/// One-line description of a tokio-postgres error, with SQLSTATE category
/// and, when the server reports one, the line/column inside `sql`.
pub fn describe_pg_error(err: &tokio_postgres::Error, sql: &str) -> String {
    let Some(db_err) = err.as_db_error() else {
        return match err.source() {
            Some(source) => format!("{}: {} ({})", ErrorCategory::Connection, err, source),
            None => format!("{}: {}", ErrorCategory::Unknown, err),
        };
    };
    let code = db_err.code().code();
    let mut message = format!("{} [{}]: {}", categorize_sqlstate(code), code, db_err.message());
    if let Some(tokio_postgres::error::ErrorPosition::Original(pos)) = db_err.position() {
        let (line, col) = byte_offset_to_line_col(sql, *pos as usize);
        message.push_str(&format!(" at line {}, column {}", line, col));
    }
    if let Some(hint) = db_err.hint() {
        message.push_str(&format!(" (hint: {})", hint));
    }
    message
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (usize, usize) {
    if byte_pos == 0 || query.is_empty() {
        return (1, 1);
    }
    let target = (byte_pos - 1).min(query.len()); // PostgreSQL positions are 1-based
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        // 42P01 = undefined_table, 42703 = undefined_column, etc.
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}
