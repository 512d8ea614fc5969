/// Query AST and SQL target representation.
///
/// ```text
/// Criteria map / query text
///       ↓
/// Condition AST           (types.rs, parser.rs)
///       ↓
/// Query object            (query.rs)
///       ↓  persister lowering
/// SQL target AST          (sql.rs)
///       ↓
/// SQL Compiler            (compiler.rs)
/// ```
pub mod compiler;
pub mod parser;
pub mod query;
pub mod sql;
pub mod types;

// Re-export key types for convenience
pub use compiler::compile;
pub use parser::QueryLanguageParser;
pub use query::{Clause, ClauseExpression, ClauseName, Query, QueryState, CONDITION, ORDER};
pub use types::*;
