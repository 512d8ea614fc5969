//! Error taxonomy shared by the parsers, the persister and the repository.
use thiserror::Error;

/// Every failure the query pipeline can surface to a caller.
///
/// Parse-time and resolve-time failures are terminal: no partially built
/// query is ever returned alongside one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("unknown field \"{field}\" on entity \"{entity}\"")]
    UnknownField { entity: String, field: String },

    #[error("unknown clause: {0}")]
    UnknownClause(String),

    #[error("invalid criteria value for \"{field}\": {reason}")]
    InvalidCriteriaValue { field: String, reason: String },

    #[error("syntax error at byte {position}: expected {expected}")]
    SyntaxError { position: usize, expected: String },

    #[error("entity \"{0}\" has no identifier metadata")]
    UnsupportedEntity(String),

    #[error("query is already bound to a persister")]
    AlreadyBound,

    #[error("query is frozen once bound to a persister")]
    QueryFrozen,

    #[error("query is not bound to this persister")]
    NotBound,

    #[error("no result found")]
    NotFound,

    #[error("more than one result found")]
    NonUniqueResult,

    #[error("repository is misconfigured: {0}")]
    MisconfiguredRepository(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl QueryError {
    pub(crate) fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::InvalidCriteriaValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;
