//! Merges an embedded base-query fragment with the rest of a criteria map.
use std::sync::Arc;

use tracing::debug;

use super::parser::{Criteria, CriteriaParser, OrderBy};
use crate::ast::{ConditionExpression, QueryLanguageParser, Query, CONDITION};
use crate::error::{QueryError, Result};
use crate::persister::Persister;

/// Combines the criteria parser with the query-language parser.
///
/// When a criteria map carries a text fragment under the reserved key, the
/// fragment's condition comes first and the remaining criteria are AND-ed
/// after it.
#[derive(Debug, Clone)]
pub struct QueryComposer {
    criteria: CriteriaParser,
    text: QueryLanguageParser,
}

impl QueryComposer {
    pub fn new(persister: Arc<Persister>) -> Self {
        Self {
            criteria: CriteriaParser::new(Arc::clone(&persister)),
            text: QueryLanguageParser::new(persister),
        }
    }

    pub fn with_reserved_key(mut self, key: impl Into<String>) -> Self {
        self.criteria = self.criteria.with_reserved_key(key);
        self
    }

    pub fn criteria_parser(&self) -> &CriteriaParser {
        &self.criteria
    }

    pub fn text_parser(&self) -> &QueryLanguageParser {
        &self.text
    }

    pub fn persister(&self) -> &Arc<Persister> {
        self.criteria.persister()
    }

    /// Point both parsers at `persister`.
    pub fn set_persister(&mut self, persister: Arc<Persister>) {
        self.criteria.set_persister(Arc::clone(&persister));
        self.text.set_persister(persister);
    }

    pub fn compose(
        &self,
        criteria: &Criteria,
        order_by: &OrderBy,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Query> {
        let mut query = self.criteria.parse(criteria, order_by, limit, offset)?;
        let key = self.criteria.reserved_key();
        let Some(base) = criteria.get(key) else {
            return Ok(query);
        };
        let text = base.as_str().ok_or_else(|| {
            QueryError::invalid_value(key, "the base query must be a string")
        })?;

        let raw = self.text.parse_condition(text)?;
        let parsed = query
            .condition()
            .cloned()
            .unwrap_or_else(ConditionExpression::always);
        let merged = if parsed.is_trivial() {
            raw
        } else {
            ConditionExpression::and([raw, parsed])
        };
        debug!(entity = self.persister().entity(), condition = %merged, "composed query");
        query.set_clause(CONDITION, merged)?;
        Ok(query)
    }
}
