//! The `Query` object: named clauses, pagination and the bound persister.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{QueryError, Result};
use crate::persister::{CountRewriteResult, NativeQuery, Persister};

use super::types::{ConditionExpression, OrderSpec};

pub const CONDITION: &str = "condition";
pub const ORDER: &str = "order";

/// Stable identifiers of the clause slots a query owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClauseName {
    Condition,
    Order,
}

impl ClauseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClauseName::Condition => CONDITION,
            ClauseName::Order => ORDER,
        }
    }
}

impl FromStr for ClauseName {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            CONDITION => Ok(ClauseName::Condition),
            ORDER => Ok(ClauseName::Order),
            other => Err(QueryError::UnknownClause(other.to_string())),
        }
    }
}

impl fmt::Display for ClauseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a clause slot holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ClauseExpression {
    Condition(ConditionExpression),
    Order(OrderSpec),
}

impl ClauseExpression {
    fn slot(&self) -> ClauseName {
        match self {
            ClauseExpression::Condition(_) => ClauseName::Condition,
            ClauseExpression::Order(_) => ClauseName::Order,
        }
    }
}

impl From<ConditionExpression> for ClauseExpression {
    fn from(expr: ConditionExpression) -> Self {
        ClauseExpression::Condition(expr)
    }
}

impl From<OrderSpec> for ClauseExpression {
    fn from(order: OrderSpec) -> Self {
        ClauseExpression::Order(order)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    name: ClauseName,
    expression: ClauseExpression,
}

impl Clause {
    pub fn name(&self) -> ClauseName {
        self.name
    }

    pub fn expression(&self) -> &ClauseExpression {
        &self.expression
    }
}

/// Lifecycle of a query: `Unbound → Bound → Lowered → Executed`.
///
/// `Executed` is not final: a query may be executed again, reusing its cached
/// lowered form, and stays `Executed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Unbound,
    Bound,
    Lowered,
    Executed,
}

/// A parsed query, owned by the caller until its results are consumed.
///
/// Clauses and pagination may only change while the query is unbound; once a
/// persister is attached the query is frozen and its lowered form is cached.
#[derive(Debug)]
pub struct Query {
    clauses: BTreeMap<ClauseName, Clause>,
    limit: Option<u64>,
    offset: Option<u64>,
    persister: Option<Arc<Persister>>,
    state: QueryState,
    native: Option<NativeQuery>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            clauses: BTreeMap::new(),
            limit: None,
            offset: None,
            persister: None,
            state: QueryState::Unbound,
            native: None,
        }
    }
}

impl PartialEq for Query {
    /// Structural equality: clauses and pagination, not binding state.
    fn eq(&self, other: &Self) -> bool {
        self.clauses == other.clauses && self.limit == other.limit && self.offset == other.offset
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        condition: ConditionExpression,
        order: OrderSpec,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Self {
        let mut query = Self {
            limit,
            offset,
            ..Self::default()
        };
        query.put(ClauseExpression::Condition(condition));
        query.put(ClauseExpression::Order(order));
        query
    }

    fn put(&mut self, expression: ClauseExpression) {
        let name = expression.slot();
        self.clauses.insert(name, Clause { name, expression });
    }

    fn ensure_mutable(&self) -> Result<()> {
        match self.state {
            QueryState::Unbound => Ok(()),
            _ => Err(QueryError::QueryFrozen),
        }
    }

    /// Whether a clause with this name is present. Unknown names are absent.
    pub fn has_clause(&self, name: &str) -> bool {
        name.parse::<ClauseName>()
            .map(|n| self.clauses.contains_key(&n))
            .unwrap_or(false)
    }

    pub fn clause(&self, name: &str) -> Result<Option<&Clause>> {
        let name: ClauseName = name.parse()?;
        Ok(self.clauses.get(&name))
    }

    /// Replace the clause `name`, returning the query for chaining.
    pub fn set_clause(
        &mut self,
        name: &str,
        expression: impl Into<ClauseExpression>,
    ) -> Result<&mut Self> {
        let name: ClauseName = name.parse()?;
        self.ensure_mutable()?;
        let expression = expression.into();
        if expression.slot() != name {
            return Err(QueryError::UnknownClause(format!(
                "{} cannot hold a {} expression",
                name,
                expression.slot()
            )));
        }
        self.put(expression);
        Ok(self)
    }

    pub fn condition(&self) -> Option<&ConditionExpression> {
        match self.clauses.get(&ClauseName::Condition).map(Clause::expression) {
            Some(ClauseExpression::Condition(c)) => Some(c),
            _ => None,
        }
    }

    pub fn order(&self) -> Option<&OrderSpec> {
        match self.clauses.get(&ClauseName::Order).map(Clause::expression) {
            Some(ClauseExpression::Order(o)) => Some(o),
            _ => None,
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn set_max_results(&mut self, limit: Option<u64>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.limit = limit;
        Ok(self)
    }

    pub fn set_first_result(&mut self, offset: Option<u64>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.offset = offset;
        Ok(self)
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Attach the persister. A query may be bound exactly once.
    pub fn bind(&mut self, persister: Arc<Persister>) -> Result<&mut Self> {
        if self.state != QueryState::Unbound {
            return Err(QueryError::AlreadyBound);
        }
        self.persister = Some(persister);
        self.state = QueryState::Bound;
        Ok(self)
    }

    pub fn persister(&self) -> Option<&Arc<Persister>> {
        self.persister.as_ref()
    }

    pub fn is_bound_to(&self, persister: &Persister) -> bool {
        self.persister
            .as_ref()
            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), persister))
    }

    /// The lowered form, computed on first use and cached afterwards.
    pub fn native_query(&mut self) -> Result<&NativeQuery> {
        let persister = self.persister.clone().ok_or(QueryError::NotBound)?;
        if self.native.is_none() {
            self.native = Some(persister.lower(self)?);
            if self.state == QueryState::Bound {
                self.state = QueryState::Lowered;
            }
        }
        self.native.as_ref().ok_or(QueryError::NotBound)
    }

    /// Count-aggregate rewrite through the bound persister.
    pub fn count_form(&self) -> Result<CountRewriteResult> {
        let persister = self.persister.as_ref().ok_or(QueryError::NotBound)?;
        persister.to_count_form(self)
    }

    pub(crate) fn mark_executed(&mut self) {
        self.state = QueryState::Executed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{Direction, FieldPath, Operator};
    use crate::persister::test_support::users_persister;

    fn status_active() -> ConditionExpression {
        ConditionExpression::comparison(FieldPath::new("status"), Some(Operator::Eq), "active")
    }

    #[test]
    fn test_clause_presence_and_lookup() {
        let query = Query::from_parts(status_active(), OrderSpec::new(), Some(10), None);
        assert!(query.has_clause("condition"));
        assert!(query.has_clause("order"));
        assert!(!query.has_clause("having"));
        let clause = query.clause("condition").unwrap().unwrap();
        assert_eq!(
            clause.expression(),
            &ClauseExpression::Condition(status_active())
        );
    }

    #[test]
    fn test_unknown_clause_rejected() {
        let mut query = Query::new();
        assert_eq!(
            query.clause("group").unwrap_err(),
            QueryError::UnknownClause("group".into())
        );
        assert!(matches!(
            query.set_clause("group", status_active()),
            Err(QueryError::UnknownClause(_))
        ));
    }

    #[test]
    fn test_clause_kind_must_match_slot() {
        let mut query = Query::new();
        assert!(matches!(
            query.set_clause("order", status_active()),
            Err(QueryError::UnknownClause(_))
        ));
    }

    #[test]
    fn test_set_clause_chains() {
        let mut query = Query::new();
        let mut order = OrderSpec::new();
        order.push(FieldPath::new("name"), Direction::Asc);
        query
            .set_clause("condition", status_active())
            .unwrap()
            .set_clause("order", order.clone())
            .unwrap();
        assert_eq!(query.condition(), Some(&status_active()));
        assert_eq!(query.order(), Some(&order));
    }

    #[test]
    fn test_rebinding_fails() {
        let persister = users_persister();
        let mut query = Query::from_parts(status_active(), OrderSpec::new(), None, None);
        query.bind(persister.clone()).unwrap();
        assert_eq!(query.state(), QueryState::Bound);
        assert_eq!(query.bind(persister).unwrap_err(), QueryError::AlreadyBound);
    }

    #[test]
    fn test_bound_query_is_frozen() {
        let mut query = Query::from_parts(status_active(), OrderSpec::new(), None, None);
        query.bind(users_persister()).unwrap();
        assert_eq!(
            query.set_clause("condition", ConditionExpression::always()).unwrap_err(),
            QueryError::QueryFrozen
        );
        assert_eq!(query.set_max_results(Some(1)).unwrap_err(), QueryError::QueryFrozen);
        assert_eq!(query.set_first_result(Some(1)).unwrap_err(), QueryError::QueryFrozen);
    }

    #[test]
    fn test_lowering_requires_binding() {
        let mut query = Query::from_parts(status_active(), OrderSpec::new(), None, None);
        assert_eq!(query.native_query().unwrap_err(), QueryError::NotBound);
        assert_eq!(query.count_form().unwrap_err(), QueryError::NotBound);
    }

    #[test]
    fn test_lowering_is_cached_and_advances_state() {
        let persister = users_persister();
        let mut query = Query::from_parts(status_active(), OrderSpec::new(), None, None);
        query.bind(persister.clone()).unwrap();
        assert!(query.is_bound_to(&persister));
        let first = query.native_query().unwrap().clone();
        assert_eq!(query.state(), QueryState::Lowered);
        let second = query.native_query().unwrap().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_structural_equality_ignores_binding() {
        let a = Query::from_parts(status_active(), OrderSpec::new(), Some(5), Some(0));
        let mut b = Query::from_parts(status_active(), OrderSpec::new(), Some(5), Some(0));
        b.bind(users_persister()).unwrap();
        assert_eq!(a, b);
    }
}
