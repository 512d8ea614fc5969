//! Count-aggregate rewriting.
//!
//! Entities with a single identifier are counted in place by swapping the
//! projection for `COUNT(DISTINCT e.id)`. Composite identifiers cannot be fed
//! to `COUNT(DISTINCT ...)` portably, so the distinct identifier tuples are
//! selected in a derived table and counted from the outside.
use tracing::debug;

use super::lowering::column;
use super::{Identity, NativeQuery, Persister};
use crate::ast::sql::{Expression, SelectItem, SelectQuery, TableRef};
use crate::ast::Query;
use crate::error::Result;

/// Alias of the counted column before result-casing is applied.
pub const COUNT_ALIAS: &str = "dctrn_count";
/// Alias of the derived table wrapped by the output walker.
pub const DERIVED_ALIAS: &str = "dctrn_result";
/// Name under which the output walker exposes its scalar.
pub const COUNT_COLUMN: &str = "count";

/// How the aggregate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStrategy {
    /// Wraps the query and counts its output rows.
    OutputWalker,
    /// Rewrites the query's own projection.
    TreeWalker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarColumn {
    /// Column name as the backend returns it.
    pub column: String,
    /// Name exposed to callers.
    pub alias: String,
}

/// Result-set mapping for aggregates whose output column must be renamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultShape {
    pub columns: Vec<ScalarColumn>,
}

impl ResultShape {
    pub fn scalar(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            columns: vec![ScalarColumn {
                column: column.into(),
                alias: alias.into(),
            }],
        }
    }
}

/// The native aggregate form of a query, ready for `execute_scalar`.
#[derive(Debug, Clone, PartialEq)]
pub struct CountRewriteResult {
    native: NativeQuery,
    strategy: CountStrategy,
    result_shape: Option<ResultShape>,
}

impl CountRewriteResult {
    pub fn native(&self) -> &NativeQuery {
        &self.native
    }

    pub fn sql(&self) -> &str {
        &self.native.sql
    }

    pub fn distinct(&self) -> bool {
        self.native.hints.distinct
    }

    pub fn strategy(&self) -> CountStrategy {
        self.strategy
    }

    pub fn result_shape(&self) -> Option<&ResultShape> {
        self.result_shape.as_ref()
    }
}

impl Persister {
    /// Rewrite `query` into a count of the distinct entities it matches.
    ///
    /// The input query is untouched; ordering and pagination never reach the
    /// aggregate.
    pub fn to_count_form(&self, query: &Query) -> Result<CountRewriteResult> {
        let identity = self.identity()?;
        let mut base = self.select_for(query)?;
        base.order_by.clear();
        base.limit = None;
        base.offset = None;

        let id_columns: Vec<Expression> =
            identity.columns().into_iter().map(column).collect();

        let (select, strategy, result_shape) = match identity {
            Identity::Composite(_) => {
                base.distinct = true;
                base.projections = id_columns
                    .into_iter()
                    .map(|expr| SelectItem::Expression { expr, alias: None })
                    .collect();
                let count_alias = self.casing().apply(COUNT_ALIAS);
                let outer = SelectQuery {
                    projections: vec![SelectItem::Expression {
                        expr: count_star(),
                        alias: Some(count_alias.clone()),
                    }],
                    from: Some(TableRef::Subquery {
                        query: Box::new(base),
                        alias: DERIVED_ALIAS.to_string(),
                    }),
                    ..Default::default()
                };
                (
                    outer,
                    CountStrategy::OutputWalker,
                    Some(ResultShape::scalar(count_alias, COUNT_COLUMN)),
                )
            }
            Identity::Single(_) => {
                base.projections = vec![SelectItem::Expression {
                    expr: Expression::Aggregate {
                        name: "COUNT".into(),
                        args: id_columns,
                        distinct: true,
                    },
                    alias: None,
                }];
                (base, CountStrategy::TreeWalker, None)
            }
        };

        let mut native = NativeQuery::new(select);
        native.hints.distinct = true;
        native.hints.walker = Some(strategy);
        debug!(entity = %self.entity, ?strategy, sql = %native.sql, "count rewrite");

        Ok(CountRewriteResult {
            native,
            strategy,
            result_shape,
        })
    }
}

fn count_star() -> Expression {
    Expression::Aggregate {
        name: "COUNT".into(),
        args: vec![Expression::Wildcard],
        distinct: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ast::{ConditionExpression, Direction, FieldPath, Operator, OrderSpec};
    use crate::criteria::{EntityDefinition, StaticMetadata};
    use crate::error::QueryError;
    use crate::persister::test_support::persister_for;
    use crate::persister::ResultCasing;

    fn paginated(condition: ConditionExpression) -> Query {
        let order: OrderSpec = [(FieldPath::new("role"), Direction::Desc)].into_iter().collect();
        Query::from_parts(condition, order, Some(20), Some(40))
    }

    fn role_admin() -> ConditionExpression {
        ConditionExpression::comparison(FieldPath::new("role"), Some(Operator::Eq), "admin")
    }

    #[test]
    fn test_composite_identity_uses_output_walker() {
        let count = persister_for("memberships")
            .to_count_form(&paginated(role_admin()))
            .unwrap();
        assert_eq!(count.strategy(), CountStrategy::OutputWalker);
        assert_eq!(
            count.sql(),
            "SELECT COUNT(*) AS dctrn_count FROM (SELECT DISTINCT e.user_id, e.group_id FROM memberships e WHERE e.role = 'admin') dctrn_result"
        );
        let shape = count.result_shape().unwrap();
        assert_eq!(shape.columns.len(), 1);
        assert_eq!(shape.columns[0].alias, "count");
        assert!(count.distinct());
        assert_eq!(count.native().hints.walker, Some(CountStrategy::OutputWalker));
    }

    #[test]
    fn test_single_identity_uses_tree_walker() {
        let condition =
            ConditionExpression::comparison(FieldPath::new("status"), Some(Operator::Eq), "active");
        let count = persister_for("users").to_count_form(&paginated(condition)).unwrap();
        assert_eq!(count.strategy(), CountStrategy::TreeWalker);
        assert!(count.result_shape().is_none());
        assert_eq!(
            count.sql(),
            "SELECT COUNT(DISTINCT e.id) FROM users e WHERE e.status = 'active'"
        );
    }

    #[test]
    fn test_count_strips_order_and_pagination() {
        for entity in ["users", "memberships"] {
            let count = persister_for(entity)
                .to_count_form(&paginated(ConditionExpression::always()))
                .unwrap();
            assert!(!count.sql().contains("LIMIT"), "{}", count.sql());
            assert!(!count.sql().contains("OFFSET"), "{}", count.sql());
            assert!(!count.sql().contains("ORDER BY"), "{}", count.sql());
        }
    }

    #[test]
    fn test_count_leaves_query_untouched() {
        let query = paginated(role_admin());
        let before = persister_for("memberships").lower(&query).unwrap();
        persister_for("memberships").to_count_form(&query).unwrap();
        assert_eq!(query.limit(), Some(20));
        assert_eq!(persister_for("memberships").lower(&query).unwrap(), before);
    }

    #[test]
    fn test_count_alias_follows_casing() {
        let metadata = StaticMetadata::new().with_entity(
            EntityDefinition::new("memberships", "memberships").identifier(&["user_id", "group_id"]),
        );
        let persister =
            Persister::new(Arc::new(metadata), "memberships").with_casing(ResultCasing::Upper);
        let count = persister
            .to_count_form(&Query::from_parts(
                ConditionExpression::always(),
                OrderSpec::new(),
                None,
                None,
            ))
            .unwrap();
        assert!(count.sql().starts_with("SELECT COUNT(*) AS DCTRN_COUNT FROM"));
        assert_eq!(count.result_shape().unwrap().columns[0].column, "DCTRN_COUNT");
    }

    #[test]
    fn test_missing_identity_is_unsupported() {
        let err = persister_for("events")
            .to_count_form(&Query::from_parts(
                ConditionExpression::always(),
                OrderSpec::new(),
                None,
                None,
            ))
            .unwrap_err();
        assert_eq!(err, QueryError::UnsupportedEntity("events".into()));
    }
}
