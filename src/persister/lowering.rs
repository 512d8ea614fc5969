//! Condition AST → SQL AST lowering.
use tracing::debug;

use super::{NativeQuery, Persister, ROOT_ALIAS};
use crate::ast::sql::{
    BinaryOperator, Expression, Literal, OrderByExpr, SelectItem, SelectQuery, TableRef,
};
use crate::ast::{ConditionExpression, Direction, FieldPath, Operator, OrderSpec, Query, Value};
use crate::error::{QueryError, Result};

impl Persister {
    /// Translate `query` into an executable SELECT.
    ///
    /// Pure: the same query always lowers to the same native form.
    pub fn lower(&self, query: &Query) -> Result<NativeQuery> {
        let select = self.select_for(query)?;
        let native = NativeQuery::new(select);
        debug!(entity = %self.entity, sql = %native.sql, "lowered query");
        Ok(native)
    }

    pub(crate) fn select_for(&self, query: &Query) -> Result<SelectQuery> {
        let filter = match query.condition() {
            Some(condition) => lower_condition(condition)?,
            None => None,
        };
        let order_by = query.order().map(lower_order).unwrap_or_default();

        Ok(SelectQuery {
            distinct: false,
            projections: vec![SelectItem::QualifiedWildcard(ROOT_ALIAS.to_string())],
            from: Some(self.root_table()?),
            filter,
            order_by,
            limit: query.limit(),
            offset: query.offset(),
        })
    }

    pub(crate) fn root_table(&self) -> Result<TableRef> {
        let table = self.table()?;
        Ok(TableRef::Table {
            schema: table.schema,
            name: table.name,
            alias: Some(ROOT_ALIAS.to_string()),
        })
    }
}

pub(crate) fn column(path: &FieldPath) -> Expression {
    Expression::column(Some(ROOT_ALIAS), path.column())
}

/// Lower a condition; the always-true condition lowers to no filter at all.
pub(crate) fn lower_condition(condition: &ConditionExpression) -> Result<Option<Expression>> {
    if condition.is_trivial() {
        return Ok(None);
    }
    lower_expr(condition).map(Some)
}

fn lower_expr(condition: &ConditionExpression) -> Result<Expression> {
    match condition {
        ConditionExpression::Comparison { field, op, value } => lower_comparison(field, *op, value),
        ConditionExpression::And(children) => fold(children, BinaryOperator::And, true),
        ConditionExpression::Or(children) => fold(children, BinaryOperator::Or, false),
        ConditionExpression::Raw(fragment) => {
            Ok(Expression::Nested(Box::new(Expression::Raw(fragment.clone()))))
        }
    }
}

/// Join children with `op`. An empty list lowers to its identity element.
fn fold(children: &[ConditionExpression], op: BinaryOperator, identity: bool) -> Result<Expression> {
    let mut lowered = children.iter().map(|child| -> Result<Expression> {
        let expr = lower_expr(child)?;
        Ok(match child {
            ConditionExpression::And(c) | ConditionExpression::Or(c) if c.len() > 1 => {
                Expression::Nested(Box::new(expr))
            }
            _ => expr,
        })
    });
    let Some(first) = lowered.next() else {
        return Ok(Expression::Literal(Literal::Boolean(identity)));
    };
    lowered.try_fold(first?, |acc, next| Ok(Expression::binary(acc, op, next?)))
}

fn lower_comparison(field: &FieldPath, op: Operator, value: &Value) -> Result<Expression> {
    let target = column(field);
    match (op, value) {
        (Operator::Eq, Value::Null) => Ok(Expression::IsNull {
            expr: Box::new(target),
            negated: false,
        }),
        (Operator::NotEq, Value::Null) => Ok(Expression::IsNull {
            expr: Box::new(target),
            negated: true,
        }),
        (Operator::In | Operator::NotIn, Value::List(items)) => {
            let negated = op == Operator::NotIn;
            if items.is_empty() {
                // `x IN ()` is not valid SQL; an empty set matches nothing.
                return Ok(Expression::Literal(Literal::Boolean(negated)));
            }
            let list = items
                .iter()
                .map(|item| lower_literal(field, item))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expression::InList {
                expr: Box::new(target),
                list,
                negated,
            })
        }
        (op, value) => {
            let op = match op {
                Operator::Eq => BinaryOperator::Eq,
                Operator::NotEq => BinaryOperator::NotEq,
                Operator::Lt => BinaryOperator::Lt,
                Operator::LtEq => BinaryOperator::LtEq,
                Operator::Gt => BinaryOperator::Gt,
                Operator::GtEq => BinaryOperator::GtEq,
                Operator::Like => BinaryOperator::Like,
                Operator::NotLike => BinaryOperator::NotLike,
                Operator::In | Operator::NotIn => {
                    return Err(QueryError::invalid_value(
                        field.column(),
                        format!("{} requires a list value", op),
                    ))
                }
            };
            Ok(Expression::binary(target, op, lower_literal(field, value)?))
        }
    }
}

fn lower_literal(field: &FieldPath, value: &Value) -> Result<Expression> {
    let literal = match value {
        Value::Null => Literal::Null,
        Value::Bool(b) => Literal::Boolean(*b),
        Value::Integer(i) => Literal::Integer(*i),
        Value::Float(f) => Literal::Float(*f),
        Value::Text(s) => Literal::String(s.clone()),
        Value::List(_) => {
            return Err(QueryError::invalid_value(
                field.column(),
                "nested lists cannot be lowered",
            ))
        }
    };
    Ok(Expression::Literal(literal))
}

fn lower_order(order: &OrderSpec) -> Vec<OrderByExpr> {
    order
        .items()
        .iter()
        .map(|item| OrderByExpr {
            expr: column(&item.field),
            asc: Some(item.direction == Direction::Asc),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::query::Query;
    use crate::persister::test_support::users_persister;

    fn cmp(field: &str, op: Operator, value: impl Into<Value>) -> ConditionExpression {
        ConditionExpression::comparison(FieldPath::new(field), Some(op), value)
    }

    fn sql(condition: ConditionExpression, order: OrderSpec, limit: Option<u64>, offset: Option<u64>) -> String {
        let query = Query::from_parts(condition, order, limit, offset);
        users_persister().lower(&query).unwrap().sql
    }

    #[test]
    fn test_lower_full_query() {
        let mut order = OrderSpec::new();
        order.push(FieldPath::new("name"), Direction::Asc);
        let condition = ConditionExpression::and([
            cmp("status", Operator::Eq, "active"),
            cmp("age", Operator::Gt, 18),
        ]);
        assert_eq!(
            sql(condition, order, Some(10), Some(0)),
            "SELECT e.* FROM users e WHERE e.status = 'active' AND e.age > 18 ORDER BY e.name ASC LIMIT 10 OFFSET 0"
        );
    }

    #[test]
    fn test_trivial_condition_has_no_where() {
        assert_eq!(
            sql(ConditionExpression::always(), OrderSpec::new(), None, None),
            "SELECT e.* FROM users e"
        );
    }

    #[test]
    fn test_or_inside_and_is_parenthesized() {
        let condition = ConditionExpression::and([
            ConditionExpression::or([cmp("age", Operator::Lt, 13), cmp("age", Operator::Gt, 65)]),
            cmp("status", Operator::Eq, "active"),
        ]);
        assert_eq!(
            sql(condition, OrderSpec::new(), None, None),
            "SELECT e.* FROM users e WHERE (e.age < 13 OR e.age > 65) AND e.status = 'active'"
        );
    }

    #[test]
    fn test_null_and_membership() {
        let condition = ConditionExpression::and([
            cmp("email", Operator::Eq, Value::Null),
            cmp("status", Operator::NotIn, Value::List(vec!["banned".into(), "gone".into()])),
        ]);
        assert_eq!(
            sql(condition, OrderSpec::new(), None, None),
            "SELECT e.* FROM users e WHERE e.email IS NULL AND e.status NOT IN ('banned', 'gone')"
        );
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let condition = cmp("status", Operator::In, Value::List(vec![]));
        assert_eq!(
            sql(condition, OrderSpec::new(), None, None),
            "SELECT e.* FROM users e WHERE FALSE"
        );
    }

    #[test]
    fn test_raw_fragment_is_verbatim() {
        let condition = ConditionExpression::and([
            ConditionExpression::raw("e.score > 100"),
            cmp("status", Operator::Eq, "active"),
        ]);
        assert_eq!(
            sql(condition, OrderSpec::new(), None, None),
            "SELECT e.* FROM users e WHERE (e.score > 100) AND e.status = 'active'"
        );
    }

    #[test]
    fn test_lowering_is_idempotent() {
        let query = Query::from_parts(cmp("age", Operator::GtEq, 21), OrderSpec::new(), Some(3), None);
        let persister = users_persister();
        assert_eq!(persister.lower(&query).unwrap(), persister.lower(&query).unwrap());
    }

    #[test]
    fn test_unknown_table_is_unsupported() {
        let persister = crate::persister::test_support::persister_for("ghosts");
        let query = Query::from_parts(ConditionExpression::always(), OrderSpec::new(), None, None);
        assert_eq!(
            persister.lower(&query).unwrap_err(),
            QueryError::UnsupportedEntity("ghosts".into())
        );
    }
}
