//! PostgreSQL SELECT AST that persisters lower into.
//!
//! Only the subset a lowered criteria query can produce is modelled: a single
//! root table (or a derived table for count wrappers), a WHERE filter,
//! ordering and pagination.

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub filter: Option<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `alias.*`
    QualifiedWildcard(String),
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Table reference in FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// Simple table: `schema.table alias`
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    /// Derived table: `(SELECT ...) alias`
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
}

/// Expression tree. Recursive to support nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference: `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    Literal(Literal),
    /// Binary operation: `left op right`.
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Aggregate call, e.g. `COUNT(DISTINCT e.id)`.
    Aggregate {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    /// `expr [NOT] IN (list)`.
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    /// `expr IS [NOT] NULL`.
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// Wildcard `*` (used in COUNT(*)).
    Wildcard,
    /// Parenthesized expression.
    Nested(Box<Expression>),
    /// Verbatim SQL fragment.
    Raw(String),
}

/// Literal values in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // String
    Like,
    NotLike,
}

/// ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
}

impl Expression {
    pub fn column(table: Option<&str>, name: &str) -> Self {
        Expression::Column {
            table: table.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_select_query() {
        let q = SelectQuery::default();
        assert!(!q.distinct);
        assert!(q.projections.is_empty());
        assert!(q.from.is_none());
        assert!(q.filter.is_none());
        assert!(q.limit.is_none());
    }

    #[test]
    fn test_query_clone() {
        let q = SelectQuery {
            distinct: true,
            projections: vec![SelectItem::Wildcard],
            from: Some(TableRef::Table {
                schema: None,
                name: "users".into(),
                alias: Some("e".into()),
            }),
            ..Default::default()
        };
        assert_eq!(q, q.clone());
    }

    #[test]
    fn test_literal_equality() {
        assert_eq!(Literal::Null, Literal::Null);
        assert_eq!(Literal::Boolean(true), Literal::Boolean(true));
        assert_ne!(Literal::Integer(1), Literal::Integer(2));
    }
}
