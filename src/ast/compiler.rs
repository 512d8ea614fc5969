/// SQL AST → PostgreSQL text compiler.
///
/// Persisters build a `SelectQuery` and hand it here to obtain the statement
/// sent to the backend.
use super::sql::*;

/// Compile a SELECT AST into a PostgreSQL SQL string.
pub fn compile(select: &SelectQuery) -> String {
    let mut parts = Vec::new();

    // SELECT [DISTINCT]
    let mut select_clause = String::from("SELECT ");
    if select.distinct {
        select_clause.push_str("DISTINCT ");
    }

    if select.projections.is_empty() {
        select_clause.push('*');
    } else {
        let items: Vec<String> = select.projections.iter().map(compile_select_item).collect();
        select_clause.push_str(&items.join(", "));
    }
    parts.push(select_clause);

    // FROM
    if let Some(ref from) = select.from {
        parts.push(format!("FROM {}", compile_table_ref(from)));
    }

    // WHERE
    if let Some(ref filter) = select.filter {
        parts.push(format!("WHERE {}", compile_expr(filter)));
    }

    // ORDER BY
    if !select.order_by.is_empty() {
        let orders: Vec<String> = select.order_by.iter().map(compile_order_by).collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    // LIMIT
    if let Some(limit) = select.limit {
        parts.push(format!("LIMIT {}", limit));
    }

    // OFFSET
    if let Some(offset) = select.offset {
        parts.push(format!("OFFSET {}", offset));
    }

    parts.join(" ")
}

fn compile_select_item(item: &SelectItem) -> String {
    match item {
        SelectItem::Wildcard => "*".to_string(),
        SelectItem::QualifiedWildcard(table) => format!("{}.*", table),
        SelectItem::Expression { expr, alias } => {
            let expr_str = compile_expr(expr);
            match alias {
                Some(a) => format!("{} AS {}", expr_str, a),
                None => expr_str,
            }
        }
    }
}

fn compile_table_ref(table: &TableRef) -> String {
    match table {
        TableRef::Table {
            schema,
            name,
            alias,
        } => {
            let mut s = match schema {
                Some(sc) => format!("{}.{}", sc, name),
                None => name.clone(),
            };
            if let Some(a) = alias {
                s.push_str(&format!(" {}", a));
            }
            s
        }
        TableRef::Subquery { query, alias } => {
            format!("({}) {}", compile(query), alias)
        }
    }
}

fn compile_expr(expr: &Expression) -> String {
    match expr {
        Expression::Column { table, name } => match table {
            Some(t) => format!("{}.{}", t, name),
            None => name.clone(),
        },
        Expression::Literal(lit) => compile_literal(lit),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::NotEq => "<>",
                BinaryOperator::Lt => "<",
                BinaryOperator::LtEq => "<=",
                BinaryOperator::Gt => ">",
                BinaryOperator::GtEq => ">=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
                BinaryOperator::Like => "LIKE",
                BinaryOperator::NotLike => "NOT LIKE",
            };
            format!("{} {} {}", compile_expr(left), op_str, compile_expr(right))
        }
        Expression::Aggregate {
            name,
            args,
            distinct,
        } => {
            let distinct_str = if *distinct { "DISTINCT " } else { "" };
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            format!("{}({}{})", name, distinct_str, args_str.join(", "))
        }
        Expression::InList {
            expr,
            list,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            let items: Vec<String> = list.iter().map(compile_expr).collect();
            format!(
                "{} {}IN ({})",
                compile_expr(expr),
                not_str,
                items.join(", ")
            )
        }
        Expression::IsNull { expr, negated } => {
            if *negated {
                format!("{} IS NOT NULL", compile_expr(expr))
            } else {
                format!("{} IS NULL", compile_expr(expr))
            }
        }
        Expression::Wildcard => "*".to_string(),
        Expression::Nested(expr) => format!("({})", compile_expr(expr)),
        Expression::Raw(sql) => sql.clone(),
    }
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{}", f),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn compile_order_by(order: &OrderByExpr) -> String {
    let mut s = compile_expr(&order.expr);
    match order.asc {
        Some(true) => s.push_str(" ASC"),
        Some(false) => s.push_str(" DESC"),
        None => {}
    }
    s
}
