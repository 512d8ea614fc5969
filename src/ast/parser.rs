/// Query-language text → condition AST parser.
///
/// Tokenizing and precedence are delegated to `sqlparser`: the text is parsed
/// as the WHERE clause (plus optional ORDER BY / LIMIT / OFFSET) of a dummy
/// SELECT, and the resulting expression tree is narrowed down to the
/// comparisons and connectives the condition AST can represent.
use std::sync::Arc;

use sqlparser::ast::{self as sp, Spanned};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser as SqlParser, ParserError};
use sqlparser::tokenizer::Location;
use tracing::debug;

use super::query::Query;
use super::types::{ConditionExpression, Direction, FieldPath, Operator, OrderSpec, Value};
use crate::error::{QueryError, Result};
use crate::persister::Persister;

const PREFIX: &str = "SELECT * FROM t WHERE ";

/// Parses condition text, resolving field references through a persister.
#[derive(Debug, Clone)]
pub struct QueryLanguageParser {
    persister: Arc<Persister>,
}

impl QueryLanguageParser {
    pub fn new(persister: Arc<Persister>) -> Self {
        Self { persister }
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    pub fn set_persister(&mut self, persister: Arc<Persister>) {
        self.persister = persister;
    }

    /// Parse a bare condition. Blank text is the always-true condition.
    pub fn parse_condition(&self, text: &str) -> Result<ConditionExpression> {
        if text.trim().is_empty() {
            return Ok(ConditionExpression::always());
        }
        let (query, selection) = parse_statement(text)?;
        if query.order_by.is_some() || query.limit.is_some() || query.offset.is_some() {
            return Err(QueryError::SyntaxError {
                position: keyword_position(text, &["ORDER", "LIMIT", "OFFSET"]),
                expected: "end of condition".into(),
            });
        }
        let condition = self.convert_condition(text, selection)?;
        debug!(entity = self.persister.entity(), %condition, "parsed condition");
        Ok(condition)
    }

    /// Parse a condition with optional ORDER BY, LIMIT and OFFSET.
    pub fn parse(&self, text: &str) -> Result<Query> {
        if text.trim().is_empty() {
            return Ok(Query::from_parts(
                ConditionExpression::always(),
                OrderSpec::new(),
                None,
                None,
            ));
        }
        let (query, selection) = parse_statement(text)?;
        let condition = self.convert_condition(text, selection)?;

        let mut order = OrderSpec::new();
        for item in query.order_by.map(|ob| ob.exprs).unwrap_or_default() {
            let field = self.field_path(text, &item.expr)?;
            let direction = match item.asc {
                Some(false) => Direction::Desc,
                _ => Direction::Asc,
            };
            order.push(field, direction);
        }

        let limit = query
            .limit
            .as_ref()
            .map(|expr| unsigned(text, expr))
            .transpose()?;
        let offset = query
            .offset
            .as_ref()
            .map(|o| unsigned(text, &o.value))
            .transpose()?;

        debug!(entity = self.persister.entity(), %condition, ?limit, ?offset, "parsed query text");
        Ok(Query::from_parts(condition, order, limit, offset))
    }

    fn convert_condition(&self, text: &str, expr: sp::Expr) -> Result<ConditionExpression> {
        match expr {
            sp::Expr::BinaryOp {
                left,
                op: sp::BinaryOperator::And,
                right,
            } => Ok(ConditionExpression::and([
                self.convert_condition(text, *left)?,
                self.convert_condition(text, *right)?,
            ])),
            sp::Expr::BinaryOp {
                left,
                op: sp::BinaryOperator::Or,
                right,
            } => Ok(ConditionExpression::or([
                self.convert_condition(text, *left)?,
                self.convert_condition(text, *right)?,
            ])),
            sp::Expr::Nested(inner) => self.convert_condition(text, *inner),
            sp::Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    sp::BinaryOperator::Eq => Operator::Eq,
                    sp::BinaryOperator::NotEq => Operator::NotEq,
                    sp::BinaryOperator::Lt => Operator::Lt,
                    sp::BinaryOperator::LtEq => Operator::LtEq,
                    sp::BinaryOperator::Gt => Operator::Gt,
                    sp::BinaryOperator::GtEq => Operator::GtEq,
                    _ => {
                        return Err(QueryError::SyntaxError {
                            position: operator_position(text, &left),
                            expected: "a comparison".into(),
                        })
                    }
                };
                let value = literal(text, &right)?;
                self.comparison(text, &left, op, value)
            }
            sp::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let op = if negated { Operator::NotLike } else { Operator::Like };
                let value = literal(text, &pattern)?;
                self.comparison(text, &expr, op, value)
            }
            sp::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let op = if negated { Operator::NotIn } else { Operator::In };
                let items = list
                    .iter()
                    .map(|item| literal(text, item))
                    .collect::<Result<Vec<_>>>()?;
                self.comparison(text, &expr, op, Value::List(items))
            }
            sp::Expr::IsNull(expr) => self.comparison(text, &expr, Operator::Eq, Value::Null),
            sp::Expr::IsNotNull(expr) => {
                self.comparison(text, &expr, Operator::NotEq, Value::Null)
            }
            other => Err(not_a_comparison(text, &other)),
        }
    }

    fn comparison(
        &self,
        text: &str,
        target: &sp::Expr,
        op: Operator,
        value: Value,
    ) -> Result<ConditionExpression> {
        let name = field_name(text, target)?;
        let mapping = self.persister.resolve_field(&name)?;
        mapping.comparison(&name, op, value)
    }

    fn field_path(&self, text: &str, expr: &sp::Expr) -> Result<FieldPath> {
        let name = field_name(text, expr)?;
        Ok(self.persister.resolve_field(&name)?.path)
    }
}

/// Parse `text` as the tail of a dummy SELECT and hand back the query and its
/// WHERE expression.
fn parse_statement(text: &str) -> Result<(sp::Query, sp::Expr)> {
    let wrapped = format!("{}{}", PREFIX, text);
    let dialect = PostgreSqlDialect {};
    let mut statements =
        SqlParser::parse_sql(&dialect, &wrapped).map_err(|e| syntax_error(text, &wrapped, e))?;

    if statements.len() != 1 {
        return Err(QueryError::SyntaxError {
            position: text.find(';').unwrap_or(text.len()),
            expected: "end of input".into(),
        });
    }
    let query = match statements.remove(0) {
        sp::Statement::Query(query) => *query,
        _ => return Err(unexpected_shape()),
    };
    let select = match query.body.as_ref() {
        sp::SetExpr::Select(select) => select.as_ref().clone(),
        _ => return Err(unexpected_shape()),
    };
    let grouped = match &select.group_by {
        sp::GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
        sp::GroupByExpr::All(_) => true,
    };
    if grouped || select.having.is_some() {
        return Err(QueryError::SyntaxError {
            position: keyword_position(text, &["GROUP", "HAVING"]),
            expected: "end of condition".into(),
        });
    }
    let trailing = query.fetch.is_some()
        || !query.locks.is_empty()
        || !query.limit_by.is_empty()
        || query.for_clause.is_some()
        || query.settings.is_some()
        || query.format_clause.is_some()
        || select.qualify.is_some()
        || !select.named_window.is_empty()
        || !select.cluster_by.is_empty()
        || !select.distribute_by.is_empty()
        || !select.sort_by.is_empty()
        || select.connect_by.is_some();
    if trailing {
        return Err(QueryError::SyntaxError {
            position: keyword_position(
                text,
                &[
                    "FETCH", "FOR", "LIMIT", "SETTINGS", "FORMAT", "QUALIFY", "WINDOW", "CLUSTER",
                    "DISTRIBUTE", "SORT", "CONNECT", "START",
                ],
            ),
            expected: "end of condition".into(),
        });
    }
    let selection = select.selection.ok_or_else(unexpected_shape)?;
    Ok((query, selection))
}

fn unexpected_shape() -> QueryError {
    QueryError::SyntaxError {
        position: 0,
        expected: "a condition".into(),
    }
}

fn not_a_comparison(text: &str, expr: &sp::Expr) -> QueryError {
    QueryError::SyntaxError {
        position: locate(text, expr),
        expected: "a comparison".into(),
    }
}

/// Field name of a comparison target; an alias qualifier is dropped.
fn field_name(text: &str, expr: &sp::Expr) -> Result<String> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(ident.value.clone()),
        sp::Expr::CompoundIdentifier(parts) if parts.len() <= 2 => parts
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| field_expected(text, expr)),
        _ => Err(field_expected(text, expr)),
    }
}

fn field_expected(text: &str, expr: &sp::Expr) -> QueryError {
    QueryError::SyntaxError {
        position: locate(text, expr),
        expected: "a field reference".into(),
    }
}

fn literal(text: &str, expr: &sp::Expr) -> Result<Value> {
    let value = match expr {
        sp::Expr::Value(value) => match value {
            sp::Value::Null => Some(Value::Null),
            sp::Value::Boolean(b) => Some(Value::Bool(*b)),
            sp::Value::Number(n, _) => number(n, false),
            sp::Value::SingleQuotedString(s) | sp::Value::EscapedStringLiteral(s) => {
                Some(Value::Text(s.clone()))
            }
            _ => None,
        },
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Minus,
            expr: inner,
        } => match inner.as_ref() {
            sp::Expr::Value(sp::Value::Number(n, _)) => number(n, true),
            _ => None,
        },
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Plus,
            expr: inner,
        } => match inner.as_ref() {
            sp::Expr::Value(sp::Value::Number(n, _)) => number(n, false),
            _ => None,
        },
        _ => None,
    };
    match value {
        Some(Value::Float(f)) if !f.is_finite() => Err(QueryError::SyntaxError {
            position: locate(text, expr),
            expected: "a finite number".into(),
        }),
        Some(value) => Ok(value),
        None => Err(QueryError::SyntaxError {
            position: locate(text, expr),
            expected: "a literal".into(),
        }),
    }
}

fn number(n: &str, negative: bool) -> Option<Value> {
    let signed = if negative { format!("-{}", n) } else { n.to_string() };
    signed
        .parse::<i64>()
        .map(Value::Integer)
        .ok()
        .or_else(|| signed.parse::<f64>().ok().map(Value::Float))
}

fn unsigned(text: &str, expr: &sp::Expr) -> Result<u64> {
    match expr {
        sp::Expr::Value(sp::Value::Number(n, _)) => n.parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| QueryError::SyntaxError {
        position: locate(text, expr),
        expected: "a non-negative integer".into(),
    })
}

/// Byte offset of an expression inside the original text.
///
/// Uses the source span when sqlparser recorded one (literals carry none) and
/// otherwise searches for the rendered expression.
fn locate(text: &str, expr: &sp::Expr) -> usize {
    let span = expr.span();
    if span.start.line > 0 {
        return input_offset(text, span.start);
    }
    text.find(&expr.to_string()).unwrap_or(0)
}

/// Offset of the operator following `left`: the first non-blank byte after it.
fn operator_position(text: &str, left: &sp::Expr) -> usize {
    let end = left.span().end;
    if end.line == 0 {
        return locate(text, left);
    }
    let after = input_offset(text, end);
    let rest = &text[after..];
    after + (rest.len() - rest.trim_start().len())
}

/// Translate a location in the wrapped statement to a byte offset in `text`.
fn input_offset(text: &str, location: Location) -> usize {
    let wrapped = format!("{}{}", PREFIX, text);
    byte_offset(&wrapped, location.line as usize, location.column as usize)
        .saturating_sub(PREFIX.len())
        .min(text.len())
}

/// Earliest whole-word occurrence of any keyword, or end of input.
fn keyword_position(text: &str, keywords: &[&str]) -> usize {
    let upper = text.to_ascii_uppercase();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    keywords
        .iter()
        .filter_map(|kw| {
            upper.match_indices(kw).map(|(i, _)| i).find(|&i| {
                let end = i + kw.len();
                (i == 0 || !is_word(upper.as_bytes()[i - 1]))
                    && (end == upper.len() || !is_word(upper.as_bytes()[end]))
            })
        })
        .min()
        .unwrap_or(text.len())
}

/// Map a sqlparser error onto the input text.
///
/// sqlparser reports `Expected: X, found: Y at Line: L, Column: C` against
/// the wrapped statement; the location is translated back to a byte offset
/// in `text`. Errors without a location happened at end of input.
fn syntax_error(text: &str, wrapped: &str, err: ParserError) -> QueryError {
    let message = match err {
        ParserError::TokenizerError(msg) | ParserError::ParserError(msg) => msg,
        ParserError::RecursionLimitExceeded => {
            return QueryError::SyntaxError {
                position: 0,
                expected: "a less deeply nested condition".into(),
            }
        }
    };

    let (message, location) = match message.rfind(" at Line: ") {
        Some(idx) => (&message[..idx], parse_location(&message[idx..])),
        None => (message.as_str(), None),
    };
    let position = location
        .map(|(line, column)| {
            byte_offset(wrapped, line, column)
                .saturating_sub(PREFIX.len())
                .min(text.len())
        })
        .unwrap_or(text.len());

    let expected = message
        .strip_prefix("Expected: ")
        .map(|rest| rest.split(", found:").next().unwrap_or(rest))
        .unwrap_or(message)
        .trim()
        .to_string();

    QueryError::SyntaxError { position, expected }
}

/// Parse `" at Line: L, Column: C"`.
fn parse_location(suffix: &str) -> Option<(usize, usize)> {
    let rest = suffix.trim_start().strip_prefix("at Line: ")?;
    let (line, column) = rest.split_once(", Column: ")?;
    let column: String = column.chars().take_while(char::is_ascii_digit).collect();
    Some((line.trim().parse().ok()?, column.parse().ok()?))
}

/// Byte offset of a 1-based (line, column) pair, columns counted in chars.
fn byte_offset(s: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (i, l) in s.split_inclusive('\n').enumerate() {
        if i + 1 == line {
            return offset
                + l.char_indices()
                    .nth(column.saturating_sub(1))
                    .map_or(l.len(), |(idx, _)| idx);
        }
        offset += l.len();
    }
    s.len()
}
