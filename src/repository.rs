//! Repository façade: criteria in, rows out.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::ast::sql::{BinaryOperator, Expression, Literal, OrderByExpr, SelectItem, SelectQuery};
use crate::ast::{Direction, FieldPath, Query, Value};
use crate::criteria::{Criteria, OrderBy, QueryComposer, DEFAULT_RESERVED_KEY};
use crate::error::{QueryError, Result};
use crate::persister::{ExecutionBackend, NativeQuery, Persister, ResultSet, Row, ROOT_ALIAS};

/// Whether the advanced (parser-driven) path is available.
#[derive(Debug, Clone)]
pub enum ParserConfig {
    Configured(QueryComposer),
    Unconfigured,
}

/// Input accepted by [`Repository::find_by_query`].
#[derive(Debug)]
pub enum QueryInput {
    Query(Query),
    Text(String),
}

impl From<Query> for QueryInput {
    fn from(query: Query) -> Self {
        QueryInput::Query(query)
    }
}

impl From<&str> for QueryInput {
    fn from(text: &str) -> Self {
        QueryInput::Text(text.to_string())
    }
}

/// Entity repository over one persister and one execution backend.
pub struct Repository<B> {
    persister: Arc<Persister>,
    backend: B,
    parser: ParserConfig,
}

impl<B: ExecutionBackend> Repository<B> {
    /// A repository without a parser; only the legacy path is available.
    pub fn new(persister: Arc<Persister>, backend: B) -> Self {
        Self {
            persister,
            backend,
            parser: ParserConfig::Unconfigured,
        }
    }

    pub fn with_parser(mut self, composer: QueryComposer) -> Self {
        self.set_parser(composer);
        self
    }

    /// Install a composer, pointing it at this repository's persister.
    pub fn set_parser(&mut self, mut composer: QueryComposer) {
        composer.set_persister(Arc::clone(&self.persister));
        self.parser = ParserConfig::Configured(composer);
    }

    pub fn parser(&self) -> &ParserConfig {
        &self.parser
    }

    /// True when queries go through the criteria/text parsers.
    pub fn is_advanced(&self) -> bool {
        matches!(self.parser, ParserConfig::Configured(_))
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn find_by(
        &self,
        criteria: &Criteria,
        order_by: &OrderBy,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<ResultSet> {
        match &self.parser {
            ParserConfig::Configured(composer) => {
                let mut query = composer.compose(criteria, order_by, limit, offset)?;
                query.bind(Arc::clone(&self.persister))?;
                self.persister.execute(&self.backend, &mut query).await
            }
            ParserConfig::Unconfigured => {
                let native = self.legacy_select(criteria, order_by, limit, offset)?;
                Ok(self.backend.fetch_all(&native.sql).await?)
            }
        }
    }

    pub async fn find_one_by(&self, criteria: &Criteria, order_by: &OrderBy) -> Result<Row> {
        match &self.parser {
            ParserConfig::Configured(composer) => {
                let mut query = composer.compose(criteria, order_by, Some(1), None)?;
                query.bind(Arc::clone(&self.persister))?;
                self.persister.execute_one(&self.backend, &mut query).await
            }
            ParserConfig::Unconfigured => {
                let native = self.legacy_select(criteria, order_by, Some(1), None)?;
                Ok(self.backend.fetch_one(&native.sql).await?)
            }
        }
    }

    pub async fn count_by(&self, criteria: &Criteria) -> Result<i64> {
        let ParserConfig::Configured(composer) = &self.parser else {
            return Err(QueryError::MisconfiguredRepository(
                "count_by requires a configured parser".into(),
            ));
        };
        let mut query = composer.compose(criteria, &OrderBy::new(), None, None)?;
        query.bind(Arc::clone(&self.persister))?;
        let count = query.count_form()?;
        let total = self.persister.execute_scalar(&self.backend, &count).await?;
        debug!(entity = self.persister.entity(), total, "count_by");
        Ok(total)
    }

    /// Execute a prepared query, or parse and execute query text.
    pub async fn find_by_query(&self, input: QueryInput) -> Result<ResultSet> {
        let mut query = match input {
            QueryInput::Query(query) => query,
            QueryInput::Text(text) => match &self.parser {
                ParserConfig::Configured(composer) => composer.text_parser().parse(&text)?,
                ParserConfig::Unconfigured => {
                    return Err(QueryError::MisconfiguredRepository(
                        "query text requires a configured parser".into(),
                    ))
                }
            },
        };
        query.bind(Arc::clone(&self.persister))?;
        self.persister.execute(&self.backend, &mut query).await
    }

    /// Parser-less statement: plain equality on the mapped columns, no value
    /// coercion and no embedded base query. Fields must exist in the entity
    /// metadata; nothing a caller passes reaches the SQL unresolved.
    fn legacy_select(
        &self,
        criteria: &Criteria,
        order_by: &OrderBy,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<NativeQuery> {
        warn!(
            entity = self.persister.entity(),
            "no parser configured, using legacy criteria path"
        );
        if criteria.contains_key(DEFAULT_RESERVED_KEY) {
            return Err(QueryError::MisconfiguredRepository(format!(
                "criteria key {:?} holds a base query, which requires a configured parser",
                DEFAULT_RESERVED_KEY
            )));
        }

        let mut filter: Option<Expression> = None;
        for (field, value) in criteria {
            let target = column(&self.persister.resolve_field(field)?.path);
            let value = Value::from_json(value)
                .ok_or_else(|| QueryError::invalid_value(field.as_str(), "unsupported value"))?;
            let predicate = match value {
                Value::Null => Expression::IsNull {
                    expr: Box::new(target),
                    negated: false,
                },
                Value::List(items) if items.is_empty() => {
                    Expression::Literal(Literal::Boolean(false))
                }
                Value::List(items) => Expression::InList {
                    expr: Box::new(target),
                    list: items.into_iter().map(literal).collect(),
                    negated: false,
                },
                scalar => Expression::binary(target, BinaryOperator::Eq, literal(scalar)),
            };
            filter = Some(match filter {
                Some(acc) => Expression::binary(acc, BinaryOperator::And, predicate),
                None => predicate,
            });
        }

        let order_by = order_by
            .iter()
            .map(|(field, direction)| {
                let path = self.persister.resolve_field(field)?.path;
                let direction: Direction = direction.parse()?;
                Ok(OrderByExpr {
                    expr: column(&path),
                    asc: Some(direction == Direction::Asc),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(NativeQuery::new(SelectQuery {
            distinct: false,
            projections: vec![SelectItem::QualifiedWildcard(ROOT_ALIAS.to_string())],
            from: Some(self.persister.root_table()?),
            filter,
            order_by,
            limit,
            offset,
        }))
    }
}

fn column(path: &FieldPath) -> Expression {
    Expression::column(Some(ROOT_ALIAS), path.column())
}

fn literal(value: Value) -> Expression {
    Expression::Literal(match value {
        Value::Null | Value::List(_) => Literal::Null,
        Value::Bool(b) => Literal::Boolean(b),
        Value::Integer(i) => Literal::Integer(i),
        Value::Float(f) => Literal::Float(f),
        Value::Text(s) => Literal::String(s),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::persister::test_backend::MemoryBackend;
    use crate::persister::test_support::{persister_for, users_persister};

    fn criteria(value: serde_json::Value) -> Criteria {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn advanced(backend: MemoryBackend) -> Repository<MemoryBackend> {
        let persister = users_persister();
        Repository::new(Arc::clone(&persister), backend).with_parser(QueryComposer::new(persister))
    }

    #[tokio::test]
    async fn test_find_by_with_parser() {
        let repo = advanced(MemoryBackend::default());
        assert!(repo.is_advanced());
        repo.find_by(
            &criteria(json!({"status": "active", "age": {"op": ">", "value": 18}})),
            &OrderBy::from(vec![("name", "asc")]),
            Some(10),
            Some(0),
        )
        .await
        .unwrap();
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT e.* FROM users e WHERE e.status = 'active' AND e.age > 18 ORDER BY e.name ASC LIMIT 10 OFFSET 0"]
        );
    }

    #[tokio::test]
    async fn test_find_by_with_base_query() {
        let repo = advanced(MemoryBackend::default());
        repo.find_by(
            &criteria(json!({"query": "score > 100", "status": "active"})),
            &OrderBy::new(),
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT e.* FROM users e WHERE e.score > 100 AND e.status = 'active'"]
        );
    }

    #[tokio::test]
    async fn test_find_one_by_limits_to_one() {
        let backend = MemoryBackend::with_rows(vec![Row::new().with("id", 7)]);
        let repo = advanced(backend);
        let row = repo
            .find_one_by(&criteria(json!({"email": "A@B.C"})), &OrderBy::new())
            .await
            .unwrap();
        assert_eq!(row.get("id"), Some(&Value::Integer(7)));
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT e.* FROM users e WHERE e.email = 'a@b.c' LIMIT 1"]
        );
    }

    #[tokio::test]
    async fn test_count_by_composite_entity() {
        let persister = persister_for("memberships");
        let backend = MemoryBackend {
            scalar: 3,
            ..MemoryBackend::default()
        };
        let repo = Repository::new(Arc::clone(&persister), backend)
            .with_parser(QueryComposer::new(persister));
        let total = repo.count_by(&criteria(json!({"role": "owner"}))).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT COUNT(*) AS dctrn_count FROM (SELECT DISTINCT e.user_id, e.group_id FROM memberships e WHERE e.role = 'owner') dctrn_result"]
        );
    }

    #[tokio::test]
    async fn test_find_by_query_text() {
        let repo = advanced(MemoryBackend::default());
        repo.find_by_query("age < 30 ORDER BY age DESC LIMIT 5".into())
            .await
            .unwrap();
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT e.* FROM users e WHERE e.age < 30 ORDER BY e.age DESC LIMIT 5"]
        );
    }

    #[tokio::test]
    async fn test_find_by_query_rejects_bound_query() {
        let repo = advanced(MemoryBackend::default());
        let mut query = Query::new();
        query.bind(users_persister()).unwrap();
        assert_eq!(
            repo.find_by_query(QueryInput::Query(query)).await.unwrap_err(),
            QueryError::AlreadyBound
        );
    }

    #[tokio::test]
    async fn test_legacy_path() {
        let repo = Repository::new(users_persister(), MemoryBackend::default());
        assert!(!repo.is_advanced());
        repo.find_by(
            &criteria(json!({"email": "A@B.C", "name": null, "age": [30, 40]})),
            &OrderBy::from(vec![("age", "DESC")]),
            Some(2),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT e.* FROM users e WHERE e.email = 'A@B.C' AND e.name IS NULL AND e.age IN (30, 40) ORDER BY e.age DESC LIMIT 2"]
        );
    }

    #[tokio::test]
    async fn test_legacy_path_rejects_unmapped_names() {
        let repo = Repository::new(users_persister(), MemoryBackend::default());
        assert_eq!(
            repo.find_by(
                &criteria(json!({"id IS NOT NULL OR e.id": 1})),
                &OrderBy::new(),
                None,
                None
            )
            .await
            .unwrap_err(),
            QueryError::UnknownField {
                entity: "users".into(),
                field: "id IS NOT NULL OR e.id".into()
            }
        );
        assert!(matches!(
            repo.find_one_by(
                &criteria(json!({"status": "active"})),
                &OrderBy::from(vec![("name; DROP TABLE users --", "asc")])
            )
            .await,
            Err(QueryError::UnknownField { .. })
        ));
        assert!(repo.backend().statements().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_path_rejects_base_query() {
        let repo = Repository::new(users_persister(), MemoryBackend::default());
        assert!(matches!(
            repo.find_by(
                &criteria(json!({"query": "age > 1", "status": "active"})),
                &OrderBy::new(),
                None,
                None
            )
            .await,
            Err(QueryError::MisconfiguredRepository(_))
        ));
        assert!(repo.backend().statements().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_empty_list_matches_nothing() {
        let repo = Repository::new(users_persister(), MemoryBackend::default());
        repo.find_by(&criteria(json!({"status": []})), &OrderBy::new(), None, None)
            .await
            .unwrap();
        assert_eq!(
            repo.backend().statements(),
            vec!["SELECT e.* FROM users e WHERE FALSE"]
        );
    }

    #[tokio::test]
    async fn test_legacy_path_cannot_count_or_parse() {
        let repo = Repository::new(users_persister(), MemoryBackend::default());
        assert!(matches!(
            repo.count_by(&Criteria::new()).await,
            Err(QueryError::MisconfiguredRepository(_))
        ));
        assert!(matches!(
            repo.find_by_query("age > 1".into()).await,
            Err(QueryError::MisconfiguredRepository(_))
        ));
    }

    #[tokio::test]
    async fn test_set_parser_rewires_persister() {
        let mut repo = Repository::new(users_persister(), MemoryBackend::default());
        repo.set_parser(QueryComposer::new(persister_for("memberships")));
        match repo.parser() {
            ParserConfig::Configured(composer) => {
                assert!(Arc::ptr_eq(composer.persister(), repo.persister()));
                assert!(Arc::ptr_eq(composer.text_parser().persister(), repo.persister()));
            }
            ParserConfig::Unconfigured => panic!("parser not installed"),
        }
    }
}
