//! Logical field name → backend path resolution with a per-entity cache.
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::trace;

use super::metadata::{FieldMapping, MetadataProvider};
use crate::error::{QueryError, Result};

/// Resolves logical field names through a metadata provider.
///
/// Results are memoized per entity type. The cache is append-only: entries
/// are inserted once and never change, so readers only ever contend with the
/// occasional first-time insert.
#[derive(Debug, Default)]
pub struct FieldResolver {
    cache: RwLock<HashMap<String, HashMap<String, FieldMapping>>>,
}

impl FieldResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &self,
        metadata: &dyn MetadataProvider,
        entity: &str,
        field: &str,
    ) -> Result<FieldMapping> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(mapping) = cache.get(entity).and_then(|fields| fields.get(field)) {
                return Ok(mapping.clone());
            }
        }

        let mapping = metadata
            .field_mapping(entity, field)
            .ok_or_else(|| QueryError::UnknownField {
                entity: entity.to_string(),
                field: field.to_string(),
            })?;
        trace!(entity, field, column = mapping.path.column(), "resolved field");

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache
            .entry(entity.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(mapping);
        Ok(entry.clone())
    }

    /// Number of cached resolutions for `entity`.
    pub fn cached_fields(&self, entity: &str) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .map_or(0, HashMap::len)
    }
}
