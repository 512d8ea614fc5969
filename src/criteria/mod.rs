//! Criteria-map parsing, field resolution and query composition.
pub mod composer;
pub mod metadata;
pub mod parser;
pub mod resolver;

pub use composer::QueryComposer;
pub use metadata::{
    EntityDefinition, FieldDefinition, FieldMapping, MetadataProvider, StaticMetadata, TableName,
    ValueTransform,
};
pub use parser::{Criteria, CriteriaParser, OrderBy, DEFAULT_RESERVED_KEY};
pub use resolver::FieldResolver;
