//! Data models for sqlcore.
//!
//! This module re-exports the value, query and entity mapping types used
//! throughout the crate.

pub mod entity;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use entity::{
    Encryption, Entity, EntityMapping, EntityMeta, FieldMapping, FieldMeta, MetaCache,
};
pub use query::{
    Aggregate, AggregateType, Condition, ConditionGroup, Logic, Operator, OrderBy, Query,
    QueryBuilder, SubQuery,
};
pub use value::{BatchResult, ExecuteResult, FromSqlValue, Row, SqlValue};
