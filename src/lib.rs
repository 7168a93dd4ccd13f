//! sqlcore
//!
//! A database access core: entity-to-table mapping, a query model rendered
//! through vendor dialects, a bounded resource pool, and an executor with
//! transient-failure retry, SQL metrics and statement interceptors. Named data
//! sources live in a [`DataSourceRegistry`](db::DataSourceRegistry).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DataSourceConfig};
pub use error::{DbError, DbResult, ErrorKind};
