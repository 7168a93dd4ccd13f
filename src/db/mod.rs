//! Database access layer.
//!
//! This module provides:
//! - Vendor dialects and dialect-aware SQL generation
//! - A generic bounded resource pool and the sqlx connection provider
//! - Statement execution with retry, interceptors and SQL metrics
//! - Row decoding into vendor-neutral values
//! - The registry of named data sources
//! - Dispatch and entity macros for reducing code duplication

pub mod dialect;
pub mod executor;
pub mod interceptor;
#[macro_use]
pub mod macros;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod sql;
pub mod types;

pub use dialect::{Dialect, Vendor, dialect_for, resolve_dialect};
pub use executor::SqlExecutor;
pub use interceptor::{InterceptorChain, SqlInterceptor};
pub use metrics::{MetricsOptions, MetricsSnapshot, SlowEntry, SqlMetrics};
pub use pool::{ClientProvider, PoolConfig, PoolStats, PooledClient, ResourcePool};
pub use provider::{BoxConnection, DbConnection, SqlConnection, SqlxConnection, SqlxProvider};
pub use registry::{DataSourceHolder, DataSourceRegistry, DataSourceSummary};
pub use retry::{RetryOptions, RetryPolicy};
pub use sql::{SqlGenerator, Statement};
