//! Named data sources.
//!
//! Each registered name owns one [`DataSourceHolder`]: its pool, dialect,
//! metrics, retry policy and executor. Holders are created by
//! [`DataSourceRegistry::register`] and live until [`DataSourceRegistry::clear`]
//! (or [`remove`](DataSourceRegistry::remove)) closes them.
//!
//! Interceptors and the entity metadata cache are registry-wide and shared by
//! every executor the registry builds.

use crate::config::{DataSourceConfig, mask_url};
use crate::db::dialect::{Dialect, dialect_for};
use crate::db::executor::SqlExecutor;
use crate::db::interceptor::{InterceptorChain, SqlInterceptor};
use crate::db::metrics::SqlMetrics;
use crate::db::pool::{ClientProvider, PoolStats, ResourcePool};
use crate::db::provider::{BoxConnection, SqlxProvider};
use crate::db::retry::RetryPolicy;
use crate::error::{DbError, DbResult};
use crate::models::MetaCache;
use parking_lot::RwLock as SyncRwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Everything owned by one named data source.
#[derive(Debug)]
pub struct DataSourceHolder {
    config: DataSourceConfig,
    executor: SqlExecutor,
}

impl DataSourceHolder {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    pub fn executor(&self) -> &SqlExecutor {
        &self.executor
    }

    pub fn pool(&self) -> &ResourcePool<BoxConnection> {
        self.executor.pool()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        self.executor.dialect()
    }

    pub fn metrics(&self) -> &Arc<SqlMetrics> {
        self.executor.metrics()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.executor.retry_policy()
    }

    pub async fn close(&self) {
        self.executor.pool().close().await;
    }
}

/// Read-only view of a registered data source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSummary {
    pub name: String,
    /// Config with the URL password masked
    pub config: DataSourceConfig,
    pub is_default: bool,
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
pub struct DataSourceRegistry {
    holders: RwLock<HashMap<String, Arc<DataSourceHolder>>>,
    default_name: SyncRwLock<Option<String>>,
    interceptors: Arc<InterceptorChain>,
    meta_cache: Arc<MetaCache>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data source backed by [`SqlxProvider`].
    pub async fn register(&self, config: DataSourceConfig) -> DbResult<Arc<DataSourceHolder>> {
        let provider = SqlxProvider::new(config.url.clone(), config.query_timeout());
        self.register_with_provider(config, provider).await
    }

    /// Register a data source with a custom client provider.
    ///
    /// The first registered data source becomes the default.
    pub async fn register_with_provider<P>(
        &self,
        config: DataSourceConfig,
        provider: P,
    ) -> DbResult<Arc<DataSourceHolder>>
    where
        P: ClientProvider<Client = BoxConnection> + 'static,
    {
        config.validate()?;
        let name = config.name.clone();

        // Early check for an existing registration
        if self.holders.read().await.contains_key(&name) {
            return Err(DbError::config(format!(
                "data source '{}' is already registered",
                name
            )));
        }

        info!(
            datasource = %name,
            url = %mask_url(&config.url),
            provider = provider.provider_type(),
            "Registering data source"
        );

        let dialect = dialect_for(config.vendor()?);
        let pool = ResourcePool::new(name.clone(), provider, config.pool_config()).await?;
        let executor = SqlExecutor::new(pool, Arc::clone(&dialect))
            .with_metrics(Arc::new(SqlMetrics::new(config.metrics.clone())))
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_interceptors(Arc::clone(&self.interceptors))
            .with_meta_cache(Arc::clone(&self.meta_cache));
        let holder = Arc::new(DataSourceHolder { config, executor });

        // Re-check after async work to prevent TOCTOU race
        // If duplicate detected, return the holder so we can close it outside the lock
        let duplicate = {
            let mut holders = self.holders.write().await;
            if holders.contains_key(&name) {
                Some(holder.clone())
            } else {
                holders.insert(name.clone(), Arc::clone(&holder));
                None
            }
        };

        if let Some(duplicate) = duplicate {
            duplicate.close().await;
            return Err(DbError::config(format!(
                "data source '{}' is already registered",
                name
            )));
        }

        {
            let mut default_name = self.default_name.write();
            if default_name.is_none() {
                *default_name = Some(name.clone());
            }
        }

        info!(
            datasource = %name,
            dialect = %dialect.vendor(),
            "Data source registered"
        );
        Ok(holder)
    }

    pub async fn get(&self, name: &str) -> DbResult<Arc<DataSourceHolder>> {
        self.holders
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::config(format!("data source '{}' is not registered", name)))
    }

    pub async fn get_default(&self) -> DbResult<Arc<DataSourceHolder>> {
        let name = self
            .default_name()
            .ok_or_else(|| DbError::config("no default data source"))?;
        self.get(&name).await
    }

    pub fn default_name(&self) -> Option<String> {
        self.default_name.read().clone()
    }

    /// Point the default at another registered data source.
    pub async fn set_default(&self, name: &str) -> DbResult<()> {
        if !self.contains(name).await {
            return Err(DbError::config(format!(
                "data source '{}' is not registered",
                name
            )));
        }
        *self.default_name.write() = Some(name.to_string());
        info!(datasource = %name, "Default data source changed");
        Ok(())
    }

    /// Dialect of the default data source.
    pub async fn default_dialect(&self) -> DbResult<Arc<dyn Dialect>> {
        Ok(Arc::clone(self.get_default().await?.dialect()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.holders.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.holders.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.holders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every registration; never exposes pools or executors.
    pub async fn all(&self) -> Vec<DataSourceSummary> {
        let default_name = self.default_name();
        let mut summaries: Vec<DataSourceSummary> = self
            .holders
            .read()
            .await
            .values()
            .map(|holder| DataSourceSummary {
                name: holder.name().to_string(),
                config: holder.config.masked(),
                is_default: default_name.as_deref() == Some(holder.name()),
                pool: holder.pool().stats(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Close and forget one data source.
    pub async fn remove(&self, name: &str) -> DbResult<()> {
        let holder = self
            .holders
            .write()
            .await
            .remove(name)
            .ok_or_else(|| DbError::config(format!("data source '{}' is not registered", name)))?;
        {
            let mut default_name = self.default_name.write();
            if default_name.as_deref() == Some(name) {
                *default_name = None;
            }
        }
        holder.close().await;
        info!(datasource = %name, "Data source removed");
        Ok(())
    }

    /// Close every data source and empty the registry. Intended for shutdown.
    pub async fn clear(&self) {
        let drained: Vec<(String, Arc<DataSourceHolder>)> =
            self.holders.write().await.drain().collect();
        *self.default_name.write() = None;

        for (name, holder) in drained {
            info!(datasource = %name, "Closing data source");
            holder.close().await;
        }
        info!("All data sources closed");
    }

    /// Add an interceptor observing every executor of this registry.
    pub fn add_interceptor(&self, interceptor: Arc<dyn SqlInterceptor>) {
        self.interceptors.add(interceptor);
    }

    pub fn clear_interceptors(&self) {
        self.interceptors.clear();
    }

    pub fn interceptors(&self) -> &Arc<InterceptorChain> {
        &self.interceptors
    }

    pub fn meta_cache(&self) -> &Arc<MetaCache> {
        &self.meta_cache
    }
}
