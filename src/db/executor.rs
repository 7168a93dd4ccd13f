//! Statement execution with retry, metrics and interceptors.
//!
//! Every statement goes through the same attempt loop:
//! 1. borrow a client from the pool (pool failures propagate unchanged)
//! 2. notify interceptors, run the statement, record its cost
//! 3. return the client (broken clients are destroyed instead)
//! 4. on a transient failure, back off and try again while the retry policy allows
//!
//! The entity helpers (`insert`, `find_by_id`, `select`, ...) render SQL through
//! [`SqlGenerator`] with the data source's dialect and then run the same loop.

use crate::db::dialect::Dialect;
use crate::db::interceptor::InterceptorChain;
use crate::db::metrics::SqlMetrics;
use crate::db::pool::ResourcePool;
use crate::db::provider::BoxConnection;
use crate::db::retry::RetryPolicy;
use crate::db::sql::{SqlGenerator, Statement};
use crate::error::{DbError, DbResult, DriverError, translate};
use crate::models::{
    BatchResult, Entity, ExecuteResult, FromSqlValue, MetaCache, Query, Row, SqlValue,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One kind of driver call the attempt loop can repeat.
#[async_trait]
trait Call: Sync {
    type Output: Send;

    async fn call(
        &self,
        conn: &mut BoxConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Self::Output, DriverError>;
}

struct ExecuteCall<'a> {
    generated_key: Option<&'a str>,
}

#[async_trait]
impl Call for ExecuteCall<'_> {
    type Output = ExecuteResult;

    async fn call(
        &self,
        conn: &mut BoxConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ExecuteResult, DriverError> {
        conn.execute(sql, params, self.generated_key).await
    }
}

struct QueryCall;

#[async_trait]
impl Call for QueryCall {
    type Output = Vec<Row>;

    async fn call(
        &self,
        conn: &mut BoxConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, DriverError> {
        conn.query(sql, params).await
    }
}

/// Executes statements against one data source.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    pool: ResourcePool<BoxConnection>,
    dialect: Arc<dyn Dialect>,
    metrics: Arc<SqlMetrics>,
    retry: RetryPolicy,
    interceptors: Arc<InterceptorChain>,
    meta_cache: Arc<MetaCache>,
}

impl SqlExecutor {
    /// Create an executor with default metrics, retry policy and no interceptors.
    pub fn new(pool: ResourcePool<BoxConnection>, dialect: Arc<dyn Dialect>) -> Self {
        Self {
            pool,
            dialect,
            metrics: Arc::new(SqlMetrics::default()),
            retry: RetryPolicy::default(),
            interceptors: Arc::new(InterceptorChain::new()),
            meta_cache: Arc::new(MetaCache::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SqlMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interceptors(mut self, interceptors: Arc<InterceptorChain>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn with_meta_cache(mut self, meta_cache: Arc<MetaCache>) -> Self {
        self.meta_cache = meta_cache;
        self
    }

    pub fn pool(&self) -> &ResourcePool<BoxConnection> {
        &self.pool
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn metrics(&self) -> &Arc<SqlMetrics> {
        &self.metrics
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn interceptors(&self) -> &Arc<InterceptorChain> {
        &self.interceptors
    }

    pub fn meta_cache(&self) -> &Arc<MetaCache> {
        &self.meta_cache
    }

    pub fn generator(&self) -> SqlGenerator<'_> {
        SqlGenerator::new(self.dialect.as_ref())
    }

    /// Execute a write statement and return the affected row count.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<ExecuteResult> {
        self.run(sql, params, &ExecuteCall { generated_key: None })
            .await
    }

    /// Execute a write statement and read back the generated value of `key_column`.
    pub async fn execute_returning_key(
        &self,
        sql: &str,
        params: &[SqlValue],
        key_column: &str,
    ) -> DbResult<ExecuteResult> {
        self.run(
            sql,
            params,
            &ExecuteCall {
                generated_key: Some(key_column),
            },
        )
        .await
    }

    /// Execute one statement per parameter set, in order.
    ///
    /// Each set is a separate statement with its own retry budget. The first
    /// failure stops the batch and is returned.
    pub async fn execute_batch(
        &self,
        sql: &str,
        param_sets: &[Vec<SqlValue>],
        generated_key: Option<&str>,
    ) -> DbResult<BatchResult> {
        let mut result = BatchResult {
            counts: Vec::with_capacity(param_sets.len()),
            generated_keys: Vec::new(),
        };
        let call = ExecuteCall { generated_key };

        for params in param_sets {
            let outcome = self.run(sql, params, &call).await?;
            result.counts.push(outcome.rows_affected);
            if generated_key.is_some() {
                result
                    .generated_keys
                    .push(outcome.generated_key.unwrap_or(SqlValue::Null));
            }
        }

        debug!(
            pool = %self.pool.name(),
            statements = result.counts.len(),
            "Batch executed"
        );
        Ok(result)
    }

    /// Run a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.run(sql, params, &QueryCall).await
    }

    async fn run<C: Call>(&self, sql: &str, params: &[SqlValue], call: &C) -> DbResult<C::Output> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut conn = self.pool.borrow().await?;

            self.interceptors.before(sql, params);
            debug!(
                pool = %self.pool.name(),
                sql = %sql,
                params = params.len(),
                attempt,
                "Executing statement"
            );

            let start = Instant::now();
            let result = call.call(&mut conn, sql, params).await;
            let cost_ms = start.elapsed().as_millis() as u64;
            self.metrics.record(sql, params, cost_ms);

            let err = match result {
                Ok(output) => {
                    conn.release().await;
                    self.interceptors.after(sql, params, cost_ms, None);
                    return Ok(output);
                }
                Err(driver_err) => translate(sql, driver_err),
            };

            // connection-level failures leave the client unusable
            if err.is_retryable() {
                conn.discard().await;
            } else {
                conn.release().await;
            }
            self.interceptors.after(sql, params, cost_ms, Some(&err));

            if !self.retry.should_retry(attempt, &err) {
                if attempt > 1 {
                    warn!(
                        pool = %self.pool.name(),
                        attempts = attempt,
                        error = %err,
                        "Statement failed after retries"
                    );
                }
                return Err(err);
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                pool = %self.pool.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_statement(&self, statement: &Statement) -> DbResult<ExecuteResult> {
        self.run(
            &statement.sql,
            &statement.params,
            &ExecuteCall {
                generated_key: statement.generated_key.as_deref(),
            },
        )
        .await
    }

    /// Insert an entity. An auto-generated key is written back into it.
    pub async fn insert<E: Entity>(&self, entity: &mut E) -> DbResult<ExecuteResult> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().insert(&meta, entity)?;
        let result = self.run_statement(&statement).await?;

        if let (Some(key), Some(pk)) = (&result.generated_key, meta.primary_key()) {
            pk.set(entity, key.clone())?;
        }
        Ok(result)
    }

    pub async fn find_by_id<E: Entity>(&self, id: impl Into<SqlValue>) -> DbResult<Option<E>> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().find_by_id(&meta, id.into())?;
        let rows = self.query(&statement.sql, &statement.params).await?;
        rows.first().map(|row| meta.from_row(row)).transpose()
    }

    /// Update every mapped column of the row identified by the entity's key.
    pub async fn update_by_id<E: Entity>(&self, entity: &E) -> DbResult<u64> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().update_by_id(&meta, entity)?;
        Ok(self.run_statement(&statement).await?.rows_affected)
    }

    pub async fn delete_by_id<E: Entity>(&self, id: impl Into<SqlValue>) -> DbResult<u64> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().delete_by_id(&meta, id.into())?;
        Ok(self.run_statement(&statement).await?.rows_affected)
    }

    pub async fn select<E: Entity>(&self, query: &Query) -> DbResult<Vec<E>> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().select(&meta, query)?;
        let rows = self.query(&statement.sql, &statement.params).await?;
        rows.iter().map(|row| meta.from_row(row)).collect()
    }

    /// Run an aggregate query and return its rows unmapped.
    pub async fn select_rows<E: Entity>(&self, query: &Query) -> DbResult<Vec<Row>> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().select(&meta, query)?;
        self.query(&statement.sql, &statement.params).await
    }

    pub async fn count<E: Entity>(&self, query: &Query) -> DbResult<i64> {
        let meta = self.meta_cache.get::<E>()?;
        let statement = self.generator().count(&meta, query)?;
        let rows = self.query(&statement.sql, &statement.params).await?;
        let value = rows
            .first()
            .and_then(|row| row.get_index(0).cloned())
            .ok_or_else(|| DbError::state("count query returned no rows"))?;
        i64::from_sql_value(value)
    }

    /// Check the entity's mapping against the live table definition.
    pub async fn validate_entity<E: Entity>(&self) -> DbResult<()> {
        let meta = self.meta_cache.get::<E>()?;
        let table = meta.table_name();
        let mut conn = self.pool.borrow().await?;

        match conn.columns(table).await {
            Ok(columns) => {
                conn.release().await;
                meta.check_columns(&columns)?;
                debug!(pool = %self.pool.name(), table = %table, "Entity mapping validated");
                Ok(())
            }
            Err(driver_err) => {
                let err = translate(&format!("columns of {}", table), driver_err);
                if err.is_retryable() {
                    conn.discard().await;
                } else {
                    conn.release().await;
                }
                Err(err)
            }
        }
    }
}
