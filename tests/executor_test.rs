//! Integration tests for the SQL executor.
//!
//! A scripted in-memory connection stands in for the database so the tests can
//! inject driver failures and observe how the executor reacts:
//! - Transient failures are retried on a fresh client and the broken one destroyed
//! - Constraint and syntax failures surface immediately and the client is kept
//! - Interceptors and metrics see every attempt
//! - Entity helpers render the expected statements and map rows back

use async_trait::async_trait;
use sqlcore::db::{
    BoxConnection, ClientProvider, PoolConfig, ResourcePool, RetryPolicy, SqlConnection,
    SqlExecutor, SqlInterceptor, Vendor, dialect_for,
};
use sqlcore::error::{DbError, DbResult, DriverError, ErrorKind};
use sqlcore::impl_entity;
use sqlcore::models::{ExecuteResult, Query, Row, SqlValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Script {
    executes: Mutex<VecDeque<Result<ExecuteResult, DriverError>>>,
    queries: Mutex<VecDeque<Result<Vec<Row>, DriverError>>>,
    columns: Mutex<Vec<String>>,
    statements: Mutex<Vec<(String, Vec<SqlValue>)>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl Script {
    fn push_execute(&self, outcome: Result<ExecuteResult, DriverError>) {
        self.executes.lock().unwrap().push_back(outcome);
    }

    fn push_query(&self, outcome: Result<Vec<Row>, DriverError>) {
        self.queries.lock().unwrap().push_back(outcome);
    }

    fn statements(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.statements.lock().unwrap().clone()
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
}

#[async_trait]
impl SqlConnection for ScriptedConnection {
    fn vendor(&self) -> Vendor {
        Vendor::MySql
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        generated_key: Option<&str>,
    ) -> Result<ExecuteResult, DriverError> {
        let mut statements = self.script.statements.lock().unwrap();
        statements.push((sql.to_string(), params.to_vec()));
        let n = statements.len() as i64;
        drop(statements);

        self.script
            .executes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ExecuteResult {
                    rows_affected: 1,
                    generated_key: generated_key.map(|_| SqlValue::Int(100 + n)),
                })
            })
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DriverError> {
        self.script
            .statements
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        self.script
            .queries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn columns(&mut self, _table: &str) -> Result<Vec<String>, DriverError> {
        Ok(self.script.columns.lock().unwrap().clone())
    }

    async fn ping(&mut self) -> bool {
        true
    }

    async fn close(self: Box<Self>) {}
}

struct ScriptedProvider {
    script: Arc<Script>,
}

#[async_trait]
impl ClientProvider for ScriptedProvider {
    type Client = BoxConnection;

    fn provider_type(&self) -> &'static str {
        "scripted"
    }

    async fn init(&mut self, _config: &PoolConfig) -> DbResult<()> {
        Ok(())
    }

    async fn create_client(&self) -> DbResult<BoxConnection> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
        }))
    }

    async fn validate(&self, client: &mut BoxConnection) -> bool {
        client.ping().await
    }

    async fn destroy(&self, client: BoxConnection) {
        self.script.destroyed.fetch_add(1, Ordering::SeqCst);
        client.close().await;
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct RecordingInterceptor {
    before: AtomicUsize,
    failures: AtomicUsize,
    successes: AtomicUsize,
}

impl SqlInterceptor for RecordingInterceptor {
    fn before_execute(&self, _sql: &str, _params: &[SqlValue]) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn after_execute(
        &self,
        _sql: &str,
        _params: &[SqlValue],
        _cost_ms: u64,
        success: bool,
        error: Option<&DbError>,
    ) {
        assert_eq!(success, error.is_none());
        if success {
            self.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct User {
    id: i64,
    user_name: String,
    email: Option<String>,
}

impl_entity!(User, "users", {
    id: i64 => primary_key(true),
    user_name: String,
    email: Option<String>,
});

async fn setup(retry: RetryPolicy, max_active: usize) -> (SqlExecutor, Arc<Script>) {
    let script = Arc::new(Script::default());
    let provider = ScriptedProvider {
        script: Arc::clone(&script),
    };
    let pool = ResourcePool::new(
        "scripted",
        provider,
        PoolConfig::default()
            .with_max_active(max_active)
            .with_max_wait(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let executor = SqlExecutor::new(pool, dialect_for(Vendor::MySql)).with_retry_policy(retry);
    (executor, script)
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_retries, Duration::from_millis(1))
}

#[tokio::test]
async fn test_transient_failure_is_retried_on_fresh_client() {
    let (executor, script) = setup(fast_retry(2), 2).await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    executor.interceptors().add(interceptor.clone());

    script.push_execute(Err(DriverError::new("connection reset").with_state("08006")));
    script.push_execute(Ok(ExecuteResult {
        rows_affected: 3,
        generated_key: None,
    }));

    let result = executor
        .execute("UPDATE users SET email = ?", &[SqlValue::Null])
        .await
        .unwrap();

    assert_eq!(result.rows_affected, 3);
    assert_eq!(script.statements().len(), 2);
    assert_eq!(script.created.load(Ordering::SeqCst), 2);
    assert_eq!(script.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(executor.pool().idle(), 1);
    assert_eq!(executor.pool().active(), 0);

    assert_eq!(executor.metrics().total_count(), 2);
    assert_eq!(interceptor.before.load(Ordering::SeqCst), 2);
    assert_eq!(interceptor.failures.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_constraint_violation_is_not_retried() {
    let (executor, script) = setup(fast_retry(3), 2).await;
    script.push_execute(Err(DriverError::new("duplicate key")
        .with_state("23505")
        .with_vendor_code(1062)));

    let err = executor
        .execute("INSERT INTO users (user_name) VALUES (?)", &["ann".into()])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SqlConstraint);
    assert_eq!(err.sql_state(), Some("23505"));
    assert_eq!(err.sql(), Some("INSERT INTO users (user_name) VALUES (?)"));
    assert!(!err.is_retryable());
    assert_eq!(script.statements().len(), 1);
    // the client is healthy and goes back to the pool
    assert_eq!(script.destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(executor.pool().idle(), 1);
}

#[tokio::test]
async fn test_syntax_error_is_classified() {
    let (executor, script) = setup(fast_retry(3), 1).await;
    script.push_query(Err(DriverError::new("syntax error near FORM").with_state("42000")));

    let err = executor.query("SELECT * FORM users", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SqlSyntax);
    assert!(err.suggestion().is_some());
    assert_eq!(script.statements().len(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_returns_last_error() {
    let (executor, script) = setup(fast_retry(2), 1).await;
    for _ in 0..3 {
        script.push_execute(Err(DriverError::new("link failure").with_state("08S01")));
    }

    let err = executor.execute("DELETE FROM users", &[]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SqlConnection);
    assert_eq!(script.statements().len(), 3);
    assert_eq!(script.destroyed.load(Ordering::SeqCst), 3);
    assert_eq!(executor.pool().total(), 0);
    assert_eq!(executor.metrics().total_count(), 3);
}

#[tokio::test]
async fn test_statement_timeout_is_retried() {
    let (executor, script) = setup(fast_retry(1), 1).await;
    script.push_query(Err(DriverError::timed_out("statement exceeded 10ms")));
    script.push_query(Ok(vec![Row::new(vec![("n".into(), SqlValue::Int(1))])]));

    let rows = executor.query("SELECT 1 AS n", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("n"), Some(&SqlValue::Int(1)));
    assert_eq!(script.statements().len(), 2);
}

#[tokio::test]
async fn test_no_retry_policy_fails_fast() {
    let (executor, script) = setup(RetryPolicy::no_retry(), 1).await;
    script.push_execute(Err(DriverError::new("connection refused").with_state("08001")));

    let err = executor.execute("DELETE FROM users", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SqlConnection);
    assert_eq!(script.statements().len(), 1);
}

#[tokio::test]
async fn test_pool_timeout_propagates_unchanged() {
    let (executor, script) = setup(fast_retry(3), 1).await;
    let held = executor.pool().borrow().await.unwrap();

    let err = executor.query("SELECT 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(script.statements().is_empty());
    assert_eq!(executor.metrics().total_count(), 0);

    held.release().await;
}

#[tokio::test]
async fn test_panicking_interceptor_does_not_break_execution() {
    struct Panicking;

    impl SqlInterceptor for Panicking {
        fn before_execute(&self, _sql: &str, _params: &[SqlValue]) {
            panic!("interceptor bug");
        }
    }

    let (executor, _script) = setup(fast_retry(0), 1).await;
    executor.interceptors().add(Arc::new(Panicking));

    let result = executor.execute("UPDATE users SET email = NULL", &[]).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_insert_writes_back_generated_key() {
    let (executor, script) = setup(fast_retry(0), 1).await;
    let mut user = User {
        id: 0,
        user_name: "ann".into(),
        email: Some("ann@example.com".into()),
    };

    let result = executor.insert(&mut user).await.unwrap();

    assert_eq!(result.rows_affected, 1);
    assert_eq!(user.id, 101);
    let statements = script.statements();
    assert_eq!(
        statements[0].0,
        "INSERT INTO users (user_name, email) VALUES (?, ?)"
    );
    assert_eq!(
        statements[0].1,
        vec![SqlValue::from("ann"), SqlValue::from("ann@example.com")]
    );
}

#[tokio::test]
async fn test_find_update_delete_by_id() {
    let (executor, script) = setup(fast_retry(0), 1).await;
    script.push_query(Ok(vec![Row::new(vec![
        ("id".into(), SqlValue::Int(7)),
        ("user_name".into(), SqlValue::from("bob")),
        ("email".into(), SqlValue::Null),
    ])]));
    script.push_query(Ok(Vec::new()));

    let found: Option<User> = executor.find_by_id(7).await.unwrap();
    let mut user = found.unwrap();
    assert_eq!(user.user_name, "bob");
    assert_eq!(user.email, None);

    let missing: Option<User> = executor.find_by_id(8).await.unwrap();
    assert!(missing.is_none());

    user.email = Some("bob@example.com".into());
    assert_eq!(executor.update_by_id(&user).await.unwrap(), 1);
    assert_eq!(executor.delete_by_id::<User>(7).await.unwrap(), 1);

    let statements = script.statements();
    assert_eq!(
        statements[0].0,
        "SELECT id, user_name, email FROM users WHERE id = ?"
    );
    assert_eq!(statements[0].1, vec![SqlValue::Int(7)]);
    assert_eq!(
        statements[2].0,
        "UPDATE users SET user_name = ?, email = ? WHERE id = ?"
    );
    assert_eq!(statements[2].1.last(), Some(&SqlValue::Int(7)));
    assert_eq!(statements[3].0, "DELETE FROM users WHERE id = ?");
}

#[tokio::test]
async fn test_select_and_count() {
    let (executor, script) = setup(fast_retry(0), 1).await;
    script.push_query(Ok(vec![
        Row::new(vec![
            ("id".into(), SqlValue::Int(1)),
            ("user_name".into(), SqlValue::from("ann")),
        ]),
        Row::new(vec![
            ("id".into(), SqlValue::Int(2)),
            ("user_name".into(), SqlValue::from("amy")),
        ]),
    ]));
    script.push_query(Ok(vec![Row::new(vec![(
        "COUNT(*)".into(),
        SqlValue::Int(42),
    )])]));

    let query = Query::builder()
        .like("user_name", "a%")
        .order_asc("id")
        .page(2, 10)
        .build();

    let users: Vec<User> = executor.select(&query).await.unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[1].user_name, "amy");

    let total = executor.count::<User>(&query).await.unwrap();
    assert_eq!(total, 42);

    let statements = script.statements();
    assert_eq!(
        statements[0].0,
        "SELECT id, user_name, email FROM users WHERE user_name LIKE ? ORDER BY id ASC LIMIT 10 OFFSET 10"
    );
    assert_eq!(
        statements[1].0,
        "SELECT COUNT(*) FROM users WHERE user_name LIKE ?"
    );
}

#[tokio::test]
async fn test_count_without_rows_is_state_error() {
    let (executor, _script) = setup(fast_retry(0), 1).await;
    let err = executor.count::<User>(&Query::all()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[tokio::test]
async fn test_validate_entity_against_live_columns() {
    let (executor, script) = setup(fast_retry(0), 1).await;

    *script.columns.lock().unwrap() = vec!["ID".into(), "USER_NAME".into(), "EMAIL".into()];
    executor.validate_entity::<User>().await.unwrap();

    *script.columns.lock().unwrap() = vec!["id".into(), "user_name".into()];
    let err = executor.validate_entity::<User>().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Meta);
    assert!(err.to_string().contains("email"));

    script.columns.lock().unwrap().clear();
    let err = executor.validate_entity::<User>().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Meta);
    assert_eq!(executor.pool().active(), 0);
}

#[tokio::test]
async fn test_batch_counts_and_keys_follow_input_order() {
    let (executor, script) = setup(fast_retry(0), 1).await;
    let sets = vec![
        vec![SqlValue::from("a")],
        vec![SqlValue::from("b")],
        vec![SqlValue::from("c")],
    ];

    let result = executor
        .execute_batch("INSERT INTO users (user_name) VALUES (?)", &sets, Some("id"))
        .await
        .unwrap();

    assert_eq!(result.counts, vec![1, 1, 1]);
    assert_eq!(
        result.generated_keys,
        vec![SqlValue::Int(101), SqlValue::Int(102), SqlValue::Int(103)]
    );
    let bound: Vec<SqlValue> = script
        .statements()
        .into_iter()
        .flat_map(|(_, params)| params)
        .collect();
    assert_eq!(bound, vec!["a".into(), "b".into(), "c".into()]);
}

#[tokio::test]
async fn test_batch_stops_at_first_failure() {
    let (executor, script) = setup(fast_retry(0), 1).await;
    script.push_execute(Ok(ExecuteResult {
        rows_affected: 1,
        generated_key: None,
    }));
    script.push_execute(Err(DriverError::new("duplicate").with_state("23000")));

    let sets = vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]];
    let err = executor
        .execute_batch("INSERT INTO t (id) VALUES (?)", &sets, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SqlConstraint);
    assert_eq!(script.statements().len(), 2);
}
