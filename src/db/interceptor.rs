//! Statement observers.
//!
//! Interceptors see every statement before and after it runs. They cannot
//! change or abort it: they receive borrowed data only, and a panicking
//! interceptor is logged and skipped.

use crate::error::DbError;
use crate::models::SqlValue;
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

pub trait SqlInterceptor: Send + Sync {
    fn before_execute(&self, _sql: &str, _params: &[SqlValue]) {}

    fn after_execute(
        &self,
        _sql: &str,
        _params: &[SqlValue],
        _cost_ms: u64,
        _success: bool,
        _error: Option<&DbError>,
    ) {
    }
}

/// Ordered, shared list of interceptors. Additive; removal is all-or-nothing.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<dyn SqlInterceptor>>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, interceptor: Arc<dyn SqlInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn clear(&self) {
        self.interceptors.write().clear();
    }

    pub fn len(&self) -> usize {
        self.interceptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Snapshot so an interceptor may register others without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn SqlInterceptor>> {
        self.interceptors.read().clone()
    }

    pub fn before(&self, sql: &str, params: &[SqlValue]) {
        for interceptor in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| interceptor.before_execute(sql, params))).is_err() {
                warn!("Interceptor panicked in before_execute");
            }
        }
    }

    pub fn after(
        &self,
        sql: &str,
        params: &[SqlValue],
        cost_ms: u64,
        error: Option<&DbError>,
    ) {
        for interceptor in self.snapshot() {
            let call = AssertUnwindSafe(|| {
                interceptor.after_execute(sql, params, cost_ms, error.is_none(), error)
            });
            if catch_unwind(call).is_err() {
                warn!("Interceptor panicked in after_execute");
            }
        }
    }
}
