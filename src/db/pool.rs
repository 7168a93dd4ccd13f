//! Generic bounded resource pool.
//!
//! [`ResourcePool`] hands out live clients created by a [`ClientProvider`].
//! It never builds resources itself. Bookkeeping lives behind one short
//! `parking_lot` mutex that is never held across an await; borrowers that find
//! the pool full park on a shared [`Notify`] until a slot frees up, the pool
//! closes, or `max_wait` elapses.
//!
//! A background maintenance task keeps at least `min_idle` resources ready. It
//! holds only a weak reference to the pool and exits once the pool is closed or
//! dropped.

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates, validates and destroys pooled clients.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    type Client: Send + 'static;

    /// Short provider tag used in logs, e.g. `"sqlx"`.
    fn provider_type(&self) -> &'static str;

    /// One-time setup before the pool creates any client.
    async fn init(&mut self, config: &PoolConfig) -> DbResult<()>;

    async fn create_client(&self) -> DbResult<Self::Client>;

    /// Whether the client is still usable.
    async fn validate(&self, client: &mut Self::Client) -> bool;

    async fn destroy(&self, client: Self::Client);

    /// Release provider-level resources after the pool has closed.
    async fn close(&self);
}

/// Pool sizing and borrow behaviour.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on live resources
    pub max_active: usize,
    /// Resources kept ready by maintenance
    pub min_idle: usize,
    /// How long `borrow` may wait for a free slot
    pub max_wait: Duration,
    /// Validate idle resources before handing them out
    pub test_on_borrow: bool,
    /// Period of the min-idle maintenance task
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 8,
            min_idle: 0,
            max_wait: Duration::from_secs(30),
            test_on_borrow: false,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_active == 0 {
            return Err(DbError::invalid_argument("maxActive must be greater than 0"));
        }
        if self.min_idle > self.max_active {
            return Err(DbError::invalid_argument(format!(
                "minIdle ({}) must not exceed maxActive ({})",
                self.min_idle, self.max_active
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(DbError::invalid_argument(
                "maintenance interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrows: u64,
    pub timeouts: u64,
    pub validation_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    created: AtomicU64,
    destroyed: AtomicU64,
    borrows: AtomicU64,
    timeouts: AtomicU64,
    validation_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    active: usize,
    /// Slots reserved for resources being created or validated.
    pending: usize,
    closed: bool,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.active + self.idle.len() + self.pending
    }

    /// End one checkout. Every call pairs with exactly one `activate`.
    fn check_in(&mut self) {
        debug_assert!(self.active > 0, "client returned that was not borrowed");
        self.active -= 1;
    }
}

struct Shared<C: Send + 'static> {
    name: String,
    config: PoolConfig,
    provider: Box<dyn ClientProvider<Client = C>>,
    state: Mutex<PoolState<C>>,
    /// Woken when a slot or idle resource becomes available, or on close.
    available: Notify,
    /// Wakes the maintenance task early.
    kick: Arc<Notify>,
    stats: AtomicPoolStats,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Releases a reserved slot unless the reservation is completed.
struct Reservation<'a, C: Send + 'static> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<'a, C: Send + 'static> Reservation<'a, C> {
    fn new(shared: &'a Shared<C>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Send + 'static> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().pending -= 1;
            self.shared.available.notify_one();
        }
    }
}

enum Step<C> {
    Idle(C),
    Create,
    Wait,
}

/// A cloneable handle to a bounded pool of `C`.
pub struct ResourcePool<C: Send + 'static> {
    shared: Arc<Shared<C>>,
}

impl<C: Send + 'static> Clone for ResourcePool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Send + 'static> std::fmt::Debug for ResourcePool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ResourcePool")
            .field("name", &self.shared.name)
            .field("provider", &self.shared.provider.provider_type())
            .field("active", &state.active)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<C: Send + 'static> ResourcePool<C> {
    /// Initialise the provider, pre-fill `min_idle` resources and start maintenance.
    pub async fn new<P>(name: impl Into<String>, mut provider: P, config: PoolConfig) -> DbResult<Self>
    where
        P: ClientProvider<Client = C> + 'static,
    {
        config.validate()?;
        provider.init(&config).await?;

        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            config,
            provider: Box::new(provider),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                pending: 0,
                closed: false,
            }),
            available: Notify::new(),
            kick: Arc::new(Notify::new()),
            stats: AtomicPoolStats::default(),
            maintenance: Mutex::new(None),
        });
        let pool = Self { shared };

        if let Err(e) = pool.shared.fill_min_idle().await {
            pool.close().await;
            return Err(e);
        }

        let weak = Arc::downgrade(&pool.shared);
        let kick = Arc::clone(&pool.shared.kick);
        let interval = pool.shared.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            Shared::maintenance_task(weak, kick, interval).await;
        });
        *pool.shared.maintenance.lock() = Some(handle);

        info!(
            pool = %name,
            provider = pool.shared.provider.provider_type(),
            max_active = pool.shared.config.max_active,
            min_idle = pool.shared.config.min_idle,
            "Resource pool created"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a client, waiting up to `max_wait` when the pool is full.
    pub async fn borrow(&self) -> DbResult<PooledClient<C>> {
        let shared = &self.shared;
        let start = Instant::now();
        let deadline = start + shared.config.max_wait;
        let mut rejected = 0usize;

        loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            // register before inspecting state so a release in between is not missed
            notified.as_mut().enable();

            let mut refill = false;
            let step = {
                let mut state = shared.state.lock();
                if state.closed {
                    return Err(DbError::state(format!("pool '{}' is closed", shared.name)));
                }
                if let Some(client) = state.idle.pop_front() {
                    state.pending += 1;
                    refill = state.idle.len() < shared.config.min_idle;
                    Step::Idle(client)
                } else if state.total() < shared.config.max_active {
                    state.pending += 1;
                    Step::Create
                } else {
                    Step::Wait
                }
            };
            if refill {
                shared.kick.notify_one();
            }

            match step {
                Step::Idle(mut client) => {
                    let reservation = Reservation::new(shared);
                    if shared.config.test_on_borrow && !shared.provider.validate(&mut client).await {
                        AtomicPoolStats::bump(&shared.stats.validation_failures);
                        debug!(pool = %shared.name, "Idle resource failed validation");
                        shared.destroy_client(client).await;
                        drop(reservation);
                        rejected += 1;
                        if rejected > shared.config.max_active {
                            return Err(DbError::connection(
                                format!("pool '{}': resources keep failing validation", shared.name),
                                "Check that the database is reachable",
                            ));
                        }
                        continue;
                    }
                    return Ok(self.activate(reservation, client));
                }
                Step::Create => {
                    let reservation = Reservation::new(shared);
                    let mut client = shared.provider.create_client().await.inspect_err(|e| {
                        warn!(pool = %shared.name, error = %e, "Failed to create resource");
                    })?;
                    AtomicPoolStats::bump(&shared.stats.created);
                    if shared.config.test_on_borrow && !shared.provider.validate(&mut client).await {
                        AtomicPoolStats::bump(&shared.stats.validation_failures);
                        shared.destroy_client(client).await;
                        drop(reservation);
                        return Err(DbError::connection(
                            format!("pool '{}': new resource failed validation", shared.name),
                            "Check that the database is reachable",
                        ));
                    }
                    return Ok(self.activate(reservation, client));
                }
                Step::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || tokio::time::timeout(remaining, notified).await.is_err()
                    {
                        AtomicPoolStats::bump(&shared.stats.timeouts);
                        let elapsed_ms = start.elapsed().as_millis() as u64;
                        warn!(
                            pool = %shared.name,
                            elapsed_ms,
                            max_active = shared.config.max_active,
                            "Borrow timed out"
                        );
                        return Err(DbError::timeout(
                            format!("borrow from pool '{}'", shared.name),
                            elapsed_ms,
                        ));
                    }
                }
            }
        }
    }

    fn activate(&self, reservation: Reservation<'_, C>, client: C) -> PooledClient<C> {
        reservation.disarm();
        {
            let mut state = self.shared.state.lock();
            state.pending -= 1;
            state.active += 1;
        }
        AtomicPoolStats::bump(&self.shared.stats.borrows);
        PooledClient {
            client: Some(client),
            pool: self.clone(),
        }
    }

    /// Return a borrowed client to the idle set, or destroy it if the pool has closed.
    async fn release(&self, client: C) {
        let leftover = {
            let mut state = self.shared.state.lock();
            state.check_in();
            if state.closed {
                Some(client)
            } else {
                state.idle.push_back(client);
                None
            }
        };
        match leftover {
            Some(client) => self.shared.destroy_client(client).await,
            None => self.shared.available.notify_one(),
        }
    }

    /// Destroy a borrowed client instead of returning it.
    async fn discard(&self, client: C) {
        self.shared.state.lock().check_in();
        self.shared.destroy_client(client).await;
        self.shared.available.notify_one();
        self.shared.kick.notify_one();
    }

    /// Close the pool. Idle resources are destroyed now, borrowed ones when returned.
    pub async fn close(&self) {
        let idle: Vec<C> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.shared.available.notify_waiters();
        if let Some(handle) = self.shared.maintenance.lock().take() {
            handle.abort();
        }
        let count = idle.len();
        for client in idle {
            self.shared.destroy_client(client).await;
        }
        self.shared.provider.close().await;
        info!(pool = %self.shared.name, destroyed_idle = count, "Resource pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn total(&self) -> usize {
        self.shared.state.lock().total()
    }

    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    pub fn idle(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        let (total, active, idle) = {
            let state = self.shared.state.lock();
            (state.total(), state.active, state.idle.len())
        };
        let stats = &self.shared.stats;
        PoolStats {
            total,
            active,
            idle,
            created: stats.created.load(Ordering::Relaxed),
            destroyed: stats.destroyed.load(Ordering::Relaxed),
            borrows: stats.borrows.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            validation_failures: stats.validation_failures.load(Ordering::Relaxed),
        }
    }
}

impl<C: Send + 'static> Shared<C> {
    async fn destroy_client(&self, client: C) {
        self.provider.destroy(client).await;
        AtomicPoolStats::bump(&self.stats.destroyed);
        self.kick.notify_one();
    }

    /// Create idle resources until `min_idle` is reached or the pool is full.
    async fn fill_min_idle(&self) -> DbResult<usize> {
        let mut created = 0;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() >= self.config.min_idle
                    || state.total() >= self.config.max_active
                {
                    break;
                }
                state.pending += 1;
            }
            let reservation = Reservation::new(self);
            let client = self.provider.create_client().await?;
            AtomicPoolStats::bump(&self.stats.created);
            reservation.disarm();

            let leftover = {
                let mut state = self.state.lock();
                state.pending -= 1;
                if state.closed {
                    Some(client)
                } else {
                    state.idle.push_back(client);
                    None
                }
            };
            if let Some(client) = leftover {
                self.provider.destroy(client).await;
                AtomicPoolStats::bump(&self.stats.destroyed);
                break;
            }
            self.available.notify_one();
            created += 1;
        }
        if created > 0 {
            debug!(pool = %self.name, created, "Filled idle resources");
        }
        Ok(created)
    }

    /// Runs until the pool is closed or dropped.
    async fn maintenance_task(weak: Weak<Self>, kick: Arc<Notify>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = kick.notified() => {}
            }

            let Some(shared) = weak.upgrade() else {
                debug!("Resource pool dropped, maintenance task exiting");
                return;
            };
            if shared.state.lock().closed {
                return;
            }
            if let Err(e) = shared.fill_min_idle().await {
                warn!(pool = %shared.name, error = %e, "Min-idle maintenance failed");
            }
            // drop the strong reference before sleeping so the pool can be freed
            drop(shared);
        }
    }
}

/// A borrowed client. Returned to the pool on [`release`](Self::release) or drop.
pub struct PooledClient<C: Send + 'static> {
    client: Option<C>,
    pool: ResourcePool<C>,
}

impl<C: Send + 'static> std::fmt::Debug for PooledClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("pool", &self.pool.name())
            .field("held", &self.client.is_some())
            .finish()
    }
}

impl<C: Send + 'static> PooledClient<C> {
    /// Explicitly return the client (preferred over relying on Drop).
    pub async fn release(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client).await;
        }
    }

    /// Destroy the client instead of returning it, e.g. after a connection failure.
    pub async fn discard(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.discard(client).await;
        }
    }
}

impl<C: Send + 'static> std::ops::Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client.as_ref().expect("client already returned")
    }
}

impl<C: Send + 'static> std::ops::DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client.as_mut().expect("client already returned")
    }
}

impl<C: Send + 'static> Drop for PooledClient<C> {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.release(client).await;
                    debug!(pool = %pool.name(), "Resource released via Drop");
                });
            }
            Err(_) => {
                // no runtime left to run the async release
                pool.shared.state.lock().check_in();
            }
        }
    }
}
