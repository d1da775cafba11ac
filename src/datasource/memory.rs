//! In-process connection pool.
//!
//! Hands out numbered leases instead of real connections, with the
//! checkout limits of a relational pool. Used by the console and in tests.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{DataSourceError, PooledDataSource, Result};
use crate::config::DataSourceConfig;

struct PoolState {
    active: usize,
    idle: Vec<u64>,
    closed: bool,
}

/// Pool of numbered connections.
pub struct InMemoryDataSource {
    state: Mutex<PoolState>,
    released: Condvar,
    next_id: AtomicU64,
    max_active: AtomicU32,
    max_idle: AtomicU32,
    min_idle: u32,
    max_wait_millis: AtomicU64,
}

impl InMemoryDataSource {
    /// Pool sized from `config`, pre-filled with `min_idle` connections.
    pub fn from_config(config: &DataSourceConfig) -> Result<Self> {
        let pool = Self {
            state: Mutex::new(PoolState {
                active: 0,
                idle: Vec::new(),
                closed: false,
            }),
            released: Condvar::new(),
            next_id: AtomicU64::new(1),
            max_active: AtomicU32::new(config.max_active),
            max_idle: AtomicU32::new(config.max_idle),
            min_idle: config.min_idle,
            max_wait_millis: AtomicU64::new(config.max_wait_ms),
        };
        {
            let mut state = pool.lock();
            for _ in 0..config.min_idle {
                let id = pool.next_id.fetch_add(1, Ordering::Relaxed);
                state.idle.push(id);
            }
        }
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection, waiting up to `max_wait` when the pool is
    /// exhausted.
    pub fn acquire(&self) -> Result<Lease<'_>> {
        let deadline = Instant::now() + self.max_wait();
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(DataSourceError::Pool("pool is closed".to_string()));
            }
            let limit = self.max_active.load(Ordering::Relaxed) as usize;
            if limit == 0 || state.active < limit {
                let id = state
                    .idle
                    .pop()
                    .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));
                state.active += 1;
                debug!(connection = id, active = state.active, "Connection checked out");
                return Ok(Lease { pool: self, id });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DataSourceError::Pool(format!(
                    "timeout waiting for a connection after {}ms",
                    self.max_wait().as_millis()
                )));
            }
            state = self
                .released
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        state.active -= 1;
        if !state.closed && state.idle.len() < self.max_idle.load(Ordering::Relaxed) as usize {
            state.idle.push(id);
        }
        debug!(connection = id, active = state.active, "Connection returned");
        self.released.notify_one();
    }
}

impl PooledDataSource for InMemoryDataSource {
    fn num_active(&self) -> usize {
        self.lock().active
    }

    fn num_idle(&self) -> usize {
        self.lock().idle.len()
    }

    fn max_active(&self) -> u32 {
        self.max_active.load(Ordering::Relaxed)
    }

    fn set_max_active(&self, max_active: u32) {
        self.max_active.store(max_active, Ordering::Relaxed);
        self.released.notify_all();
    }

    fn max_idle(&self) -> u32 {
        self.max_idle.load(Ordering::Relaxed)
    }

    fn set_max_idle(&self, max_idle: u32) {
        self.max_idle.store(max_idle, Ordering::Relaxed);
        let mut state = self.lock();
        state.idle.truncate(max_idle as usize);
    }

    fn min_idle(&self) -> u32 {
        self.min_idle
    }

    fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_millis.load(Ordering::Relaxed))
    }

    fn set_max_wait(&self, max_wait: Duration) {
        let millis = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
        self.max_wait_millis.store(millis, Ordering::Relaxed);
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.closed = true;
        state.idle.clear();
        self.released.notify_all();
        Ok(())
    }
}

/// A checked-out connection, returned to the pool on drop.
pub struct Lease<'a> {
    pool: &'a InMemoryDataSource,
    id: u64,
}

impl Lease<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
