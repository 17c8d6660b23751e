//! Bounded connection pool for networked backends.
//!
//! Generic over a [`Connector`] so object-store clients, HTTP clients, and
//! test doubles pool identically. Guards return their connection on drop on
//! every exit path; a maintenance thread reclaims idle connections and
//! replaces unhealthy ones.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use mnemo_error::{MnemoError, Result};
use mnemo_types::Cx;

/// Produces and checks backend client connections.
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Establish a new connection.
    fn connect(&self, cx: &Cx) -> Result<Self::Conn>;

    /// Whether an idle connection is still usable.
    fn is_healthy(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

/// Pool sizing and maintenance cadence.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Preset for object-store backends, which tolerate more parallelism.
    #[must_use]
    pub fn object_store() -> Self {
        Self {
            min: 3,
            max: 20,
            ..Self::default()
        }
    }
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: Vec<IdleConn<C>>,
    /// Connections currently lent out or idle.
    total: usize,
    shutdown: bool,
}

struct PoolShared<T: Connector> {
    connector: T,
    config: PoolConfig,
    state: Mutex<PoolState<T::Conn>>,
    available: Condvar,
}

/// Bounded pool of backend clients.
pub struct ConnectionPool<T: Connector> {
    shared: Arc<PoolShared<T>>,
    maintenance: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<T: Connector> ConnectionPool<T> {
    /// Build a pool and pre-warm `min` connections (best effort), spawning
    /// the maintenance thread.
    pub fn new(connector: T, config: PoolConfig) -> Arc<Self> {
        let shared = Arc::new(PoolShared {
            connector,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let cx = Cx::new();
        for _ in 0..shared.config.min {
            match shared.connector.connect(&cx) {
                Ok(conn) => {
                    let mut state = shared.state.lock();
                    state.idle.push(IdleConn {
                        conn,
                        since: Instant::now(),
                    });
                    state.total += 1;
                }
                Err(err) => {
                    warn!(error = %err, "pool pre-warm connect failed");
                    break;
                }
            }
        }

        let pool = Arc::new(Self {
            shared: Arc::clone(&shared),
            maintenance: Mutex::new(None),
        });

        let maintenance_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("mnemo-pool-maintenance".to_owned())
            .spawn(move || maintenance_loop(&maintenance_shared))
            .ok();
        *pool.maintenance.lock() = handle;
        pool
    }

    /// Borrow a connection, waiting up to the configured acquire timeout
    /// (bounded further by the context deadline).
    pub fn acquire(self: &Arc<Self>, cx: &Cx) -> Result<PooledConn<T>> {
        let deadline = {
            let timeout = self.shared.config.acquire_timeout;
            let budget = cx.remaining().map_or(timeout, |r| r.min(timeout));
            Instant::now() + budget
        };

        let mut state = self.shared.state.lock();
        loop {
            cx.checkpoint_with("pool acquire")?;
            if state.shutdown {
                return Err(MnemoError::BackendUnavailable(
                    "connection pool is shut down".to_owned(),
                ));
            }
            if let Some(idle) = state.idle.pop() {
                return Ok(PooledConn {
                    pool: Arc::clone(self),
                    conn: Some(idle.conn),
                });
            }
            if state.total < self.shared.config.max {
                state.total += 1;
                drop(state);
                // Connect outside the lock; roll the count back on failure.
                match self.shared.connector.connect(cx) {
                    Ok(conn) => {
                        return Ok(PooledConn {
                            pool: Arc::clone(self),
                            conn: Some(conn),
                        });
                    }
                    Err(err) => {
                        let mut state = self.shared.state.lock();
                        state.total -= 1;
                        drop(state);
                        return Err(err);
                    }
                }
            }
            let timed_out = self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out();
            if timed_out {
                return Err(MnemoError::Timeout("pool acquire".to_owned()));
            }
        }
    }

    /// Connections currently idle.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Connections alive (idle + lent out).
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.shared.state.lock().total
    }

    /// Drop idle connections past the idle timeout and unhealthy ones,
    /// keeping at least `min` alive. Called by the maintenance thread;
    /// public so tests can drive it deterministically.
    pub fn reap(&self) {
        let mut state = self.shared.state.lock();
        let min = self.shared.config.min;
        let idle_timeout = self.shared.config.idle_timeout;
        let now = Instant::now();
        let mut kept = Vec::with_capacity(state.idle.len());
        let mut dropped = 0_usize;
        let total = state.total;
        for idle in state.idle.drain(..) {
            let expired = now.duration_since(idle.since) >= idle_timeout;
            let unhealthy = !self.shared.connector.is_healthy(&idle.conn);
            let above_min = total - dropped > min;
            if (expired || unhealthy) && above_min {
                dropped += 1;
            } else {
                kept.push(idle);
            }
        }
        state.idle = kept;
        state.total -= dropped;
        if dropped > 0 {
            debug!(dropped, remaining = state.total, "pool reaped connections");
        }
    }

    /// Stop the maintenance thread and refuse further acquires.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.idle.clear();
            state.total = 0;
        }
        self.shared.available.notify_all();
        if let Some(handle) = self.maintenance.lock().take() {
            let _ = handle.join();
        }
    }

    fn release(&self, conn: T::Conn) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            state.total = state.total.saturating_sub(1);
            return;
        }
        state.idle.push(IdleConn {
            conn,
            since: Instant::now(),
        });
        drop(state);
        self.shared.available.notify_one();
    }
}

fn maintenance_loop<T: Connector>(shared: &Arc<PoolShared<T>>) {
    loop {
        {
            let mut state = shared.state.lock();
            if state.shutdown {
                return;
            }
            let timed_out = shared
                .available
                .wait_for(&mut state, shared.config.health_check_interval)
                .timed_out();
            if state.shutdown {
                return;
            }
            if !timed_out {
                // Woken by a release, not the cadence; nothing to reap yet.
                continue;
            }
        }
        // Inline reap without the pool wrapper.
        let mut state = shared.state.lock();
        let now = Instant::now();
        let min = shared.config.min;
        let idle_timeout = shared.config.idle_timeout;
        let mut kept = Vec::with_capacity(state.idle.len());
        let mut dropped = 0_usize;
        let total = state.total;
        for idle in state.idle.drain(..) {
            let stale = now.duration_since(idle.since) >= idle_timeout
                || !shared.connector.is_healthy(&idle.conn);
            if stale && total - dropped > min {
                dropped += 1;
            } else {
                kept.push(idle);
            }
        }
        state.idle = kept;
        state.total -= dropped;
    }
}

/// RAII connection guard; returns the connection on drop.
pub struct PooledConn<T: Connector> {
    pool: Arc<ConnectionPool<T>>,
    conn: Option<T::Conn>,
}

impl<T: Connector> PooledConn<T> {
    /// The borrowed connection.
    pub fn get(&self) -> &T::Conn {
        self.conn.as_ref().expect("connection present until drop")
    }

    /// Mutable access to the borrowed connection.
    pub fn get_mut(&mut self) -> &mut T::Conn {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<T: Connector> Drop for PooledConn<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl<T: Connector> std::fmt::Debug for PooledConn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}
