// Keyed connection pool for producer connections.
//
// Connections are pooled per nsqd address with a fixed capacity. Every
// borrow re-checks health and discards stale connections instead of handing
// them out; exhaustion is reported as `None` so the caller can apply its own
// retry policy rather than block inside the pool.
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::addr::ServerAddress;
use crate::config::Config;
use crate::conn::Connection;
use crate::error::Result;

#[derive(Default)]
struct PoolState {
    idle: HashMap<ServerAddress, Vec<Arc<Connection>>>,
    /// Connections alive per address: idle, borrowed, and being dialed.
    live: HashMap<ServerAddress, usize>,
    /// Set by `close_all`; borrowed connections returned afterwards are
    /// discarded instead of re-idled.
    closed: bool,
}

pub(crate) struct ConnectionPool {
    config: Config,
    capacity_per_address: usize,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub(crate) fn new(config: Config, capacity_per_address: usize) -> Arc<Self> {
        Arc::new(Self {
            config,
            capacity_per_address: capacity_per_address.max(1),
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Borrow a healthy connection to `addr`, dialing one if the pool has
    /// room. `Ok(None)` means the address is at capacity right now.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        addr: &ServerAddress,
    ) -> Result<Option<PooledConnection>> {
        loop {
            enum Plan {
                Reuse(Arc<Connection>),
                Dial,
                Exhausted,
            }
            let plan = {
                let mut state = self.state();
                if state.closed {
                    Plan::Exhausted
                } else if let Some(conn) = state.idle.get_mut(addr).and_then(Vec::pop) {
                    Plan::Reuse(conn)
                } else if state.live.get(addr).copied().unwrap_or(0) < self.capacity_per_address {
                    // Reserve the slot before dialing outside the lock.
                    *state.live.entry(addr.clone()).or_insert(0) += 1;
                    Plan::Dial
                } else {
                    Plan::Exhausted
                }
            };
            match plan {
                Plan::Reuse(conn) => {
                    if conn.is_healthy() {
                        return Ok(Some(self.guard(conn)));
                    }
                    tracing::debug!(addr = %addr, "discarding stale pooled connection");
                    self.forget(&conn);
                }
                Plan::Dial => match Connection::connect(addr, &self.config, None, None).await {
                    Ok(conn) => return Ok(Some(self.guard(conn))),
                    Err(err) => {
                        self.release_slot(addr);
                        return Err(err);
                    }
                },
                Plan::Exhausted => return Ok(None),
            }
        }
    }

    /// Close every idle connection and drop the bookkeeping. Borrowed
    /// connections are discarded when their guards come back.
    pub(crate) fn close_all(&self) {
        let mut state = self.state();
        state.closed = true;
        for (_, conns) in state.idle.drain() {
            for conn in conns {
                conn.close();
            }
        }
        state.live.clear();
    }

    /// Undo `close_all` so the pool can dial again.
    pub(crate) fn reopen(&self) {
        self.state().closed = false;
    }

    fn guard(self: &Arc<Self>, conn: Arc<Connection>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::downgrade(self),
        }
    }

    fn put_back(&self, conn: Arc<Connection>) {
        if !conn.is_connected() {
            self.forget(&conn);
            return;
        }
        let mut state = self.state();
        if state.closed {
            drop(state);
            self.forget(&conn);
            return;
        }
        state
            .idle
            .entry(conn.addr().clone())
            .or_default()
            .push(conn);
    }

    fn forget(&self, conn: &Arc<Connection>) {
        conn.close();
        self.release_slot(conn.addr());
    }

    fn release_slot(&self, addr: &ServerAddress) {
        let mut state = self.state();
        if let Some(count) = state.live.get_mut(addr) {
            *count = count.saturating_sub(1);
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Borrowed connection; returns itself to the pool on drop.
pub(crate) struct PooledConnection {
    conn: Option<Arc<Connection>>,
    pool: Weak<ConnectionPool>,
}

impl PooledConnection {
    pub(crate) fn connection(&self) -> &Arc<Connection> {
        // The option is only vacated in Drop.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(pool)) = (self.conn.take(), self.pool.upgrade()) {
            pool.put_back(conn);
        }
    }
}
