//! Per-server connection pool.
//!
//! Each server index owns a FIFO of idle connections and a semaphore
//! capping the number of live connections at `max-connections`. Popping
//! reuses an idle connection when one exists, lazily connects otherwise,
//! and blocks (FIFO among waiters) when the cap is reached. Pushing a
//! broken connection discards it, which releases its slot.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use skiff_proto::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::Configuration;
use crate::error::ClientError;

/// Pools for the object and kv server lists.
pub struct ConnectionPool {
    object: Vec<SubPool>,
    kv: Vec<SubPool>,
}

struct SubPool {
    addr: String,
    idle: Mutex<VecDeque<Connection>>,
    permits: Arc<Semaphore>,
}

/// A checked-out connection. Dropping it without pushing it back releases
/// its slot but wastes the TCP connection; prefer returning it through
/// [`ConnectionPool::push_object`] / [`ConnectionPool::push_kv`].
pub struct PooledConnection {
    conn: Connection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl ConnectionPool {
    pub fn new(configuration: &Configuration) -> Self {
        let max = configuration.max_connections() as usize;
        let build = |addrs: Vec<&str>| -> Vec<SubPool> {
            addrs
                .into_iter()
                .map(|addr| SubPool {
                    addr: addr.to_string(),
                    idle: Mutex::new(VecDeque::new()),
                    permits: Arc::new(Semaphore::new(max)),
                })
                .collect()
        };

        Self {
            object: build(
                (0..configuration.object_server_count())
                    .filter_map(|i| configuration.object_server(i))
                    .collect(),
            ),
            kv: build(
                (0..configuration.kv_server_count())
                    .filter_map(|i| configuration.kv_server(i))
                    .collect(),
            ),
        }
    }

    /// Check out a connection to an object server.
    pub async fn pop_object(&self, index: u32) -> Result<PooledConnection, ClientError> {
        pop(&self.object, index).await
    }

    /// Check out a connection to a kv server.
    pub async fn pop_kv(&self, index: u32) -> Result<PooledConnection, ClientError> {
        pop(&self.kv, index).await
    }

    /// Return an object-server connection. Broken connections are dropped.
    pub fn push_object(&self, index: u32, conn: PooledConnection) {
        push(&self.object, index, conn);
    }

    /// Return a kv-server connection. Broken connections are dropped.
    pub fn push_kv(&self, index: u32, conn: PooledConnection) {
        push(&self.kv, index, conn);
    }
}

async fn pop(pools: &[SubPool], index: u32) -> Result<PooledConnection, ClientError> {
    let pool = pools.get(index as usize).ok_or(ClientError::ServerIndex {
        index,
        count: pools.len() as u32,
    })?;

    // One permit per live connection; the semaphore never closes.
    let permit = pool
        .permits
        .clone()
        .acquire_owned()
        .await
        .expect("pool semaphore closed");

    let idle = pool.idle.lock().expect("pool lock poisoned").pop_front();
    let conn = match idle {
        Some(conn) => conn,
        None => Connection::connect(&pool.addr).await?,
    };

    Ok(PooledConnection {
        conn,
        _permit: permit,
    })
}

fn push(pools: &[SubPool], index: u32, pooled: PooledConnection) {
    let Some(pool) = pools.get(index as usize) else {
        return;
    };

    if pooled.conn.is_broken() {
        debug!(index, "discarding broken connection");
        return;
    }

    pool.idle
        .lock()
        .expect("pool lock poisoned")
        .push_back(pooled.conn);
    // The permit drops here, reopening the slot for the idle connection.
}
