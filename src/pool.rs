use crate::config::PoolConfig;
use crate::core::{Properties, ProxyError, Result};
use crate::driver::{Driver, DriverConnection};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Connection pool
///
/// Keeps real driver connections of one resource open between sessions.
/// A session borrows a connection for its whole lifetime and hands it back
/// through [`ConnectionPool::release`] when the root connection is destroyed.
pub struct ConnectionPool {
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    locator: String,
    properties: Properties,
    /// Available connections
    available: Mutex<VecDeque<PooledConnection>>,
    /// Connections currently open, borrowed or idle
    total_connections: AtomicUsize,
    next_id: AtomicU64,
}

/// Bookkeeping a borrowed connection carries back to the pool.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    id: u64,
    created_at: Instant,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct PooledConnection {
    connection: Box<dyn DriverConnection>,
    lease: Lease,
    last_used: Instant,
}

impl PooledConnection {
    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        is_expired(&self.lease, max_lifetime)
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }
}

fn is_expired(lease: &Lease, max_lifetime: Option<Duration>) -> bool {
    if let Some(lifetime) = max_lifetime {
        lease.created_at.elapsed() > lifetime
    } else {
        false
    }
}

impl ConnectionPool {
    pub async fn new(
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        locator: &str,
        properties: Properties,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            config,
            driver,
            locator: locator.to_string(),
            properties,
            available: Mutex::new(VecDeque::new()),
            total_connections: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        };

        // Pre-create minimum connections
        pool.ensure_min_connections().await?;

        Ok(pool)
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Borrows a connection, opening a new one while under the limit and
    /// otherwise waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<(Box<dyn DriverConnection>, Lease)> {
        let start = Instant::now();

        loop {
            if let Some(pooled) = self.try_get_available().await {
                debug!("Pool {} lent connection {}", self.locator, pooled.lease.id);
                return Ok((pooled.connection, pooled.lease));
            }

            if let Some(created) = self.try_create_connection().await? {
                return Ok(created);
            }

            if start.elapsed() > self.config.acquire_timeout() {
                return Err(ProxyError::Timeout(format!(
                    "connection pool {}: no connections available",
                    self.locator
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Returns a borrowed connection. Open transactions are rolled back;
    /// connections that are closed, broken or past their lifetime are
    /// discarded instead.
    pub async fn release(&self, mut connection: Box<dyn DriverConnection>, lease: Lease) {
        if connection.is_closed() {
            self.discard(lease);
            return;
        }
        if is_expired(&lease, self.config.max_lifetime()) {
            self.close_and_discard(connection, lease).await;
            return;
        }
        if let Err(e) = reset(connection.as_mut()).await {
            warn!(
                "Pool {} could not reset connection {}: {}",
                self.locator, lease.id, e
            );
            self.close_and_discard(connection, lease).await;
            return;
        }

        let mut available = self.available.lock().await;
        available.push_back(PooledConnection {
            connection,
            lease,
            last_used: Instant::now(),
        });
        debug!("Pool {} took back connection {}", self.locator, lease.id);
    }

    /// Closes every idle connection. Borrowed connections are closed by
    /// their sessions.
    pub async fn close_idle(&self) {
        let drained: Vec<PooledConnection> = self.available.lock().await.drain(..).collect();
        for pooled in drained {
            self.close_and_discard(pooled.connection, pooled.lease).await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        }
    }

    async fn try_get_available(&self) -> Option<PooledConnection> {
        let mut available = self.available.lock().await;

        let mut kept = VecDeque::with_capacity(available.len());
        let mut stale = Vec::new();
        while let Some(pooled) = available.pop_front() {
            if pooled.connection.is_closed()
                || pooled.is_expired(self.config.max_lifetime())
                || pooled.is_idle_too_long(self.config.idle_timeout())
            {
                stale.push(pooled);
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;
        let next = available.pop_front();
        drop(available);

        for pooled in stale {
            self.close_and_discard(pooled.connection, pooled.lease).await;
        }
        next
    }

    async fn try_create_connection(&self) -> Result<Option<(Box<dyn DriverConnection>, Lease)>> {
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.config.max_connections).then_some(total + 1)
            });
        if reserved.is_err() {
            return Ok(None);
        }

        match self.driver.connect(&self.locator, &self.properties).await {
            Ok(connection) => {
                let lease = self.new_lease();
                debug!("Pool {} opened connection {}", self.locator, lease.id);
                Ok(Some((connection, lease)))
            }
            Err(e) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn ensure_min_connections(&self) -> Result<()> {
        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = self.driver.connect(&self.locator, &self.properties).await?;
            let lease = self.new_lease();
            self.total_connections.fetch_add(1, Ordering::SeqCst);
            self.available.lock().await.push_back(PooledConnection {
                connection,
                lease,
                last_used: Instant::now(),
            });
        }
        Ok(())
    }

    fn new_lease(&self) -> Lease {
        Lease {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            created_at: Instant::now(),
        }
    }

    async fn close_and_discard(&self, mut connection: Box<dyn DriverConnection>, lease: Lease) {
        if !connection.is_closed() {
            if let Err(e) = connection.close().await {
                warn!("Pool {} failed to close connection {}: {}", self.locator, lease.id, e);
            }
        }
        self.discard(lease);
    }

    /// Gives up a lease whose connection was closed outside the pool.
    pub fn discard(&self, lease: Lease) {
        debug!("Pool {} discarded connection {}", self.locator, lease.id);
        self.total_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Puts a connection back into the state a fresh one would have.
async fn reset(connection: &mut dyn DriverConnection) -> Result<()> {
    if !connection.auto_commit() {
        connection.rollback().await?;
        connection.set_auto_commit(true).await?;
    }
    if connection.is_read_only() {
        connection.set_read_only(false).await?;
    }
    Ok(())
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            enabled: true,
            min_connections: min,
            max_connections: max,
            acquire_timeout_ms: 100,
            ..PoolConfig::default()
        }
    }

    async fn pool(min: usize, max: usize) -> ConnectionPool {
        ConnectionPool::new(
            config(min, max),
            Arc::new(MemoryDriver::new()),
            "memory:pool",
            Properties::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = pool(2, 5).await;
        let stats = pool.stats().await;

        assert_eq!(stats.total_connections, 2); // min_connections
        assert_eq!(stats.available_connections, 2);
        assert_eq!(stats.max_connections, 5);
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let pool = pool(1, 5).await;

        let (conn, lease) = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.available_connections, 0);

        pool.release(conn, lease).await;
        let stats = pool.stats().await;
        assert_eq!(stats.available_connections, 1);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let pool = pool(0, 1).await;

        let (mut conn, lease) = pool.acquire().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        let mut stmt = conn
            .create_statement(Default::default())
            .await
            .unwrap();
        stmt.execute_update(Some("CREATE TABLE t (id INTEGER)")).await.unwrap();
        stmt.execute_update(Some("INSERT INTO t VALUES (1)")).await.unwrap();
        drop(stmt);
        pool.release(conn, lease).await;

        let (mut conn, _lease) = pool.acquire().await.unwrap();
        assert!(conn.auto_commit());
        let mut stmt = conn.create_statement(Default::default()).await.unwrap();
        assert!(stmt.execute_query(Some("SELECT * FROM t")).await.is_err());
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let pool = pool(0, 2).await;

        let _conn1 = pool.acquire().await.unwrap();
        let _conn2 = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(ProxyError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_closed_connection_is_discarded() {
        let pool = pool(0, 2).await;

        let (mut conn, lease) = pool.acquire().await.unwrap();
        conn.close().await.unwrap();
        pool.release(conn, lease).await;

        let stats = pool.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.available_connections, 0);
    }

    #[tokio::test]
    async fn test_discarded_lease_frees_its_slot() {
        let pool = pool(0, 1).await;

        let (mut conn, lease) = pool.acquire().await.unwrap();
        conn.close().await.unwrap();
        drop(conn);
        pool.discard(lease);
        assert_eq!(pool.stats().await.total_connections, 0);

        assert!(pool.acquire().await.is_ok());
    }
}
