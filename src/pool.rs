//! Per-host pools of replica clients.
//!
//! A pool owns up to `pool_size` clients for one host, created lazily.
//! Checkout hands out the least-loaded alive client. Read and write pools are
//! separate instances with an identical schema.
//!
//! Liveness: each client charges its errors against its own counter; crossing
//! the limit shuts the client down and puts the whole host into a disable
//! window, during which checkouts fail with `HostDown`. Once the window has
//! passed the pool may connect a fresh client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use iroh_metrics::inc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::client::ReplicaClient;
use crate::config::{ClientConfig, PoolConfig};
use crate::error::StoreError;
use crate::metrics::Metrics;

/// Disable window shared by every client (and pool) of one host.
#[derive(Debug, Default)]
pub struct HostState {
    disabled_until: Mutex<Option<Instant>>,
}

impl HostState {
    /// Starts (or extends) the disable window.
    pub fn disable(&self, window: Duration) {
        let mut until = self.disabled_until.lock().expect("lock poisoned");
        *until = Some(Instant::now() + window);
    }

    pub fn is_disabled(&self) -> bool {
        let mut guard = self.disabled_until.lock().expect("lock poisoned");
        match *guard {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }
}

/// Pool of [`ReplicaClient`]s for a single host.
#[derive(Debug)]
pub struct ConnectionPool {
    addr: SocketAddr,
    pool_size: usize,
    pool_timeout: Duration,
    client_config: ClientConfig,
    host: Arc<HostState>,
    clients: AsyncMutex<Vec<ReplicaClient>>,
}

impl ConnectionPool {
    pub fn new(addr: SocketAddr, config: &PoolConfig, host: Arc<HostState>) -> Self {
        Self {
            addr,
            pool_size: config.pool_size.max(1),
            pool_timeout: config.pool_timeout(),
            client_config: config.client_config(),
            host,
            clients: AsyncMutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host_state(&self) -> Arc<HostState> {
        self.host.clone()
    }

    /// Checks out a client, connecting one if the pool is below capacity.
    pub async fn checkout(&self) -> Result<ReplicaClient, StoreError> {
        if self.host.is_disabled() {
            trace!(addr = %self.addr, "checkout refused, host disabled");
            return Err(StoreError::HostDown);
        }
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|client| client.is_alive());
        if clients.len() < before {
            debug!(
                addr = %self.addr,
                pruned = before - clients.len(),
                "pruned dead clients"
            );
        }

        if clients.len() < self.pool_size {
            let connect = ReplicaClient::connect(
                self.addr,
                self.client_config.clone(),
                self.host.clone(),
            );
            return match tokio::time::timeout(self.pool_timeout, connect).await {
                Err(_) => {
                    inc!(Metrics, pool_timeouts);
                    Err(StoreError::PoolTimeout)
                }
                Ok(Err(err)) => Err(err),
                Ok(Ok(client)) => {
                    clients.push(client.clone());
                    Ok(client)
                }
            };
        }

        clients
            .iter()
            .min_by_key(|client| client.inflight())
            .cloned()
            .ok_or(StoreError::HostDown)
    }

    /// Shuts down every pooled client, waiting for their drains.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().await.drain(..).collect();
        for client in clients {
            client.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use bytes::Bytes;

    use super::*;
    use crate::memstore::MemStore;
    use crate::proto::Cmd;

    fn test_pool_config() -> PoolConfig {
        PoolConfig {
            batch_timeout_ms: 2,
            timeout_ms: 100,
            connect_timeout_ms: 500,
            auto_disable_error_limit: 3,
            auto_disable_duration_s: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn checkout_reuses_the_client() -> Result<()> {
        let store = MemStore::spawn("127.0.0.1:0".parse()?).await?;
        let pool = ConnectionPool::new(store.addr(), &test_pool_config(), Default::default());

        let a = pool.checkout().await?;
        let b = pool.checkout().await?;
        assert_eq!(pool.clients.lock().await.len(), 1);
        drop((a, b));

        pool.shutdown().await;
        store.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn zero_timeout_checkout_fails() -> Result<()> {
        let store = MemStore::spawn("127.0.0.1:0".parse()?).await?;
        let mut config = test_pool_config();
        config.pool_timeout_ms = 0;
        let pool = ConnectionPool::new(store.addr(), &config, Default::default());

        assert_eq!(pool.checkout().await.unwrap_err(), StoreError::PoolTimeout);

        store.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn error_storm_disables_the_host() -> Result<()> {
        let store = MemStore::spawn("127.0.0.1:0".parse()?).await?;
        let pool = ConnectionPool::new(store.addr(), &test_pool_config(), Default::default());
        let host = pool.host_state();

        let client = pool.checkout().await?;
        // Renaming a missing key is a store-reported error each time; the
        // third one crosses the limit.
        for _ in 0..3 {
            let err = client
                .call(Cmd::Rename {
                    key: Bytes::from_static(b"missing"),
                    to: Bytes::from_static(b"t"),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::StoreExecution(_)));
        }
        client.shutdown().await;

        assert!(host.is_disabled());
        assert_eq!(pool.checkout().await.unwrap_err(), StoreError::HostDown);

        // Once the window has passed the pool connects a fresh client.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let fresh = pool.checkout().await?;
        assert!(fresh.is_alive());

        pool.shutdown().await;
        store.shutdown().await?;
        Ok(())
    }
}
