//! Single-replica shard façade and the timeline capability set.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::PoolConfig;
use crate::error::StoreError;
use crate::pool::{ConnectionPool, HostState};
use crate::trim::TrimConfig;

/// The timeline operations.
///
/// Implemented by both [`Shard`] and
/// [`crate::replication::ReplicatingShard`], so callers and drivers work
/// against one replica or a fanned-out replica set interchangeably.
#[async_trait]
pub trait Timeline: Send + Sync + 'static {
    /// Append `entry` as the newest element, if the timeline exists.
    async fn push(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError>;
    /// Remove every occurrence of `entry`.
    async fn pop(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError>;
    /// Insert `entry` just newer than the nearest-to-tail occurrence of
    /// `old`; no-op if `old` is gone.
    async fn push_after(&self, timeline: &str, old: Bytes, entry: Bytes)
        -> Result<(), StoreError>;
    /// Up to `len` entries starting `offset` from the newest, newest first.
    /// `len <= 0` reads through to the oldest entry.
    async fn get(&self, timeline: &str, offset: u64, len: i64) -> Result<Vec<Bytes>, StoreError>;
    async fn size(&self, timeline: &str) -> Result<u64, StoreError>;
    async fn delete(&self, timeline: &str) -> Result<(), StoreError>;
    /// Keep only the newest `size` entries.
    async fn trim(&self, timeline: &str, size: u64) -> Result<(), StoreError>;
    /// Atomically replace the whole timeline with `entries` (oldest first).
    async fn set_atomically(&self, timeline: &str, entries: Vec<Bytes>)
        -> Result<(), StoreError>;
    /// Begin a live copy: recreate the timeline holding only the sentinel.
    async fn set_live_start(&self, timeline: &str) -> Result<(), StoreError>;
    /// Backfill history (newest first) under the live traffic.
    async fn set_live(&self, timeline: &str, entries: Vec<Bytes>) -> Result<(), StoreError>;
    /// Snapshot all timeline names into the reserved key list.
    async fn make_key_list(&self) -> Result<u64, StoreError>;
    async fn get_keys(&self, offset: u64, count: u64) -> Result<Vec<Bytes>, StoreError>;
    async fn delete_key_list(&self) -> Result<(), StoreError>;
}

/// A logical timeline store at one replica host.
///
/// Routes reads through the read pool and writes through the write pool, and
/// schedules a best-effort trim whenever a write reports a length past the
/// timeline's upper bound.
#[derive(Debug)]
pub struct Shard {
    addr: SocketAddr,
    read_pool: ConnectionPool,
    write_pool: ConnectionPool,
    trim: Arc<TrimConfig>,
}

impl Shard {
    pub fn new(
        addr: SocketAddr,
        read_config: &PoolConfig,
        write_config: &PoolConfig,
        trim: Arc<TrimConfig>,
    ) -> Self {
        // One disable window for the host: an error storm on either pool
        // takes the host out for both.
        let host = Arc::new(HostState::default());
        Self {
            addr,
            read_pool: ConnectionPool::new(addr, read_config, host.clone()),
            write_pool: ConnectionPool::new(addr, write_config, host),
            trim,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host_state(&self) -> Arc<HostState> {
        self.read_pool.host_state()
    }

    pub async fn shutdown(&self) {
        self.read_pool.shutdown().await;
        self.write_pool.shutdown().await;
    }

    fn maybe_trim(&self, client: &crate::client::ReplicaClient, timeline: &str, len: u64) {
        let bounds = self.trim.bounds_for(timeline);
        if len > bounds.upper {
            client.schedule_trim(timeline, bounds.lower);
        }
    }
}

#[async_trait]
impl Timeline for Shard {
    async fn push(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        let len = client.push(timeline, entry).await?;
        self.maybe_trim(&client, timeline, len);
        Ok(())
    }

    async fn pop(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.pop(timeline, entry).await
    }

    async fn push_after(
        &self,
        timeline: &str,
        old: Bytes,
        entry: Bytes,
    ) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        let len = client.push_after(timeline, old, entry).await?;
        if len > 0 {
            self.maybe_trim(&client, timeline, len as u64);
        }
        Ok(())
    }

    async fn get(&self, timeline: &str, offset: u64, len: i64) -> Result<Vec<Bytes>, StoreError> {
        let client = self.read_pool.checkout().await?;
        client.get(timeline, offset, len).await
    }

    async fn size(&self, timeline: &str) -> Result<u64, StoreError> {
        let client = self.read_pool.checkout().await?;
        client.size(timeline).await
    }

    async fn delete(&self, timeline: &str) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.delete(timeline).await
    }

    async fn trim(&self, timeline: &str, size: u64) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.trim(timeline, size).await
    }

    async fn set_atomically(
        &self,
        timeline: &str,
        entries: Vec<Bytes>,
    ) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.set_atomically(timeline, &entries).await
    }

    async fn set_live_start(&self, timeline: &str) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.set_live_start(timeline).await
    }

    async fn set_live(&self, timeline: &str, entries: Vec<Bytes>) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.set_live(timeline, &entries).await
    }

    async fn make_key_list(&self) -> Result<u64, StoreError> {
        let client = self.write_pool.checkout().await?;
        client.make_key_list().await
    }

    async fn get_keys(&self, offset: u64, count: u64) -> Result<Vec<Bytes>, StoreError> {
        let client = self.read_pool.checkout().await?;
        client.get_keys(offset, count).await
    }

    async fn delete_key_list(&self) -> Result<(), StoreError> {
        let client = self.write_pool.checkout().await?;
        client.delete_key_list().await
    }
}
