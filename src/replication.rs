//! Fan-out across replicas.
//!
//! A [`ReplicatingShard`] dispatches every write to every replica and
//! succeeds iff at least one replica took it; failed replicas get a retry job
//! instead of failing the caller. Reads go to a single replica, chosen by
//! weight-proportional random selection among hosts that are not disabled,
//! with sequential fallback.
//!
//! Replicas never coordinate: there is no cross-replica ordering, only the
//! idempotency of the write ops. `Overloaded` is the one error that never
//! becomes a job, it is backpressure for the caller.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use iroh_metrics::inc;
use rand::Rng;
use tracing::warn;

use crate::config::Config;
use crate::error::StoreError;
use crate::jobs::{JobSink, MemJobQueue, WriteJob, WriteOp};
use crate::metrics::Metrics;
use crate::shard::{Shard, Timeline};

#[derive(Debug)]
struct Replica {
    shard: Arc<Shard>,
    weight: u32,
}

/// A logical shard fanned out over a replica set.
#[derive(Debug)]
pub struct ReplicatingShard {
    replicas: Vec<Replica>,
    jobs: Arc<dyn JobSink>,
}

impl ReplicatingShard {
    pub fn new(replicas: Vec<(Arc<Shard>, u32)>, jobs: Arc<dyn JobSink>) -> Self {
        let replicas = replicas
            .into_iter()
            .map(|(shard, weight)| Replica { shard, weight })
            .collect();
        Self { replicas, jobs }
    }

    /// Builds the replica set, its shards and an in-memory write job queue
    /// from a [`Config`].
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let trim = Arc::new(config.trim.clone());
        let mut replicas = Vec::with_capacity(config.replicas.len());
        let mut by_addr = HashMap::new();
        for replica in &config.replicas {
            let addr: SocketAddr = replica
                .addr
                .parse()
                .with_context(|| format!("bad replica address {:?}", replica.addr))?;
            let shard = Arc::new(Shard::new(
                addr,
                &config.read_pool,
                &config.write_pool,
                trim.clone(),
            ));
            by_addr.insert(addr, shard.clone());
            replicas.push((shard, replica.weight));
        }
        let jobs = Arc::new(MemJobQueue::spawn(by_addr, config.jobs.clone()));
        Ok(Self::new(replicas, jobs))
    }

    pub fn shards(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.replicas.iter().map(|replica| &replica.shard)
    }

    pub async fn shutdown(&self) {
        for replica in &self.replicas {
            replica.shard.shutdown().await;
        }
    }

    /// Runs `op` against every replica concurrently. Success iff at least
    /// one replica succeeded; each failed replica gets `job_op` requeued
    /// against it (when the op is one of the retryable four and the failure
    /// was not backpressure).
    async fn fan_out<F, Fut>(
        &self,
        timeline: &str,
        job_op: Option<WriteOp>,
        op: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(Arc<Shard>) -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        inc!(Metrics, writes_fanned_out);
        let attempts = self.replicas.iter().map(|replica| {
            let shard = replica.shard.clone();
            let fut = op(shard.clone());
            async move { (shard, fut.await) }
        });
        let mut success = false;
        let mut last_err = None;
        for (shard, result) in join_all(attempts).await {
            match result {
                Ok(()) => success = true,
                Err(err) => {
                    inc!(Metrics, write_replica_failures);
                    warn!(replica = %shard.addr(), %err, "replica write failed");
                    if err.is_retryable() {
                        if let Some(op) = &job_op {
                            self.jobs.enqueue(WriteJob {
                                addr: shard.addr().to_string(),
                                timeline: timeline.to_owned(),
                                op: op.clone(),
                            });
                        }
                    }
                    last_err = Some(err);
                }
            }
        }
        if success {
            Ok(())
        } else {
            Err(last_err.unwrap_or(StoreError::HostDown))
        }
    }

    /// Replica indices in read-preference order: weighted random among
    /// non-disabled hosts.
    fn read_order(&self) -> Vec<usize> {
        let mut rng = rand::thread_rng();
        let mut candidates: Vec<(usize, u64)> = self
            .replicas
            .iter()
            .enumerate()
            .filter(|(_, replica)| !replica.shard.host_state().is_disabled())
            .map(|(idx, replica)| (idx, u64::from(replica.weight.max(1))))
            .collect();
        let mut order = Vec::with_capacity(candidates.len());
        while !candidates.is_empty() {
            let total: u64 = candidates.iter().map(|(_, weight)| weight).sum();
            let mut roll = rng.gen_range(0..total);
            let mut pick = candidates.len() - 1;
            for (idx, (_, weight)) in candidates.iter().enumerate() {
                if roll < *weight {
                    pick = idx;
                    break;
                }
                roll -= *weight;
            }
            order.push(candidates.remove(pick).0);
        }
        order
    }

    /// Runs `op` against replicas in read-preference order until one
    /// succeeds.
    async fn read_from<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<Shard>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let order = self.read_order();
        if order.is_empty() {
            return Err(StoreError::HostDown);
        }
        let mut last_err = None;
        for idx in order {
            let shard = self.replicas[idx].shard.clone();
            match op(shard.clone()).await {
                Ok(value) => {
                    inc!(Metrics, reads_served);
                    return Ok(value);
                }
                Err(err) => {
                    warn!(replica = %shard.addr(), %err, "read failed, trying next replica");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(StoreError::HostDown))
    }
}

#[async_trait]
impl Timeline for ReplicatingShard {
    async fn push(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError> {
        let job = WriteOp::Push {
            entry: entry.clone().into(),
        };
        self.fan_out(timeline, Some(job), |shard| {
            let timeline = timeline.to_owned();
            let entry = entry.clone();
            async move { shard.push(&timeline, entry).await }
        })
        .await
    }

    async fn pop(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError> {
        let job = WriteOp::Pop {
            entry: entry.clone().into(),
        };
        self.fan_out(timeline, Some(job), |shard| {
            let timeline = timeline.to_owned();
            let entry = entry.clone();
            async move { shard.pop(&timeline, entry).await }
        })
        .await
    }

    async fn push_after(
        &self,
        timeline: &str,
        old: Bytes,
        entry: Bytes,
    ) -> Result<(), StoreError> {
        let job = WriteOp::PushAfter {
            old: old.clone().into(),
            entry: entry.clone().into(),
        };
        self.fan_out(timeline, Some(job), |shard| {
            let timeline = timeline.to_owned();
            let old = old.clone();
            let entry = entry.clone();
            async move { shard.push_after(&timeline, old, entry).await }
        })
        .await
    }

    async fn get(&self, timeline: &str, offset: u64, len: i64) -> Result<Vec<Bytes>, StoreError> {
        self.read_from(|shard| {
            let timeline = timeline.to_owned();
            async move { shard.get(&timeline, offset, len).await }
        })
        .await
    }

    async fn size(&self, timeline: &str) -> Result<u64, StoreError> {
        self.read_from(|shard| {
            let timeline = timeline.to_owned();
            async move { shard.size(&timeline).await }
        })
        .await
    }

    async fn delete(&self, timeline: &str) -> Result<(), StoreError> {
        self.fan_out(timeline, Some(WriteOp::Delete), |shard| {
            let timeline = timeline.to_owned();
            async move { shard.delete(&timeline).await }
        })
        .await
    }

    async fn trim(&self, timeline: &str, size: u64) -> Result<(), StoreError> {
        self.fan_out(timeline, None, |shard| {
            let timeline = timeline.to_owned();
            async move { shard.trim(&timeline, size).await }
        })
        .await
    }

    async fn set_atomically(
        &self,
        timeline: &str,
        entries: Vec<Bytes>,
    ) -> Result<(), StoreError> {
        self.fan_out(timeline, None, |shard| {
            let timeline = timeline.to_owned();
            let entries = entries.clone();
            async move { shard.set_atomically(&timeline, entries).await }
        })
        .await
    }

    async fn set_live_start(&self, timeline: &str) -> Result<(), StoreError> {
        self.fan_out(timeline, None, |shard| {
            let timeline = timeline.to_owned();
            async move { shard.set_live_start(&timeline).await }
        })
        .await
    }

    async fn set_live(&self, timeline: &str, entries: Vec<Bytes>) -> Result<(), StoreError> {
        self.fan_out(timeline, None, |shard| {
            let timeline = timeline.to_owned();
            let entries = entries.clone();
            async move { shard.set_live(&timeline, entries).await }
        })
        .await
    }

    // Key-list maintenance through the replicating shard operates on one
    // selected replica; migration drivers that need a specific store address
    // its shard directly.

    async fn make_key_list(&self) -> Result<u64, StoreError> {
        self.read_from(|shard| async move { shard.make_key_list().await })
            .await
    }

    async fn get_keys(&self, offset: u64, count: u64) -> Result<Vec<Bytes>, StoreError> {
        self.read_from(|shard| async move { shard.get_keys(offset, count).await })
            .await
    }

    async fn delete_key_list(&self) -> Result<(), StoreError> {
        self.read_from(|shard| async move { shard.delete_key_list().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;

    use super::*;
    use crate::config::PoolConfig;
    use crate::jobs::NoopJobSink;
    use crate::memstore::{MemStore, MemStoreHandle};
    use crate::trim::TrimConfig;

    #[derive(Debug, Default)]
    struct RecordingSink {
        jobs: Mutex<Vec<WriteJob>>,
    }

    impl JobSink for RecordingSink {
        fn enqueue(&self, job: WriteJob) {
            self.jobs.lock().expect("lock poisoned").push(job);
        }
    }

    fn entry(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn test_shard(addr: SocketAddr) -> Arc<Shard> {
        let pool = PoolConfig {
            batch_timeout_ms: 2,
            timeout_ms: 100,
            connect_timeout_ms: 500,
            pool_timeout_ms: 500,
            ..Default::default()
        };
        Arc::new(Shard::new(
            addr,
            &pool,
            &pool,
            Arc::new(TrimConfig::default()),
        ))
    }

    async fn two_replicas() -> Result<(MemStoreHandle, MemStoreHandle, Arc<RecordingSink>, ReplicatingShard)>
    {
        let a = MemStore::spawn("127.0.0.1:0".parse()?).await?;
        let b = MemStore::spawn("127.0.0.1:0".parse()?).await?;
        let sink = Arc::new(RecordingSink::default());
        let shard = ReplicatingShard::new(
            vec![(test_shard(a.addr()), 1), (test_shard(b.addr()), 1)],
            sink.clone(),
        );
        Ok((a, b, sink, shard))
    }

    #[tokio::test]
    async fn writes_land_on_every_replica() -> Result<()> {
        let (a, b, sink, shard) = two_replicas().await?;

        shard
            .set_atomically("home:1", vec![entry("e1"), entry("e2")])
            .await?;
        shard.push("home:1", entry("e3")).await?;

        for replica in shard.shards() {
            assert_eq!(
                replica.get("home:1", 0, 10).await?,
                vec![entry("e3"), entry("e2"), entry("e1")]
            );
        }
        assert!(sink.jobs.lock().expect("lock poisoned").is_empty());

        shard.shutdown().await;
        a.shutdown().await?;
        b.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn partial_failure_succeeds_and_enqueues_a_job() -> Result<()> {
        let (a, b, sink, shard) = two_replicas().await?;
        shard.set_atomically("home:1", vec![entry("e1")]).await?;

        // Take replica b down; the write must still succeed via a.
        let b_addr = b.addr();
        b.shutdown().await?;
        shard.push("home:1", entry("e2")).await?;

        let jobs = sink.jobs.lock().expect("lock poisoned").clone();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].addr, b_addr.to_string());
        assert_eq!(jobs[0].timeline, "home:1");
        assert_eq!(
            jobs[0].op,
            WriteOp::Push {
                entry: entry("e2").into()
            }
        );

        shard.shutdown().await;
        a.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn total_failure_propagates_the_error() -> Result<()> {
        let (a, b, _sink, shard) = two_replicas().await?;
        a.shutdown().await?;
        b.shutdown().await?;

        let err = shard.push("home:1", entry("x")).await.unwrap_err();
        assert!(err.is_retryable());

        shard.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn reads_fall_back_to_the_next_replica() -> Result<()> {
        let (a, b, _sink, shard) = two_replicas().await?;
        shard.set_atomically("home:1", vec![entry("e1")]).await?;

        a.shutdown().await?;
        // Whichever replica is tried first, the read must come back.
        for _ in 0..5 {
            assert_eq!(shard.get("home:1", 0, 10).await?, vec![entry("e1")]);
        }

        shard.shutdown().await;
        b.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn disabled_hosts_are_not_read_candidates() -> Result<()> {
        let (a, b, _sink, shard) = two_replicas().await?;

        shard.replicas[0]
            .shard
            .host_state()
            .disable(Duration::from_secs(60));
        for _ in 0..10 {
            assert_eq!(shard.read_order(), vec![1]);
        }
        shard.replicas[1]
            .shard
            .host_state()
            .disable(Duration::from_secs(60));
        assert_eq!(shard.get("t", 0, 1).await.unwrap_err(), StoreError::HostDown);

        shard.shutdown().await;
        a.shutdown().await?;
        b.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_replica_set_is_host_down() -> Result<()> {
        let shard = ReplicatingShard::new(Vec::new(), Arc::new(NoopJobSink));
        assert_eq!(
            shard.push("t", entry("x")).await.unwrap_err(),
            StoreError::HostDown
        );
        assert_eq!(shard.size("t").await.unwrap_err(), StoreError::HostDown);
        Ok(())
    }
}
