//! Retryable write jobs.
//!
//! A write that fails on one replica while succeeding on another is encoded
//! as a JSON job and handed to a job sink; the scheduler behind the sink
//! re-applies it against the failed replica with bounded retries. Every write
//! op is idempotent, so re-applying a job that in fact landed is harmless.
//!
//! The production scheduler framework is external; [`MemJobQueue`] is the
//! in-memory variant used in development and tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use data_encoding::HEXLOWER;
use iroh_metrics::inc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::{debug, error, error_span, trace, Instrument};

use crate::config::JobConfig;
use crate::error::StoreError;
use crate::metrics::Metrics;
use crate::shard::{Shard, Timeline};

/// Opaque entry bytes inside a JSON job, hex on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Bytes);

impl From<Bytes> for HexBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = HEXLOWER
            .decode(raw.as_bytes())
            .map_err(|err| D::Error::custom(format!("invalid hex entry: {err}")))?;
        Ok(Self(Bytes::from(bytes)))
    }
}

/// The retryable write operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Push { entry: HexBytes },
    Pop { entry: HexBytes },
    PushAfter { old: HexBytes, entry: HexBytes },
    Delete,
}

/// One failed replica write, keyed by replica address, timeline and op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteJob {
    pub addr: String,
    pub timeline: String,
    #[serde(flatten)]
    pub op: WriteOp,
}

/// Where the replicating shard hands its failed replica writes.
pub trait JobSink: Send + Sync + std::fmt::Debug {
    fn enqueue(&self, job: WriteJob);
}

/// Sink that drops jobs after logging them. For callers that run without a
/// scheduler.
#[derive(Debug, Default, Clone)]
pub struct NoopJobSink;

impl JobSink for NoopJobSink {
    fn enqueue(&self, job: WriteJob) {
        debug!(?job, "dropping write job, no scheduler configured");
    }
}

/// In-memory job scheduler: one worker, fixed retry delay, bounded attempts.
/// Jobs that exhaust their attempts are written to the `bad_jobs` log target
/// and dropped; the queue itself never stops.
#[derive(Debug, Clone)]
pub struct MemJobQueue {
    tx: mpsc::UnboundedSender<(WriteJob, usize)>,
}

impl MemJobQueue {
    /// Spawns the worker over the given replica shards, keyed by address.
    pub fn spawn(shards: HashMap<SocketAddr, Arc<Shard>>, config: JobConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            shards,
            config,
            tx: tx.clone(),
            rx,
        };
        tokio::spawn(worker.run().instrument(error_span!("write-jobs")));
        Self { tx }
    }
}

impl JobSink for MemJobQueue {
    fn enqueue(&self, job: WriteJob) {
        inc!(Metrics, jobs_enqueued);
        trace!(?job, "write job enqueued");
        // A send failure means the worker is gone, which only happens at
        // teardown.
        let _ = self.tx.send((job, 0));
    }
}

#[derive(derive_more::Debug)]
struct Worker {
    shards: HashMap<SocketAddr, Arc<Shard>>,
    config: JobConfig,
    #[debug(skip)]
    tx: mpsc::UnboundedSender<(WriteJob, usize)>,
    #[debug(skip)]
    rx: mpsc::UnboundedReceiver<(WriteJob, usize)>,
}

impl Worker {
    async fn run(mut self) {
        debug!("write job worker started");
        while let Some((job, attempt)) = self.rx.recv().await {
            inc!(Metrics, jobs_retried);
            match self.apply(&job).await {
                Ok(()) => trace!(?job, attempt, "write job applied"),
                Err(err) => {
                    let attempt = attempt + 1;
                    if attempt >= self.config.error_limit {
                        inc!(Metrics, jobs_dead);
                        let encoded = serde_json::to_string(&job).unwrap_or_default();
                        error!(
                            target: "bad_jobs",
                            job = %encoded,
                            %err,
                            "write job exhausted its retries"
                        );
                    } else {
                        debug!(?job, attempt, %err, "write job failed, will retry");
                        let tx = self.tx.clone();
                        let delay = self.config.retry_delay();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send((job, attempt));
                        });
                    }
                }
            }
        }
    }

    async fn apply(&self, job: &WriteJob) -> Result<(), StoreError> {
        let addr: SocketAddr = job
            .addr
            .parse()
            .map_err(|_| StoreError::Protocol(format!("bad job address {:?}", job.addr)))?;
        let shard = self
            .shards
            .get(&addr)
            .ok_or(StoreError::HostDown)?
            .clone();
        match &job.op {
            WriteOp::Push { entry } => shard.push(&job.timeline, entry.0.clone()).await,
            WriteOp::Pop { entry } => shard.pop(&job.timeline, entry.0.clone()).await,
            WriteOp::PushAfter { old, entry } => {
                shard
                    .push_after(&job.timeline, old.0.clone(), entry.0.clone())
                    .await
            }
            WriteOp::Delete => shard.delete(&job.timeline).await,
        }
    }
}
