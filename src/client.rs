//! Pipelined single-connection client to one replica host.
//!
//! A [`ReplicaClient`] multiplexes many concurrent logical calls onto one
//! connection. Callers only enqueue; a single worker task owns the connection
//! and is the only thing that touches the wire. Calls are coalesced into
//! batches (flushed by size or by age of the oldest pending call) and their
//! responses are consumed strictly in submission order, so the inflight deque
//! is the whole bookkeeping.
//!
//! The wait on the pipeline head is a *polling* deadline: a timeout requeues
//! the head at the front and tries again next tick. A call only hard-fails on
//! the shutdown drain or when the connection dies. Hosts with chronic latency
//! are caught by the error-count path, not by per-op timeouts.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh_metrics::{inc, inc_by};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, trace, warn, Instrument};

use crate::config::ClientConfig;
use crate::error::StoreError;
use crate::metrics::Metrics;
use crate::pool::HostState;
use crate::proto::{ClientCodec, Cmd, InsertSide, Reply};
use crate::{EMPTY_SENTINEL, KEY_LIST_KEY};

/// Wait on the staging queue when nothing at all is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

type Responder = oneshot::Sender<Result<Reply, StoreError>>;

/// A call that has been offered but not yet written to the wire.
#[derive(derive_more::Debug)]
struct BatchElement {
    cmd: Cmd,
    /// `None` for worker-internal traffic (heartbeats), which is not charged
    /// against the inflight limit.
    #[debug(skip)]
    responder: Option<Responder>,
    offered_at: Instant,
    /// Poll granularity for this call's response wait, and the bounded wait
    /// it gets on the shutdown drain. Key enumeration scans the whole store
    /// and gets the longer bound.
    wait: Duration,
}

/// A call that is on the wire, awaiting its response.
#[derive(derive_more::Debug)]
struct PipelineElement {
    #[debug(skip)]
    responder: Option<Responder>,
    submitted_at: Instant,
    wait: Duration,
}

#[derive(Debug)]
struct Shared {
    addr: SocketAddr,
    config: ClientConfig,
    alive: AtomicBool,
    /// staging + batch + pipeline, maintained by the handle on submit and the
    /// worker on settle.
    inflight: AtomicUsize,
    error_count: AtomicUsize,
    cancel: CancellationToken,
    host: Arc<HostState>,
}

/// Handle to a pipelined client for one replica host.
///
/// Cheap to clone; all clones feed the same worker. See the module docs for
/// the queueing model.
#[derive(Debug, Clone)]
pub struct ReplicaClient {
    shared: Arc<Shared>,
    staging_tx: mpsc::UnboundedSender<BatchElement>,
    done_rx: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl ReplicaClient {
    /// Connects to `addr` and spawns the connection worker.
    pub async fn connect(
        addr: SocketAddr,
        config: ClientConfig,
        host: Arc<HostState>,
    ) -> Result<Self, StoreError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| StoreError::Protocol(format!("connect to {addr} timed out")))?
            .map_err(|err| StoreError::Protocol(format!("connect to {addr} failed: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| StoreError::Protocol(err.to_string()))?;

        let (staging_tx, staging_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            addr,
            config,
            alive: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            host,
        });
        let actor = Actor {
            framed: Framed::new(stream, ClientCodec),
            staging_rx,
            batch: VecDeque::new(),
            pipeline: VecDeque::new(),
            shared: shared.clone(),
            last_wire_activity: Instant::now(),
            done_tx,
        };
        tokio::spawn(actor.run().instrument(error_span!("replica-client", %addr)));
        inc!(Metrics, clients_created);

        Ok(Self {
            shared,
            staging_tx,
            done_rx: Arc::new(Mutex::new(Some(done_rx))),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Calls currently staged, batched or on the wire.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> usize {
        self.shared.error_count.load(Ordering::Acquire)
    }

    /// Signals the worker to stop and waits until every pending call has been
    /// settled and the connection is closed.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let done = self.done_rx.lock().expect("lock poisoned").take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }

    /// Enqueues a call without waiting for its response.
    ///
    /// Fails synchronously with [`StoreError::Overloaded`] when the inflight
    /// set is at the pipeline limit.
    pub(crate) fn submit(
        &self,
        cmd: Cmd,
    ) -> Result<oneshot::Receiver<Result<Reply, StoreError>>, StoreError> {
        if !self.is_alive() {
            return Err(StoreError::Protocol("client is dead".into()));
        }
        let max = self.shared.config.pipeline_max_size;
        let reserved = self
            .shared
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        if reserved.is_err() {
            inc!(Metrics, ops_overloaded);
            return Err(StoreError::Overloaded);
        }
        let wait = match &cmd {
            Cmd::Keys { .. } => self.shared.config.keys_timeout,
            _ => self.shared.config.call_timeout,
        };
        let (tx, rx) = oneshot::channel();
        let element = BatchElement {
            cmd,
            responder: Some(tx),
            offered_at: Instant::now(),
            wait,
        };
        if self.staging_tx.send(element).is_err() {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(StoreError::Protocol("client worker is gone".into()));
        }
        inc!(Metrics, ops_submitted);
        Ok(rx)
    }

    /// Submits and waits for the response.
    pub(crate) async fn call(&self, cmd: Cmd) -> Result<Reply, StoreError> {
        let rx = self.submit(cmd)?;
        Self::wait_on(rx).await
    }

    /// Waits until the worker settles the call. The worker always does:
    /// success, the bounded per-call wait on the shutdown drain
    /// (`CallTimeout`), or the failure path when the connection dies. The
    /// caller applies no deadline of its own — the head-poll timeout is a
    /// retry granularity, and a slow response must still reach its caller.
    pub(crate) async fn wait_on(
        rx: oneshot::Receiver<Result<Reply, StoreError>>,
    ) -> Result<Reply, StoreError> {
        match rx.await {
            Err(_) => Err(StoreError::Protocol("call dropped by the worker".into())),
            Ok(result) => result,
        }
    }

    // Logical timeline operations.

    /// Appends `entry` iff `timeline` already exists, returning the new
    /// length (0 when the timeline is absent and the entry was dropped).
    ///
    /// Timelines are only ever created by [`Self::set_atomically`] and
    /// [`Self::set_live_start`], which is what makes a retried push against a
    /// deleted timeline a no-op.
    pub async fn push(&self, timeline: &str, entry: Bytes) -> Result<u64, StoreError> {
        let reply = self
            .call(Cmd::RPushX {
                key: key(timeline),
                entry,
            })
            .await?;
        Ok(int_reply(reply)?.max(0) as u64)
    }

    /// Removes every occurrence of `entry`.
    pub async fn pop(&self, timeline: &str, entry: Bytes) -> Result<(), StoreError> {
        let reply = self
            .call(Cmd::LRem {
                key: key(timeline),
                entry,
            })
            .await?;
        int_reply(reply).map(drop)
    }

    /// Inserts `entry` just newer than the nearest-to-tail occurrence of
    /// `old`, returning the new length. Absent `old` is a no-op (the entry it
    /// would have neighbored has been trimmed) and returns a non-positive
    /// length.
    pub async fn push_after(
        &self,
        timeline: &str,
        old: Bytes,
        entry: Bytes,
    ) -> Result<i64, StoreError> {
        let reply = self
            .call(Cmd::LInsert {
                key: key(timeline),
                side: InsertSide::After,
                pivot: old,
                entry,
            })
            .await?;
        int_reply(reply)
    }

    /// Returns up to `len` entries starting `offset` from the newest, in
    /// newest-first order. `len <= 0` means "from offset to the beginning".
    pub async fn get(&self, timeline: &str, offset: u64, len: i64) -> Result<Vec<Bytes>, StoreError> {
        let offset = offset as i64;
        let (start, stop) = if len > 0 {
            (-(offset + len), -(offset + 1))
        } else {
            (0, -(offset + 1))
        };
        let reply = self
            .call(Cmd::LRange {
                key: key(timeline),
                start,
                stop,
            })
            .await?;
        let mut entries = multi_reply(reply)?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn size(&self, timeline: &str) -> Result<u64, StoreError> {
        let reply = self.call(Cmd::LLen { key: key(timeline) }).await?;
        Ok(int_reply(reply)?.max(0) as u64)
    }

    pub async fn delete(&self, timeline: &str) -> Result<(), StoreError> {
        let reply = self.call(Cmd::Del { key: key(timeline) }).await?;
        int_reply(reply).map(drop)
    }

    /// Keeps the newest `size` entries, waiting for the acknowledgement.
    pub async fn trim(&self, timeline: &str, size: u64) -> Result<(), StoreError> {
        let reply = self.call(trim_cmd(timeline, size)).await?;
        status_reply(reply)
    }

    /// Fire-and-forget trim on the pipeline. Failures are logged by the
    /// worker and never reach the caller.
    pub fn schedule_trim(&self, timeline: &str, size: u64) {
        inc!(Metrics, trims_scheduled);
        match self.submit(trim_cmd(timeline, size)) {
            Ok(rx) => drop(rx),
            Err(err) => debug!(timeline, %err, "best-effort trim dropped"),
        }
    }

    /// Installs `entries` (oldest first) as the full contents of `timeline`
    /// without a reader ever seeing a torn state: the list is built under a
    /// unique temp name, then renamed over the target. Empty input is a
    /// no-op; on failure the target is untouched and the temp is left to the
    /// store's eviction.
    pub async fn set_atomically(
        &self,
        timeline: &str,
        entries: &[Bytes],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let temp = self.unique_temp_name(timeline).await?;
        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            pending.push(self.submit(Cmd::RPush {
                key: temp.clone(),
                entry: entry.clone(),
            })?);
        }
        for rx in pending {
            Self::wait_on(rx).await.and_then(int_reply)?;
        }
        let reply = self
            .call(Cmd::Rename {
                key: temp,
                to: key(timeline),
            })
            .await?;
        status_reply(reply)
    }

    /// Deletes `timeline` and recreates it holding exactly the empty
    /// sentinel, so that live pushes land while a copy backfills.
    pub async fn set_live_start(&self, timeline: &str) -> Result<(), StoreError> {
        let del = self.submit(Cmd::Del { key: key(timeline) })?;
        let push = self.submit(Cmd::RPush {
            key: key(timeline),
            entry: Bytes::from_static(EMPTY_SENTINEL),
        })?;
        Self::wait_on(del).await.and_then(int_reply)?;
        Self::wait_on(push).await.and_then(int_reply)?;
        Ok(())
    }

    /// Prepends `entries` (newest first) as history older than everything
    /// already in `timeline`. A left-push-if-exists per entry: without the
    /// sentinel from [`Self::set_live_start`] this is a silent no-op, which
    /// is what keeps a half-started copy from resurrecting a deleted
    /// timeline.
    pub async fn set_live(&self, timeline: &str, entries: &[Bytes]) -> Result<(), StoreError> {
        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            pending.push(self.submit(Cmd::LPushX {
                key: key(timeline),
                entry: entry.clone(),
            })?);
        }
        for rx in pending {
            Self::wait_on(rx).await.and_then(int_reply)?;
        }
        Ok(())
    }

    /// Snapshots every key on the store into the reserved `%keys` list and
    /// returns the count. The trailing length call doubles as a pipeline
    /// flush: when this returns, the list is fully materialized.
    pub async fn make_key_list(&self) -> Result<u64, StoreError> {
        let reply = self
            .call(Cmd::Keys {
                pattern: Bytes::from_static(b"*"),
            })
            .await?;
        let keys = multi_reply(reply)?;

        let list_key = key(KEY_LIST_KEY);
        // Clear any previous snapshot.
        let reply = self
            .call(Cmd::LTrim {
                key: list_key.clone(),
                start: 1,
                stop: 0,
            })
            .await?;
        status_reply(reply)?;

        let mut pending = Vec::with_capacity(keys.len());
        for k in keys {
            if k == list_key {
                continue;
            }
            pending.push(self.submit(Cmd::RPush {
                key: list_key.clone(),
                entry: k,
            })?);
        }
        for rx in pending {
            Self::wait_on(rx).await.and_then(int_reply)?;
        }
        let reply = self.call(Cmd::LLen { key: list_key }).await?;
        let count = int_reply(reply)?.max(0) as u64;
        inc!(Metrics, key_lists_built);
        Ok(count)
    }

    /// A slice of the `%keys` snapshot, in snapshot order.
    pub async fn get_keys(&self, offset: u64, count: u64) -> Result<Vec<Bytes>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let reply = self
            .call(Cmd::LRange {
                key: key(KEY_LIST_KEY),
                start: offset as i64,
                stop: (offset + count - 1) as i64,
            })
            .await?;
        multi_reply(reply)
    }

    pub async fn delete_key_list(&self) -> Result<(), StoreError> {
        self.delete(KEY_LIST_KEY).await
    }

    /// `base + "~" + wallclock millis + "~" + 31 random bits`, re-rolled
    /// until the name is unused.
    async fn unique_temp_name(&self, base: &str) -> Result<Bytes, StoreError> {
        loop {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let salt = rand::random::<u32>() & 0x7fff_ffff;
            let name = Bytes::from(format!("{base}~{millis}~{salt}").into_bytes());
            let reply = self.call(Cmd::Exists { key: name.clone() }).await?;
            if int_reply(reply)? == 0 {
                return Ok(name);
            }
            trace!("temp name collision, retrying");
        }
    }
}

fn key(timeline: &str) -> Bytes {
    Bytes::copy_from_slice(timeline.as_bytes())
}

fn trim_cmd(timeline: &str, size: u64) -> Cmd {
    if size == 0 {
        // Empty range: the store drops the key entirely.
        Cmd::LTrim {
            key: key(timeline),
            start: 1,
            stop: 0,
        }
    } else {
        Cmd::LTrim {
            key: key(timeline),
            start: -(size as i64),
            stop: -1,
        }
    }
}

fn int_reply(reply: Reply) -> Result<i64, StoreError> {
    match reply {
        Reply::Int(v) => Ok(v),
        other => Err(unexpected(other)),
    }
}

fn status_reply(reply: Reply) -> Result<(), StoreError> {
    match reply {
        Reply::Status(_) => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn multi_reply(reply: Reply) -> Result<Vec<Bytes>, StoreError> {
    match reply {
        Reply::Multi(items) => Ok(items),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply {reply:?}"))
}

/// The connection worker.
#[derive(derive_more::Debug)]
struct Actor {
    #[debug(skip)]
    framed: Framed<TcpStream, ClientCodec>,
    #[debug(skip)]
    staging_rx: mpsc::UnboundedReceiver<BatchElement>,
    batch: VecDeque<BatchElement>,
    pipeline: VecDeque<PipelineElement>,
    shared: Arc<Shared>,
    last_wire_activity: Instant,
    #[debug(skip)]
    done_tx: oneshot::Sender<()>,
}

impl Actor {
    async fn run(mut self) {
        debug!("connection worker started");
        let outcome = loop {
            while let Ok(element) = self.staging_rx.try_recv() {
                self.batch.push_back(element);
            }
            if self.shared.cancel.is_cancelled() {
                break Ok(());
            }

            if self.batch_due() {
                if let Err(err) = self.flush_batch().await {
                    break Err(err);
                }
                continue;
            }

            if let Some(head) = self.pipeline.pop_front() {
                let wait = head.wait;
                match tokio::time::timeout(wait, self.framed.next()).await {
                    Err(_) => {
                        // Polling granularity: back to the front, next tick
                        // tries again.
                        inc!(Metrics, pipeline_timeouts);
                        self.pipeline.push_front(head);
                    }
                    Ok(None) => {
                        self.pipeline.push_front(head);
                        break Err(StoreError::Protocol("connection closed by store".into()));
                    }
                    Ok(Some(Err(err))) => {
                        self.pipeline.push_front(head);
                        break Err(StoreError::Protocol(err.to_string()));
                    }
                    Ok(Some(Ok(reply))) => self.deliver(head, reply),
                }
                continue;
            }

            // Nothing on the wire: wait for work, the batch ager, or shutdown.
            let wait = match self.batch.front() {
                Some(oldest) => self
                    .shared
                    .config
                    .batch_timeout
                    .saturating_sub(oldest.offered_at.elapsed()),
                None => IDLE_WAIT,
            };
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break Ok(()),
                element = self.staging_rx.recv() => match element {
                    Some(element) => self.batch.push_back(element),
                    // Every handle is gone.
                    None => break Ok(()),
                },
                _ = tokio::time::sleep(wait) => self.maybe_heartbeat(),
            }
        };

        match outcome {
            Ok(()) => self.graceful_close().await,
            Err(err) => self.die(err).await,
        }
    }

    fn batch_due(&self) -> bool {
        match self.batch.front() {
            None => false,
            Some(oldest) => {
                self.batch.len() >= self.shared.config.batch_size
                    || oldest.offered_at.elapsed() >= self.shared.config.batch_timeout
            }
        }
    }

    /// Writes the whole batch as one wire burst and moves it onto the
    /// pipeline.
    async fn flush_batch(&mut self) -> Result<(), StoreError> {
        let count = self.batch.len();
        while let Some(element) = self.batch.pop_front() {
            let BatchElement {
                cmd,
                responder,
                wait,
                ..
            } = element;
            trace!(?cmd, "submitting");
            let fed = self.framed.feed(cmd).await;
            // Charge the element to the pipeline either way so a failure
            // settles it along with the rest.
            self.pipeline.push_back(PipelineElement {
                responder,
                submitted_at: Instant::now(),
                wait,
            });
            if let Err(err) = fed {
                return Err(StoreError::Protocol(err.to_string()));
            }
        }
        self.framed
            .flush()
            .await
            .map_err(|err| StoreError::Protocol(err.to_string()))?;
        self.last_wire_activity = Instant::now();
        inc!(Metrics, batches_flushed);
        inc_by!(Metrics, batched_ops, count as u64);
        trace!(batch = count, pipeline = self.pipeline.len(), "batch flushed");
        Ok(())
    }

    fn deliver(&mut self, head: PipelineElement, reply: Reply) {
        self.last_wire_activity = Instant::now();
        trace!(latency = ?head.submitted_at.elapsed(), "response delivered");
        inc!(Metrics, replies_delivered);
        let result = match reply {
            Reply::Error(message) => {
                error!(%message, "store reported an execution error");
                inc!(Metrics, execution_errors);
                self.charge_error();
                Err(StoreError::StoreExecution(message))
            }
            reply => Ok(reply),
        };
        self.settle(head.responder, result);
    }

    fn settle(&self, responder: Option<Responder>, result: Result<Reply, StoreError>) {
        if let Some(tx) = responder {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            let _ = tx.send(result);
        }
    }

    /// Bumps the error count; crossing the limit disables the host and shuts
    /// this client down.
    fn charge_error(&self) {
        let count = self.shared.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == self.shared.config.auto_disable_error_limit {
            warn!(errors = count, "error limit crossed, disabling host");
            inc!(Metrics, hosts_disabled);
            self.shared
                .host
                .disable(self.shared.config.auto_disable_duration);
            self.shared.cancel.cancel();
        }
    }

    fn maybe_heartbeat(&mut self) {
        if self.batch.is_empty()
            && self.pipeline.is_empty()
            && self.last_wire_activity.elapsed() >= self.shared.config.heartbeat_interval
        {
            trace!("writing idle heartbeat");
            inc!(Metrics, heartbeats_sent);
            self.batch.push_back(BatchElement {
                cmd: Cmd::Ping,
                responder: None,
                offered_at: Instant::now(),
                wait: self.shared.config.call_timeout,
            });
        }
    }

    /// Shutdown path: submit everything still pending, then deliver each
    /// remaining response with a bounded wait.
    async fn graceful_close(mut self) {
        debug!("shutting down");
        self.shared.alive.store(false, Ordering::Release);
        self.staging_rx.close();
        while let Ok(element) = self.staging_rx.try_recv() {
            self.batch.push_back(element);
        }
        match self.drain().await {
            Ok(()) => {
                let _ = self.framed.feed(Cmd::Quit).await;
                let _ = self.framed.flush().await;
            }
            Err(err) => {
                warn!(%err, "connection failed during shutdown drain");
                self.settle_all(err);
            }
        }
        let _ = self.done_tx.send(());
        debug!("connection worker stopped");
    }

    async fn drain(&mut self) -> Result<(), StoreError> {
        if !self.batch.is_empty() {
            self.flush_batch().await?;
        }
        while let Some(head) = self.pipeline.pop_front() {
            let wait = head.wait;
            match tokio::time::timeout(wait, self.framed.next()).await {
                Err(_) => {
                    inc!(Metrics, pipeline_timeouts);
                    self.charge_error();
                    self.settle(head.responder, Err(StoreError::CallTimeout));
                }
                Ok(None) => {
                    self.pipeline.push_front(head);
                    return Err(StoreError::Protocol("connection closed by store".into()));
                }
                Ok(Some(Err(err))) => {
                    self.pipeline.push_front(head);
                    return Err(StoreError::Protocol(err.to_string()));
                }
                Ok(Some(Ok(reply))) => self.deliver(head, reply),
            }
        }
        Ok(())
    }

    /// Failure path: the connection is unusable, fail every pending call.
    async fn die(mut self, err: StoreError) {
        error!(%err, "replica client died");
        inc!(Metrics, protocol_errors);
        inc!(Metrics, clients_died);
        self.shared.alive.store(false, Ordering::Release);
        self.charge_error();
        self.staging_rx.close();
        while let Ok(element) = self.staging_rx.try_recv() {
            self.batch.push_back(element);
        }
        self.settle_all(err);
        let _ = self.done_tx.send(());
    }

    fn settle_all(&mut self, err: StoreError) {
        while let Some(element) = self.pipeline.pop_front() {
            self.settle(element.responder, Err(err.clone()));
        }
        while let Some(element) = self.batch.pop_front() {
            self.settle(element.responder, Err(err.clone()));
        }
    }
}
