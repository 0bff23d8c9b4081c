//! Metrics for timeline-store

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Enum of metrics for the module
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub ops_submitted: Counter,
    pub ops_overloaded: Counter,
    pub batches_flushed: Counter,
    pub batched_ops: Counter,
    pub replies_delivered: Counter,
    pub pipeline_timeouts: Counter,
    pub execution_errors: Counter,
    pub protocol_errors: Counter,
    pub heartbeats_sent: Counter,

    pub clients_created: Counter,
    pub clients_died: Counter,
    pub hosts_disabled: Counter,
    pub pool_timeouts: Counter,

    pub writes_fanned_out: Counter,
    pub write_replica_failures: Counter,
    pub reads_served: Counter,
    pub trims_scheduled: Counter,
    pub key_lists_built: Counter,

    pub jobs_enqueued: Counter,
    pub jobs_retried: Counter,
    pub jobs_dead: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            ops_submitted: Counter::new("Number of calls offered to a replica client"),
            ops_overloaded: Counter::new("Number of calls rejected at the pipeline limit"),
            batches_flushed: Counter::new("Number of batches written to the wire"),
            batched_ops: Counter::new("Number of calls submitted inside batches"),
            replies_delivered: Counter::new("Number of responses dispatched to callers"),
            pipeline_timeouts: Counter::new("Number of waits on the pipeline head that timed out"),
            execution_errors: Counter::new("Number of store-reported call failures"),
            protocol_errors: Counter::new("Number of connection-fatal protocol failures"),
            heartbeats_sent: Counter::new("Number of idle heartbeats written"),

            clients_created: Counter::new("Number of replica clients connected"),
            clients_died: Counter::new("Number of replica clients shut down dead"),
            hosts_disabled: Counter::new("Number of times a host entered its disable window"),
            pool_timeouts: Counter::new("Number of checkouts that exceeded the pool timeout"),

            writes_fanned_out: Counter::new("Number of write operations fanned out to replicas"),
            write_replica_failures: Counter::new("Number of per-replica write failures"),
            reads_served: Counter::new("Number of reads served from a replica"),
            trims_scheduled: Counter::new("Number of best-effort trims scheduled"),
            key_lists_built: Counter::new("Number of key-list snapshots built"),

            jobs_enqueued: Counter::new("Number of retry jobs enqueued"),
            jobs_retried: Counter::new("Number of retry job attempts"),
            jobs_dead: Counter::new("Number of jobs sent to the bad-jobs log"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "timeline-store"
    }
}
