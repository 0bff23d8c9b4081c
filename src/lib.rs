//! Sharded, replicated timeline store.
//!
//! A timeline is a named, bounded, ordered sequence of opaque byte entries
//! (a home feed, a mentions list), newest at the tail, backed by one or more
//! in-memory list stores. Writes fan out to every replica of a shard; reads
//! are served from a single, weight-selected replica.
//!
//! The moving parts, leaves first:
//! - [`client::ReplicaClient`]: a pipelined single-connection client. One
//!   worker task owns the connection; callers enqueue and get their response
//!   through a per-call channel.
//! - [`pool::ConnectionPool`]: per-host client pool with auto-disable on
//!   error storms.
//! - [`shard::Shard`]: the timeline operations against one replica, with
//!   read/write pool routing and bounded timeline lengths.
//! - [`replication::ReplicatingShard`]: write fan-out with any-success
//!   semantics and retryable jobs, weighted read selection, and the bulk
//!   replace / live copy protocol.
//! - [`memstore::MemStore`]: an in-memory backing store speaking the wire
//!   protocol, for development and tests.
//!
//! Both shard types implement the [`shard::Timeline`] capability set, so
//! drivers are agnostic to whether they talk to one replica or a set.

pub mod client;
pub mod config;
pub mod error;
pub mod jobs;
pub mod memstore;
pub mod metrics;
pub mod pool;
pub mod proto;
pub mod replication;
pub mod shard;
pub mod trim;

pub use crate::client::ReplicaClient;
pub use crate::config::Config;
pub use crate::error::StoreError;
pub use crate::replication::ReplicatingShard;
pub use crate::shard::{Shard, Timeline};

/// Reserved entry value marking a timeline that exists but has not been
/// backfilled yet (see the live copy protocol on
/// [`client::ReplicaClient::set_live_start`]).
pub const EMPTY_SENTINEL: &[u8] = &[0u8; 8];

/// Reserved key holding the key-list snapshot. The only system-owned key.
pub const KEY_LIST_KEY: &str = "%keys";

/// Default port of the backing list store.
pub const DEFAULT_STORE_PORT: u16 = 6379;
