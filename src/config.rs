//! Configuration for the timeline store.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all, in tests) is fine. Configuration is immutable after
//! construction, components capture what they need at build time.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::trim::TrimConfig;

/// Runtime tunables for a single replica client. Durations resolved from the
/// millisecond fields of [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Calls coalesced before a forced batch submission.
    pub batch_size: usize,
    /// Max age of the oldest pending call before a forced submission.
    pub batch_timeout: Duration,
    /// Granularity of the wait on the pipeline head. A timeout here requeues
    /// the head and tries again next tick; a call only hard-fails on the
    /// shutdown drain or a dead connection.
    pub call_timeout: Duration,
    /// Head-poll granularity and shutdown-drain bound for key enumeration,
    /// which scans the whole store and answers far slower than list calls.
    pub keys_timeout: Duration,
    /// Total inflight (staging + batch + pipeline) past which submissions are
    /// rejected with `Overloaded`.
    pub pipeline_max_size: usize,
    /// Cumulative charged errors after which the client shuts itself down and
    /// the host enters its disable window.
    pub auto_disable_error_limit: usize,
    /// Length of the disable window.
    pub auto_disable_duration: Duration,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// Idle gap after which the worker writes a PING.
    pub heartbeat_interval: Duration,
    /// Per-timeline TTL hint. The capability set of the backing store has no
    /// expire command; the store is volatile by contract, so this is carried
    /// for the config surface and not acted on.
    pub expiration: Duration,
}

/// Pool and client settings for one pool (read and write pools are separate
/// instances with an identical schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub pool_timeout_ms: u64,
    /// Batch size: calls coalesced into one wire burst.
    pub pipeline: usize,
    pub pipeline_max_size: usize,
    pub batch_timeout_ms: u64,
    /// Per-call response wait.
    pub timeout_ms: u64,
    pub keys_timeout_ms: u64,
    pub expiration_hours: u64,
    pub auto_disable_error_limit: usize,
    pub auto_disable_duration_s: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_s: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            pool_timeout_ms: 1000,
            pipeline: 100,
            pipeline_max_size: 1000,
            batch_timeout_ms: 20,
            timeout_ms: 200,
            keys_timeout_ms: 5000,
            expiration_hours: 21 * 24,
            auto_disable_error_limit: 200,
            auto_disable_duration_s: 60,
            connect_timeout_ms: 50,
            heartbeat_s: 300,
        }
    }
}

impl PoolConfig {
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            batch_size: self.pipeline,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            call_timeout: Duration::from_millis(self.timeout_ms),
            keys_timeout: Duration::from_millis(self.keys_timeout_ms),
            pipeline_max_size: self.pipeline_max_size,
            auto_disable_error_limit: self.auto_disable_error_limit,
            auto_disable_duration: Duration::from_secs(self.auto_disable_duration_s),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_s),
            expiration: Duration::from_secs(self.expiration_hours * 3600),
        }
    }
}

/// Retry settings for the write job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Attempts before a job is diverted to the bad-jobs log.
    pub error_limit: usize,
    pub retry_delay_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            error_limit: 25,
            retry_delay_ms: 60_000,
        }
    }
}

impl JobConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One replica backing a replicating shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// `host:port` of the backing list store.
    pub addr: String,
    /// Read selection weight. Writes always fan out to every replica.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub read_pool: PoolConfig,
    pub write_pool: PoolConfig,
    pub trim: TrimConfig,
    pub jobs: JobConfig,
    /// Page size hint for range-scanning drivers (copy/migration). Not used
    /// by the store itself.
    pub range_query_page_size: usize,
    pub replicas: Vec<ReplicaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_pool: PoolConfig::default(),
            write_pool: PoolConfig::default(),
            trim: TrimConfig::default(),
            jobs: JobConfig::default(),
            range_query_page_size: 1000,
            replicas: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("config path {} is not a file", path.display());
        }
        let raw = std::fs::read_to_string(path).context("unable to read config")?;
        let config: Config = toml::from_str(&raw).context("unable to decode config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(err) = self.trim.validate() {
            bail!("invalid trim config: {err}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.read_pool.pipeline, 100);
        assert_eq!(config.jobs.error_limit, 25);
    }

    #[test]
    fn partial_toml() {
        let config: Config = toml::from_str(
            r#"
            range_query_page_size = 50

            [write_pool]
            pipeline_max_size = 2

            [trim.bounds.home]
            lower = 3
            upper = 5

            [[replicas]]
            addr = "127.0.0.1:6379"
            "#,
        )
        .unwrap();
        assert_eq!(config.range_query_page_size, 50);
        assert_eq!(config.write_pool.pipeline_max_size, 2);
        assert_eq!(config.write_pool.pool_size, 1);
        assert_eq!(config.trim.bounds_for("home:1").upper, 5);
        assert_eq!(config.replicas[0].weight, 1);
    }
}
