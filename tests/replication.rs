//! End-to-end scenarios against in-memory backing stores.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tracing_subscriber::{prelude::*, EnvFilter};

use timeline_store::config::{Config, PoolConfig, ReplicaConfig};
use timeline_store::memstore::{MemStore, MemStoreHandle};
use timeline_store::pool::HostState;
use timeline_store::trim::Bounds;
use timeline_store::{ReplicaClient, ReplicatingShard, StoreError, Timeline, EMPTY_SENTINEL};

fn setup_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init();
}

fn entry(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn sentinel() -> Bytes {
    Bytes::from_static(EMPTY_SENTINEL)
}

fn fast_pool() -> PoolConfig {
    PoolConfig {
        batch_timeout_ms: 2,
        timeout_ms: 100,
        keys_timeout_ms: 500,
        connect_timeout_ms: 500,
        pool_timeout_ms: 500,
        ..Default::default()
    }
}

fn test_config(replicas: Vec<ReplicaConfig>) -> Config {
    let mut config = Config {
        read_pool: fast_pool(),
        write_pool: fast_pool(),
        replicas,
        ..Default::default()
    };
    config.trim.default = Bounds::new(3, 5);
    config.jobs.retry_delay_ms = 20;
    config
}

async fn spawn_replicas(n: usize) -> Result<(Vec<MemStoreHandle>, ReplicatingShard)> {
    let mut stores = Vec::with_capacity(n);
    let mut replicas = Vec::with_capacity(n);
    for _ in 0..n {
        let store = MemStore::spawn("127.0.0.1:0".parse()?).await?;
        replicas.push(ReplicaConfig {
            addr: store.addr().to_string(),
            weight: 1,
        });
        stores.push(store);
    }
    let shard = ReplicatingShard::from_config(&test_config(replicas))?;
    Ok((stores, shard))
}

async fn teardown(stores: Vec<MemStoreHandle>, shard: ReplicatingShard) -> Result<()> {
    shard.shutdown().await;
    for store in stores {
        store.shutdown().await?;
    }
    Ok(())
}

#[tokio::test]
async fn append_and_get() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(2).await?;

    shard
        .set_atomically("home:42", vec![entry("E1"), entry("E2"), entry("E3")])
        .await?;
    assert_eq!(
        shard.get("home:42", 0, 10).await?,
        vec![entry("E3"), entry("E2"), entry("E1")]
    );
    assert_eq!(shard.size("home:42").await?, 3);

    // A push lands as the newest entry on every replica.
    shard.push("home:42", entry("E4")).await?;
    assert_eq!(
        shard.get("home:42", 0, 1).await?[0],
        entry("E4"),
        "a successful push must be the first element of a subsequent get"
    );

    teardown(stores, shard).await
}

#[tokio::test]
async fn insert_before_a_trimmed_away_neighbor_is_skipped() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(1).await?;

    shard
        .set_atomically("home:42", vec![entry("E1"), entry("E2"), entry("E3")])
        .await?;
    shard
        .push_after("home:42", entry("gone"), entry("Ex"))
        .await?;
    assert_eq!(shard.size("home:42").await?, 3);

    teardown(stores, shard).await
}

#[tokio::test]
async fn insert_before() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(2).await?;

    shard
        .set_atomically("home:42", vec![entry("E1"), entry("E2"), entry("E3")])
        .await?;
    shard
        .push_after("home:42", entry("E2"), entry("E2b"))
        .await?;
    assert_eq!(
        shard.get("home:42", 0, 10).await?,
        vec![entry("E3"), entry("E2b"), entry("E2"), entry("E1")]
    );

    teardown(stores, shard).await
}

#[tokio::test]
async fn live_copy() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(2).await?;

    // Destination side of a migration: the sentinel makes the timeline
    // exist, so live pushes land while history is still being copied.
    shard.set_live_start("home:99").await?;
    assert_eq!(shard.size("home:99").await?, 1);
    assert_eq!(shard.get("home:99", 0, 10).await?, vec![sentinel()]);

    shard.push("home:99", entry("L1")).await?;
    shard.push("home:99", entry("L2")).await?;

    // The backfill prepends history older than the live traffic.
    shard
        .set_live("home:99", vec![entry("H1"), entry("H2")])
        .await?;

    assert_eq!(
        shard.get("home:99", 0, 10).await?,
        vec![entry("L2"), entry("L1"), sentinel(), entry("H1"), entry("H2")]
    );

    teardown(stores, shard).await
}

#[tokio::test]
async fn backfill_without_the_sentinel_step_is_a_noop() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(1).await?;

    // Without set_live_start neither live pushes nor the backfill create the
    // timeline, so a half-started copy cannot resurrect a deleted one.
    shard.push("home:7", entry("L1")).await?;
    shard.set_live("home:7", vec![entry("H1")]).await?;
    assert_eq!(shard.size("home:7").await?, 0);

    teardown(stores, shard).await
}

#[tokio::test]
async fn crossing_the_upper_bound_trims_to_the_lower_bound() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(1).await?;

    let seed: Vec<Bytes> = (1..=6).map(|i| entry(&format!("E{i}"))).collect();
    shard.set_atomically("home:1", seed).await?;
    // The seventh entry crosses upper=5; the trim runs behind the write.
    shard.push("home:1", entry("E7")).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(shard.size("home:1").await?, 3);
    assert_eq!(
        shard.get("home:1", 0, 3).await?,
        vec![entry("E7"), entry("E6"), entry("E5")]
    );

    teardown(stores, shard).await
}

#[tokio::test]
async fn backpressure_rejects_the_submission_past_the_limit() -> Result<()> {
    setup_logging();
    // A host that accepts and never responds keeps every call inflight.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let silent = tokio::spawn(async move {
        let mut conns = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            conns.push(stream);
        }
    });

    let mut config = fast_pool().client_config();
    config.pipeline_max_size = 2;
    let client = ReplicaClient::connect(addr, config, Arc::new(HostState::default())).await?;

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.push("t", entry("E1")).await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.push("t", entry("E2")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.inflight(), 2);

    let err = client.push("t", entry("E3")).await.unwrap_err();
    assert_eq!(err, StoreError::Overloaded);

    first.abort();
    second.abort();
    silent.abort();
    Ok(())
}

#[tokio::test]
async fn a_dead_host_is_disabled_after_the_error_limit() -> Result<()> {
    setup_logging();
    let store = MemStore::spawn("127.0.0.1:0".parse()?).await?;
    let mut config = test_config(vec![ReplicaConfig {
        addr: store.addr().to_string(),
        weight: 1,
    }]);
    config.write_pool.auto_disable_error_limit = 1;
    config.read_pool.auto_disable_error_limit = 1;
    let shard = ReplicatingShard::from_config(&config)?;

    shard.set_atomically("home:1", vec![entry("E1")]).await?;
    store.shutdown().await?;

    // The first write after the store died charges the fatal error, which
    // crosses the limit of 1 and disables the host.
    let err = shard.push("home:1", entry("E2")).await.unwrap_err();
    assert_ne!(err, StoreError::HostDown);

    assert_eq!(
        shard.push("home:1", entry("E3")).await.unwrap_err(),
        StoreError::HostDown
    );
    assert_eq!(
        shard.get("home:1", 0, 10).await.unwrap_err(),
        StoreError::HostDown
    );

    shard.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn retried_writes_are_idempotent() -> Result<()> {
    setup_logging();
    let (stores, shard) = spawn_replicas(1).await?;

    shard
        .set_atomically("home:1", vec![entry("a"), entry("b"), entry("a")])
        .await?;

    // pop removes every occurrence, so a repeat changes nothing.
    shard.pop("home:1", entry("a")).await?;
    shard.pop("home:1", entry("a")).await?;
    assert_eq!(shard.get("home:1", 0, 10).await?, vec![entry("b")]);

    // delete twice, then a replayed push finds no timeline and is dropped.
    shard.delete("home:1").await?;
    shard.delete("home:1").await?;
    shard.push("home:1", entry("c")).await?;
    assert_eq!(shard.size("home:1").await?, 0);

    teardown(stores, shard).await
}

#[tokio::test]
async fn key_list_snapshot() -> Result<()> {
    setup_logging();
    // One replica: the snapshot is a per-store structure, built and read on
    // the same host.
    let (stores, shard) = spawn_replicas(1).await?;

    shard.set_atomically("home:1", vec![entry("a")]).await?;
    shard.set_atomically("mentions:1", vec![entry("b")]).await?;

    let count = shard.make_key_list().await?;
    assert_eq!(count, 2);
    let mut keys = shard.get_keys(0, 10).await?;
    keys.sort();
    assert_eq!(keys, vec![entry("home:1"), entry("mentions:1")]);
    shard.delete_key_list().await?;

    teardown(stores, shard).await
}
