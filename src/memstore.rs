//! In-memory list store for timeline-store.
//!
//! This is an in-memory implementation of the downstream list-store protocol
//! and thus can be used as a drop-in replacement for the backing store during
//! development and in tests. It is not optimised at all.
//!
//! Commands are handled sequentially per connection; connections contend on
//! one lock around the whole keyspace.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::proto::{Cmd, InsertSide, Reply, ServerCodec};

type Keyspace = HashMap<Bytes, VecDeque<Bytes>>;

/// Handle to a running [`MemStore`] task.
///
/// Dropping the handle leaves the store running; call
/// [`MemStoreHandle::shutdown`] to stop it.
#[derive(Debug)]
pub struct MemStoreHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MemStoreHandle {
    /// The address the store is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shuts the store down gracefully.
    pub fn shutdown(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle
    }
}

/// An in-memory list store.
#[derive(Debug, Default)]
pub struct MemStore;

impl MemStore {
    /// Binds `addr` (use port 0 for an ephemeral port) and spawns the accept
    /// loop.
    pub async fn spawn(addr: SocketAddr) -> Result<MemStoreHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .context("memstore bind failed")?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let state: Arc<Mutex<Keyspace>> = Default::default();

        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            debug!(%addr, "memstore listening");
            loop {
                let conn = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    conn = listener.accept() => conn,
                };
                match conn {
                    Ok((stream, peer)) => {
                        trace!(%peer, "memstore connection accepted");
                        let state = state.clone();
                        let conn_cancel = loop_cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_conn(stream, state, conn_cancel).await {
                                debug!(%peer, "memstore connection closed: {err:#}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("memstore accept failed: {err}");
                        break;
                    }
                }
            }
            debug!(%addr, "memstore stopped");
        });

        Ok(MemStoreHandle {
            addr,
            cancel,
            handle,
        })
    }
}

async fn serve_conn(
    stream: TcpStream,
    state: Arc<Mutex<Keyspace>>,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, ServerCodec);
    loop {
        let cmd = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = framed.next() => cmd,
        };
        let cmd = match cmd {
            None => break,
            Some(Ok(cmd)) => cmd,
            Some(Err(err)) => {
                let _ = framed.send(Reply::Error(format!("ERR {err}"))).await;
                break;
            }
        };
        trace!(?cmd, "memstore command");
        let quit = matches!(cmd, Cmd::Quit);
        let reply = {
            let mut keyspace = state.lock().expect("memstore lock poisoned");
            apply(&mut keyspace, cmd)
        };
        framed.send(reply).await?;
        if quit {
            break;
        }
    }
    Ok(())
}

fn apply(keyspace: &mut Keyspace, cmd: Cmd) -> Reply {
    match cmd {
        Cmd::Exists { key } => Reply::Int(keyspace.contains_key(&key) as i64),
        Cmd::RPush { key, entry } => {
            let list = keyspace.entry(key).or_default();
            list.push_back(entry);
            Reply::Int(list.len() as i64)
        }
        Cmd::RPushX { key, entry } => match keyspace.get_mut(&key) {
            None => Reply::Int(0),
            Some(list) => {
                list.push_back(entry);
                Reply::Int(list.len() as i64)
            }
        },
        Cmd::LPushX { key, entry } => match keyspace.get_mut(&key) {
            None => Reply::Int(0),
            Some(list) => {
                list.push_front(entry);
                Reply::Int(list.len() as i64)
            }
        },
        Cmd::LRem { key, entry } => match keyspace.get_mut(&key) {
            None => Reply::Int(0),
            Some(list) => {
                let before = list.len();
                list.retain(|e| *e != entry);
                let removed = before - list.len();
                if list.is_empty() {
                    keyspace.remove(&key);
                }
                Reply::Int(removed as i64)
            }
        },
        Cmd::LInsert {
            key,
            side,
            pivot,
            entry,
        } => match keyspace.get_mut(&key) {
            None => Reply::Int(0),
            // Rightmost occurrence: with newest at the tail this is the
            // nearest-to-tail match.
            Some(list) => match list.iter().rposition(|e| *e == pivot) {
                None => Reply::Int(-1),
                Some(idx) => {
                    let at = match side {
                        InsertSide::Before => idx,
                        InsertSide::After => idx + 1,
                    };
                    list.insert(at, entry);
                    Reply::Int(list.len() as i64)
                }
            },
        },
        Cmd::LRange { key, start, stop } => match keyspace.get(&key) {
            None => Reply::Multi(Vec::new()),
            Some(list) => {
                let (start, stop) = normalize_range(list.len(), start, stop);
                let items = if start > stop {
                    Vec::new()
                } else {
                    list.iter()
                        .skip(start)
                        .take(stop - start + 1)
                        .cloned()
                        .collect()
                };
                Reply::Multi(items)
            }
        },
        Cmd::LLen { key } => Reply::Int(keyspace.get(&key).map_or(0, |l| l.len()) as i64),
        Cmd::LTrim { key, start, stop } => {
            if let Some(list) = keyspace.get_mut(&key) {
                let (start, stop) = normalize_range(list.len(), start, stop);
                if start > stop {
                    keyspace.remove(&key);
                } else {
                    list.truncate(stop + 1);
                    list.drain(..start);
                }
            }
            Reply::Status("OK".into())
        }
        Cmd::Del { key } => Reply::Int(keyspace.remove(&key).is_some() as i64),
        Cmd::Rename { key, to } => match keyspace.remove(&key) {
            None => Reply::Error("ERR no such key".into()),
            Some(list) => {
                keyspace.insert(to, list);
                Reply::Status("OK".into())
            }
        },
        Cmd::Keys { pattern } => {
            let keys = keyspace
                .keys()
                .filter(|k| pattern_match(&pattern, k))
                .cloned()
                .collect();
            Reply::Multi(keys)
        }
        Cmd::Ping => Reply::Status("PONG".into()),
        Cmd::Quit => Reply::Status("OK".into()),
    }
}

/// Resolve possibly-negative inclusive range indices against `len`.
///
/// Returns `(start, stop)` with `start > stop` encoding the empty range.
fn normalize_range(len: usize, start: i64, stop: i64) -> (usize, usize) {
    let len = len as i64;
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if start > stop || start >= len || stop < 0 {
        // Canonical empty range.
        (1, 0)
    } else {
        (start as usize, stop as usize)
    }
}

fn pattern_match(pattern: &Bytes, key: &Bytes) -> bool {
    // Only the match-all pattern and literal names are needed here.
    pattern.as_ref() == b"*" || pattern == key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn list(keyspace: &Keyspace, key: &'static str) -> Vec<Bytes> {
        keyspace
            .get(&b(key))
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[test]
    fn push_variants() {
        let mut ks = Keyspace::default();
        assert_eq!(apply(&mut ks, Cmd::RPushX { key: b("t"), entry: b("x") }), Reply::Int(0));
        assert_eq!(apply(&mut ks, Cmd::LPushX { key: b("t"), entry: b("x") }), Reply::Int(0));
        assert!(ks.is_empty());

        assert_eq!(apply(&mut ks, Cmd::RPush { key: b("t"), entry: b("a") }), Reply::Int(1));
        assert_eq!(apply(&mut ks, Cmd::RPushX { key: b("t"), entry: b("b") }), Reply::Int(2));
        assert_eq!(apply(&mut ks, Cmd::LPushX { key: b("t"), entry: b("z") }), Reply::Int(3));
        assert_eq!(list(&ks, "t"), vec![b("z"), b("a"), b("b")]);
    }

    #[test]
    fn lrem_removes_all_occurrences() {
        let mut ks = Keyspace::default();
        for e in ["a", "b", "a", "c", "a"] {
            apply(&mut ks, Cmd::RPush { key: b("t"), entry: b(e) });
        }
        assert_eq!(apply(&mut ks, Cmd::LRem { key: b("t"), entry: b("a") }), Reply::Int(3));
        assert_eq!(list(&ks, "t"), vec![b("b"), b("c")]);
        // Removing the rest drops the key entirely.
        apply(&mut ks, Cmd::LRem { key: b("t"), entry: b("b") });
        apply(&mut ks, Cmd::LRem { key: b("t"), entry: b("c") });
        assert_eq!(apply(&mut ks, Cmd::Exists { key: b("t") }), Reply::Int(0));
    }

    #[test]
    fn linsert_matches_rightmost_pivot() {
        let mut ks = Keyspace::default();
        for e in ["p", "x", "p", "y"] {
            apply(&mut ks, Cmd::RPush { key: b("t"), entry: b(e) });
        }
        let reply = apply(
            &mut ks,
            Cmd::LInsert {
                key: b("t"),
                side: InsertSide::After,
                pivot: b("p"),
                entry: b("n"),
            },
        );
        assert_eq!(reply, Reply::Int(5));
        assert_eq!(list(&ks, "t"), vec![b("p"), b("x"), b("p"), b("n"), b("y")]);

        let missing = apply(
            &mut ks,
            Cmd::LInsert {
                key: b("t"),
                side: InsertSide::Before,
                pivot: b("nope"),
                entry: b("n"),
            },
        );
        assert_eq!(missing, Reply::Int(-1));
    }

    #[test]
    fn lrange_negative_indices() {
        let mut ks = Keyspace::default();
        for e in ["a", "b", "c", "d"] {
            apply(&mut ks, Cmd::RPush { key: b("t"), entry: b(e) });
        }
        let tail = apply(&mut ks, Cmd::LRange { key: b("t"), start: -2, stop: -1 });
        assert_eq!(tail, Reply::Multi(vec![b("c"), b("d")]));
        let clamped = apply(&mut ks, Cmd::LRange { key: b("t"), start: -100, stop: 100 });
        assert_eq!(clamped, Reply::Multi(vec![b("a"), b("b"), b("c"), b("d")]));
        // Window entirely before the list start is empty.
        let empty = apply(&mut ks, Cmd::LRange { key: b("t"), start: -100, stop: -5 });
        assert_eq!(empty, Reply::Multi(Vec::new()));
    }

    #[test]
    fn ltrim_keeps_tail_and_empty_range_deletes() {
        let mut ks = Keyspace::default();
        for e in ["a", "b", "c", "d", "e"] {
            apply(&mut ks, Cmd::RPush { key: b("t"), entry: b(e) });
        }
        apply(&mut ks, Cmd::LTrim { key: b("t"), start: -3, stop: -1 });
        assert_eq!(list(&ks, "t"), vec![b("c"), b("d"), b("e")]);

        apply(&mut ks, Cmd::LTrim { key: b("t"), start: 1, stop: 0 });
        assert_eq!(apply(&mut ks, Cmd::Exists { key: b("t") }), Reply::Int(0));
    }

    #[test]
    fn rename_overwrites_target() {
        let mut ks = Keyspace::default();
        apply(&mut ks, Cmd::RPush { key: b("a"), entry: b("1") });
        apply(&mut ks, Cmd::RPush { key: b("old"), entry: b("2") });
        assert_eq!(
            apply(&mut ks, Cmd::Rename { key: b("old"), to: b("a") }),
            Reply::Status("OK".into())
        );
        assert_eq!(list(&ks, "a"), vec![b("2")]);
        assert_eq!(
            apply(&mut ks, Cmd::Rename { key: b("gone"), to: b("a") }),
            Reply::Error("ERR no such key".into())
        );
    }
}
