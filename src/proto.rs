//! Wire protocol for the downstream in-memory list store.
//!
//! The store speaks a RESP-style protocol: requests are arrays of bulk
//! strings, replies are status/error lines, integers, bulk strings or arrays
//! of bulk strings. Only the capabilities this system uses are modeled.
//!
//! Both directions live here: [`ClientCodec`] encodes [`Cmd`] and decodes
//! [`Reply`] (used by the replica client), [`ServerCodec`] is the inverse
//! (used by the in-memory dev store). The decoders are incremental and leave
//! partial frames in the buffer untouched.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for a single entry or key on the wire.
pub const MAX_BULK_SIZE: usize = 1024 * 1024;
/// Upper bound for the element count of an array frame.
pub const MAX_MULTI_LEN: usize = 1024 * 1024;

/// Which side of the pivot an insert lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertSide {
    Before,
    After,
}

/// A command understood by the list store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Exists { key: Bytes },
    /// Right-push, creating the list if absent.
    RPush { key: Bytes, entry: Bytes },
    /// Right-push only if the list already exists.
    RPushX { key: Bytes, entry: Bytes },
    /// Left-push only if the list already exists.
    LPushX { key: Bytes, entry: Bytes },
    /// Remove every occurrence of `entry`.
    LRem { key: Bytes, entry: Bytes },
    /// Insert `entry` next to the rightmost occurrence of `pivot`.
    LInsert {
        key: Bytes,
        side: InsertSide,
        pivot: Bytes,
        entry: Bytes,
    },
    /// Slice by index, negative indices counting from the tail.
    LRange { key: Bytes, start: i64, stop: i64 },
    LLen { key: Bytes },
    /// Keep only the slice `start..=stop`. An empty range removes the key.
    LTrim { key: Bytes, start: i64, stop: i64 },
    Del { key: Bytes },
    Rename { key: Bytes, to: Bytes },
    Keys { pattern: Bytes },
    Ping,
    Quit,
}

impl Cmd {
    fn args(&self) -> Vec<Bytes> {
        fn int(v: i64) -> Bytes {
            Bytes::from(v.to_string())
        }
        match self {
            Cmd::Exists { key } => vec![Bytes::from_static(b"EXISTS"), key.clone()],
            Cmd::RPush { key, entry } => {
                vec![Bytes::from_static(b"RPUSH"), key.clone(), entry.clone()]
            }
            Cmd::RPushX { key, entry } => {
                vec![Bytes::from_static(b"RPUSHX"), key.clone(), entry.clone()]
            }
            Cmd::LPushX { key, entry } => {
                vec![Bytes::from_static(b"LPUSHX"), key.clone(), entry.clone()]
            }
            Cmd::LRem { key, entry } => vec![
                Bytes::from_static(b"LREM"),
                key.clone(),
                int(0),
                entry.clone(),
            ],
            Cmd::LInsert {
                key,
                side,
                pivot,
                entry,
            } => vec![
                Bytes::from_static(b"LINSERT"),
                key.clone(),
                Bytes::from_static(match side {
                    InsertSide::Before => b"BEFORE",
                    InsertSide::After => b"AFTER",
                }),
                pivot.clone(),
                entry.clone(),
            ],
            Cmd::LRange { key, start, stop } => vec![
                Bytes::from_static(b"LRANGE"),
                key.clone(),
                int(*start),
                int(*stop),
            ],
            Cmd::LLen { key } => vec![Bytes::from_static(b"LLEN"), key.clone()],
            Cmd::LTrim { key, start, stop } => vec![
                Bytes::from_static(b"LTRIM"),
                key.clone(),
                int(*start),
                int(*stop),
            ],
            Cmd::Del { key } => vec![Bytes::from_static(b"DEL"), key.clone()],
            Cmd::Rename { key, to } => {
                vec![Bytes::from_static(b"RENAME"), key.clone(), to.clone()]
            }
            Cmd::Keys { pattern } => vec![Bytes::from_static(b"KEYS"), pattern.clone()],
            Cmd::Ping => vec![Bytes::from_static(b"PING")],
            Cmd::Quit => vec![Bytes::from_static(b"QUIT")],
        }
    }

    /// Reassemble a command from the argument vector of a request frame.
    fn parse(args: Vec<Bytes>) -> io::Result<Cmd> {
        fn want(args: &[Bytes], n: usize) -> io::Result<()> {
            if args.len() != n {
                return Err(invalid(format!(
                    "wrong number of arguments: got {}, want {n}",
                    args.len()
                )));
            }
            Ok(())
        }
        fn int_arg(arg: &Bytes) -> io::Result<i64> {
            std::str::from_utf8(arg)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| invalid("argument is not an integer"))
        }

        let Some(name) = args.first() else {
            return Err(invalid("empty request"));
        };
        let name = name.to_ascii_uppercase();
        let cmd = match name.as_slice() {
            b"EXISTS" => {
                want(&args, 2)?;
                Cmd::Exists {
                    key: args[1].clone(),
                }
            }
            b"RPUSH" => {
                want(&args, 3)?;
                Cmd::RPush {
                    key: args[1].clone(),
                    entry: args[2].clone(),
                }
            }
            b"RPUSHX" => {
                want(&args, 3)?;
                Cmd::RPushX {
                    key: args[1].clone(),
                    entry: args[2].clone(),
                }
            }
            b"LPUSHX" => {
                want(&args, 3)?;
                Cmd::LPushX {
                    key: args[1].clone(),
                    entry: args[2].clone(),
                }
            }
            b"LREM" => {
                want(&args, 4)?;
                if int_arg(&args[2])? != 0 {
                    return Err(invalid("only LREM count 0 is supported"));
                }
                Cmd::LRem {
                    key: args[1].clone(),
                    entry: args[3].clone(),
                }
            }
            b"LINSERT" => {
                want(&args, 5)?;
                let side = match args[2].to_ascii_uppercase().as_slice() {
                    b"BEFORE" => InsertSide::Before,
                    b"AFTER" => InsertSide::After,
                    _ => return Err(invalid("LINSERT side must be BEFORE or AFTER")),
                };
                Cmd::LInsert {
                    key: args[1].clone(),
                    side,
                    pivot: args[3].clone(),
                    entry: args[4].clone(),
                }
            }
            b"LRANGE" => {
                want(&args, 4)?;
                Cmd::LRange {
                    key: args[1].clone(),
                    start: int_arg(&args[2])?,
                    stop: int_arg(&args[3])?,
                }
            }
            b"LLEN" => {
                want(&args, 2)?;
                Cmd::LLen {
                    key: args[1].clone(),
                }
            }
            b"LTRIM" => {
                want(&args, 4)?;
                Cmd::LTrim {
                    key: args[1].clone(),
                    start: int_arg(&args[2])?,
                    stop: int_arg(&args[3])?,
                }
            }
            b"DEL" => {
                want(&args, 2)?;
                Cmd::Del {
                    key: args[1].clone(),
                }
            }
            b"RENAME" => {
                want(&args, 3)?;
                Cmd::Rename {
                    key: args[1].clone(),
                    to: args[2].clone(),
                }
            }
            b"KEYS" => {
                want(&args, 2)?;
                Cmd::Keys {
                    pattern: args[1].clone(),
                }
            }
            b"PING" => {
                want(&args, 1)?;
                Cmd::Ping
            }
            b"QUIT" => {
                want(&args, 1)?;
                Cmd::Quit
            }
            _ => {
                return Err(invalid(format!(
                    "unknown command {:?}",
                    String::from_utf8_lossy(&name)
                )))
            }
        };
        Ok(cmd)
    }
}

/// A reply from the list store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Int(i64),
    Bulk(Option<Bytes>),
    Multi(Vec<Bytes>),
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Cursor over an undecoded buffer. Returns `None` from its accessors while
/// the frame is still incomplete.
struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next CRLF-terminated line, without the terminator.
    fn line(&mut self) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let idx = rest.windows(2).position(|w| w == b"\r\n")?;
        self.pos += idx + 2;
        Some(&rest[..idx])
    }

    /// Exactly `n` payload bytes followed by CRLF.
    fn take(&mut self, n: usize) -> io::Result<Option<&'a [u8]>> {
        let rest = &self.buf[self.pos..];
        if rest.len() < n + 2 {
            return Ok(None);
        }
        if &rest[n..n + 2] != b"\r\n" {
            return Err(invalid("bulk payload not CRLF terminated"));
        }
        self.pos += n + 2;
        Ok(Some(&rest[..n]))
    }

    fn int_line(&mut self) -> io::Result<Option<i64>> {
        let Some(line) = self.line() else {
            return Ok(None);
        };
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| invalid("malformed integer line"))
    }
}

fn parse_bulk(p: &mut Parser<'_>) -> io::Result<Option<Option<Bytes>>> {
    let Some(len) = p.int_line()? else {
        return Ok(None);
    };
    if len < 0 {
        return Ok(Some(None));
    }
    let len = len as usize;
    if len > MAX_BULK_SIZE {
        return Err(invalid("bulk exceeds MAX_BULK_SIZE"));
    }
    match p.take(len)? {
        None => Ok(None),
        Some(data) => Ok(Some(Some(Bytes::copy_from_slice(data)))),
    }
}

fn parse_reply(p: &mut Parser<'_>) -> io::Result<Option<Reply>> {
    let Some(&kind) = p.buf.get(p.pos) else {
        return Ok(None);
    };
    p.pos += 1;
    match kind {
        b'+' => {
            let Some(line) = p.line() else {
                return Ok(None);
            };
            Ok(Some(Reply::Status(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b'-' => {
            let Some(line) = p.line() else {
                return Ok(None);
            };
            Ok(Some(Reply::Error(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b':' => {
            let Some(v) = p.int_line()? else {
                return Ok(None);
            };
            Ok(Some(Reply::Int(v)))
        }
        b'$' => match parse_bulk(p)? {
            None => Ok(None),
            Some(bulk) => Ok(Some(Reply::Bulk(bulk))),
        },
        b'*' => {
            let Some(n) = p.int_line()? else {
                return Ok(None);
            };
            if n < 0 || n as usize > MAX_MULTI_LEN {
                return Err(invalid("bad array length"));
            }
            let mut items = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let Some(&b'$') = p.buf.get(p.pos) else {
                    return match p.buf.get(p.pos) {
                        None => Ok(None),
                        Some(_) => Err(invalid("array element is not a bulk string")),
                    };
                };
                p.pos += 1;
                match parse_bulk(p)? {
                    None => return Ok(None),
                    // Nil elements do not occur in the capability set.
                    Some(None) => return Err(invalid("nil element in array reply")),
                    Some(Some(data)) => items.push(data),
                }
            }
            Ok(Some(Reply::Multi(items)))
        }
        other => Err(invalid(format!("unknown reply marker {other:#x}"))),
    }
}

fn write_args(dst: &mut BytesMut, args: &[Bytes]) {
    let mut header = fmt_int(args.len() as i64);
    header.insert(0, '*');
    dst.reserve(header.len() + 2 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    dst.put_slice(header.as_bytes());
    dst.put_slice(b"\r\n");
    for arg in args {
        dst.put_u8(b'$');
        dst.put_slice(fmt_int(arg.len() as i64).as_bytes());
        dst.put_slice(b"\r\n");
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

fn fmt_int(v: i64) -> String {
    v.to_string()
}

/// Client side: encodes commands, decodes replies.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Encoder<Cmd> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, cmd: Cmd, dst: &mut BytesMut) -> io::Result<()> {
        write_args(dst, &cmd.args());
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Reply;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Reply>> {
        let mut p = Parser::new(src);
        match parse_reply(&mut p)? {
            None => Ok(None),
            Some(reply) => {
                let consumed = p.pos;
                let _ = src.split_to(consumed);
                Ok(Some(reply))
            }
        }
    }
}

/// Server side: decodes commands, encodes replies.
#[derive(Debug, Default)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = Cmd;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Cmd>> {
        let mut p = Parser::new(src);
        let Some(&b'*') = p.buf.get(p.pos) else {
            return match p.buf.get(p.pos) {
                None => Ok(None),
                Some(_) => Err(invalid("request is not an array frame")),
            };
        };
        p.pos += 1;
        let Some(n) = p.int_line()? else {
            return Ok(None);
        };
        if n <= 0 || n as usize > MAX_MULTI_LEN {
            return Err(invalid("bad request arity"));
        }
        let mut args = Vec::with_capacity(n as usize);
        for _ in 0..n {
            match p.buf.get(p.pos) {
                None => return Ok(None),
                Some(&b'$') => p.pos += 1,
                Some(_) => return Err(invalid("request argument is not a bulk string")),
            }
            match parse_bulk(&mut p)? {
                None => return Ok(None),
                Some(None) => return Err(invalid("nil request argument")),
                Some(Some(data)) => args.push(data),
            }
        }
        let consumed = p.pos;
        let _ = src.split_to(consumed);
        Cmd::parse(args).map(Some)
    }
}

impl Encoder<Reply> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> io::Result<()> {
        match reply {
            Reply::Status(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Int(v) => {
                dst.put_u8(b':');
                dst.put_slice(fmt_int(v).as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(None) => dst.put_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                dst.put_u8(b'$');
                dst.put_slice(fmt_int(data.len() as i64).as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(&data);
                dst.put_slice(b"\r\n");
            }
            Reply::Multi(items) => {
                dst.put_u8(b'*');
                dst.put_slice(fmt_int(items.len() as i64).as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    dst.put_u8(b'$');
                    dst.put_slice(fmt_int(item.len() as i64).as_bytes());
                    dst.put_slice(b"\r\n");
                    dst.put_slice(&item);
                    dst.put_slice(b"\r\n");
                }
            }
        }
        Ok(())
    }
}
