//! Replication coordinator.
//!
//! The master side tracks each replica connection through a strict
//! handshake state machine; only connections that have completed it
//! receive propagated writes. The replica side mirrors the handshake as a
//! client against its configured master, ingests the snapshot frame, and
//! then applies propagated write commands to the local keyspace.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::command::Request;
use crate::keyspace::now_ms;
use crate::resp::{Message, RespError};
use crate::server::ServerState;

#[derive(Error, Debug, PartialEq)]
pub enum HandshakeError {
    #[error("handshake command out of order")]
    OutOfOrder,
    #[error("invalid listening-port value")]
    InvalidListeningPort,
    #[error("unsupported capability")]
    UnsupportedCapability,
    #[error("unsupported REPLCONF option")]
    UnsupportedReplconfOption,
    #[error("unsupported PSYNC request")]
    UnsupportedPsync,
    #[error("failed to sync with master: {0}")]
    FailedSyncHandshake(String),
}

/// Master-side view of a replica connection's handshake progress.
///
/// Transitions are strictly ordered; skipping a step or repeating an
/// earlier one is a handshake violation and closes the connection. A
/// plain client never advances past `InitialPing`, which is harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationState {
    None,
    InitialPing,
    FirstReplconf { port: u16 },
    SecondReplconf { port: u16, capa: String },
    ReceivingSync { port: u16, capa: String },
    ConnectedReplica { port: u16, capa: String },
}

impl ReplicationState {
    /// The first PING on a connection starts the machine. Later pings
    /// and non-handshake commands leave it untouched.
    pub fn observe_ping(&mut self) {
        if matches!(self, ReplicationState::None) {
            *self = ReplicationState::InitialPing;
        }
    }

    pub fn apply_replconf(&mut self, args: &[&str]) -> Result<(), HandshakeError> {
        match args[0].to_ascii_lowercase().as_str() {
            "listening-port" => {
                if !matches!(self, ReplicationState::InitialPing) {
                    return Err(HandshakeError::OutOfOrder);
                }

                let port = args[1]
                    .parse::<u16>()
                    .map_err(|_| HandshakeError::InvalidListeningPort)?;

                *self = ReplicationState::FirstReplconf { port };
                Ok(())
            }
            "capa" => {
                let port = match self {
                    ReplicationState::FirstReplconf { port } => *port,
                    _ => return Err(HandshakeError::OutOfOrder),
                };

                if !args[1].eq_ignore_ascii_case("psync2") {
                    return Err(HandshakeError::UnsupportedCapability);
                }

                *self = ReplicationState::SecondReplconf {
                    port,
                    capa: args[1].to_ascii_lowercase(),
                };
                Ok(())
            }
            _ => Err(HandshakeError::UnsupportedReplconfOption),
        }
    }

    pub fn apply_psync(&mut self, replid: &str, offset: i64) -> Result<(), HandshakeError> {
        let (port, capa) = match self {
            ReplicationState::SecondReplconf { port, capa } => (*port, capa.clone()),
            _ => return Err(HandshakeError::OutOfOrder),
        };

        if replid != "?" || offset != -1 {
            return Err(HandshakeError::UnsupportedPsync);
        }

        *self = ReplicationState::ReceivingSync { port, capa };
        Ok(())
    }

    /// Called once the RDB frame has been written in full; only then does
    /// the connection join the propagation set.
    pub fn complete_sync(&mut self) -> Result<(), HandshakeError> {
        let (port, capa) = match self {
            ReplicationState::ReceivingSync { port, capa } => (*port, capa.clone()),
            _ => return Err(HandshakeError::OutOfOrder),
        };

        *self = ReplicationState::ConnectedReplica { port, capa };
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ReplicationState::ConnectedReplica { .. })
    }
}

/// The upstream connection a replica holds after a successful handshake.
pub struct MasterLink {
    stream: TcpStream,
    buffer: BytesMut,
    pub replid: String,
}

/// Performs the replica side of the handshake against the master.
///
/// Runs before the replica accepts any client connection. Any deviation
/// from the expected exchange is a startup error.
pub async fn sync_with_master(
    master_address: &str,
    listening_port: u16,
) -> Result<MasterLink, HandshakeError> {
    info!(master = master_address, "connecting to master");

    let mut stream = TcpStream::connect(master_address)
        .await
        .map_err(|e| HandshakeError::FailedSyncHandshake(format!("connect: {}", e)))?;
    let mut buffer = BytesMut::with_capacity(512);

    let reply = exchange(&mut stream, &mut buffer, &[b"PING"]).await?;
    if reply != "PONG" {
        return Err(unexpected_reply("PING", &reply));
    }

    let port = listening_port.to_string();
    let reply = exchange(
        &mut stream,
        &mut buffer,
        &[b"REPLCONF", b"listening-port", port.as_bytes()],
    )
    .await?;
    if reply != "OK" {
        return Err(unexpected_reply("REPLCONF listening-port", &reply));
    }

    let reply = exchange(&mut stream, &mut buffer, &[b"REPLCONF", b"capa", b"psync2"]).await?;
    if reply != "OK" {
        return Err(unexpected_reply("REPLCONF capa", &reply));
    }

    let reply = exchange(&mut stream, &mut buffer, &[b"PSYNC", b"?", b"-1"]).await?;
    let replid = parse_fullresync(&reply)?;

    let snapshot = read_rdb_frame(&mut stream, &mut buffer).await?;
    debug!(bytes = snapshot.len(), "discarded snapshot payload");
    info!(replid = %replid, "synchronized with master");

    Ok(MasterLink {
        stream,
        buffer,
        replid,
    })
}

/// Applies the master's propagated write commands to the local keyspace.
///
/// Propagated commands get no reply; the replication offset advances by
/// the byte length of every ingested frame.
pub async fn serve_master_link(mut link: MasterLink, shared: Rc<RefCell<ServerState>>) {
    loop {
        loop {
            let consumed = {
                let buf = &link.buffer[..];

                if buf.is_empty() {
                    break;
                }

                match Message::parse(buf) {
                    Ok((message, consumed)) => {
                        apply_from_master(&message, &shared);
                        consumed
                    }
                    Err(RespError::Truncated) => break,
                    Err(error) => {
                        warn!(%error, "malformed bytes from master, dropping link");
                        return;
                    }
                }
            };

            shared.borrow_mut().master_repl_offset += consumed as i64;
            link.buffer.advance(consumed);
        }

        match link.stream.read_buf(&mut link.buffer).await {
            Ok(0) => {
                warn!("master closed the replication link");
                return;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "replication link error");
                return;
            }
        }
    }
}

fn apply_from_master(message: &Message<'_>, shared: &Rc<RefCell<ServerState>>) {
    match Request::parse(message, now_ms()) {
        Ok(Request::Set {
            key,
            value,
            deadline_ms,
        }) => {
            let mut state = shared.borrow_mut();

            match deadline_ms {
                Some(deadline) => state.keyspace.put_with_expiry(key.as_bytes(), value, deadline),
                None => state.keyspace.put(key.as_bytes(), value),
            }

            debug!(key, "applied write from master");
        }
        // pings and other master chatter need no reply and no state
        Ok(_) => {}
        Err(error) => debug!(%error, "ignoring unparseable command from master"),
    }
}

async fn exchange(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    words: &[&[u8]],
) -> Result<String, HandshakeError> {
    let command = Message::Array(words.iter().map(|word| Message::Bulk(*word)).collect());

    stream
        .write_all(&command.encode())
        .await
        .map_err(|e| HandshakeError::FailedSyncHandshake(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| HandshakeError::FailedSyncHandshake(e.to_string()))?;

    loop {
        let parsed = match Message::parse(&buffer[..]) {
            Ok((Message::Simple(text), consumed)) => Some((text.to_string(), consumed)),
            Ok((other, _)) => {
                return Err(HandshakeError::FailedSyncHandshake(format!(
                    "unexpected reply shape: {:?}",
                    other
                )))
            }
            Err(RespError::Truncated) => None,
            Err(error) => return Err(HandshakeError::FailedSyncHandshake(error.to_string())),
        };

        if let Some((text, consumed)) = parsed {
            buffer.advance(consumed);
            return Ok(text);
        }

        let read = stream
            .read_buf(buffer)
            .await
            .map_err(|e| HandshakeError::FailedSyncHandshake(e.to_string()))?;

        if read == 0 {
            return Err(HandshakeError::FailedSyncHandshake(
                "master closed the connection".to_string(),
            ));
        }
    }
}

fn unexpected_reply(stage: &str, reply: &str) -> HandshakeError {
    HandshakeError::FailedSyncHandshake(format!("unexpected {} reply: {}", stage, reply))
}

fn parse_fullresync(reply: &str) -> Result<String, HandshakeError> {
    let parts: Vec<&str> = reply.split_whitespace().collect();

    if parts.len() != 3 || parts[0] != "FULLRESYNC" {
        return Err(HandshakeError::FailedSyncHandshake(format!(
            "unexpected PSYNC reply: {}",
            reply
        )));
    }

    let replid_pattern = Regex::new(r"^[0-9a-fA-F]{40}$").unwrap();

    if !replid_pattern.is_match(parts[1]) {
        return Err(HandshakeError::FailedSyncHandshake(format!(
            "invalid replication id: {}",
            parts[1]
        )));
    }

    parts[2].parse::<i64>().map_err(|_| {
        HandshakeError::FailedSyncHandshake(format!("invalid offset: {}", parts[2]))
    })?;

    Ok(parts[1].to_string())
}

/// Reads the `$<len>\r\n<bytes>` snapshot frame. The payload carries no
/// trailing CRLF, so it cannot be parsed as a regular bulk string.
async fn read_rdb_frame(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
) -> Result<Vec<u8>, HandshakeError> {
    let length = loop {
        if let Some(pos) = buffer.windows(2).position(|pair| pair == b"\r\n") {
            if buffer.first() != Some(&b'$') {
                return Err(HandshakeError::FailedSyncHandshake(
                    "expected an RDB bulk frame".to_string(),
                ));
            }

            let length = std::str::from_utf8(&buffer[1..pos])
                .ok()
                .and_then(|header| header.parse::<usize>().ok())
                .ok_or_else(|| {
                    HandshakeError::FailedSyncHandshake("bad RDB length header".to_string())
                })?;

            buffer.advance(pos + 2);
            break length;
        }

        let read = stream
            .read_buf(buffer)
            .await
            .map_err(|e| HandshakeError::FailedSyncHandshake(e.to_string()))?;

        if read == 0 {
            return Err(HandshakeError::FailedSyncHandshake(
                "master closed the connection mid-snapshot".to_string(),
            ));
        }
    };

    while buffer.len() < length {
        let read = stream
            .read_buf(buffer)
            .await
            .map_err(|e| HandshakeError::FailedSyncHandshake(e.to_string()))?;

        if read == 0 {
            return Err(HandshakeError::FailedSyncHandshake(
                "master closed the connection mid-snapshot".to_string(),
            ));
        }
    }

    let payload = buffer[..length].to_vec();
    buffer.advance(length);

    Ok(payload)
}
