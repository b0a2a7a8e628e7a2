//! Per-connection buffers and serve loops.
//!
//! Each connection is one local task that owns its socket and read
//! buffer outright. The loop suspends only on I/O: recv, parse and
//! dispatch run to completion, then the reply (and any side-effect
//! frame) is written before the next recv is armed. Framing is
//! parser-driven: `Truncated` means keep the buffered bytes and read
//! more.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::dispatch::{dispatch, DispatchError, Outcome};
use crate::keyspace::now_ms;
use crate::rdb;
use crate::replication::ReplicationState;
use crate::resp::{self, Message, RespError};
use crate::server::ServerState;

/// Initial capacity of the per-connection read buffer.
pub const READ_BUFFER_CAPACITY: usize = 512;

/// Hard cap on a single frame. The read buffer grows on demand, but a
/// frame still incomplete past this size closes the connection.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message too large")]
    MessageTooLarge,
    #[error("protocol error: {0}")]
    Protocol(#[from] RespError),
    #[error("{0}")]
    Dispatch(#[from] DispatchError),
}

/// How the connection is currently being used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionRole {
    Client,
    SyncingReplica,
    ConnectedReplica,
}

pub struct Connection {
    stream: TcpStream,
    peer: String,
    buffer: BytesMut,
    role: ConnectionRole,
    replication: ReplicationState,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Connection {
            stream,
            peer,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            role: ConnectionRole::Client,
            replication: ReplicationState::None,
        }
    }
}

/// Serves one accepted connection to completion.
///
/// Whatever the outcome, the connection is dropped from the propagation
/// set afterwards; removal is a no-op for plain clients.
pub async fn serve_client(stream: TcpStream, peer: String, shared: Rc<RefCell<ServerState>>) {
    let mut connection = Connection::new(stream, peer.clone());

    match drive(&mut connection, &shared).await {
        Ok(()) => debug!(peer = %peer, role = ?connection.role, "connection closed"),
        Err(error) => debug!(peer = %peer, role = ?connection.role, %error, "connection closed"),
    }

    shared.borrow_mut().remove_replica(&peer);
}

enum Step {
    Respond(Vec<u8>),
    FullResync(Vec<u8>),
}

async fn drive(
    connection: &mut Connection,
    shared: &Rc<RefCell<ServerState>>,
) -> Result<(), ConnectionError> {
    let mut handoff: Option<mpsc::UnboundedReceiver<Vec<u8>>> = None;

    loop {
        // drain every complete frame currently buffered
        loop {
            if connection.buffer.is_empty() {
                break;
            }

            let (consumed, step) = {
                let buf = &connection.buffer[..];

                let (message, consumed) = match Message::parse(buf) {
                    Ok(parsed) => parsed,
                    Err(RespError::Truncated) => {
                        if buf.len() > MAX_MESSAGE_BYTES {
                            let reply = resp::error_reply("message too large");
                            let _ = connection.stream.write_all(&reply).await;
                            return Err(ConnectionError::MessageTooLarge);
                        }

                        break;
                    }
                    Err(error) => {
                        let reply = resp::error_reply(&error.to_string());
                        let _ = connection.stream.write_all(&reply).await;
                        return Err(ConnectionError::Protocol(error));
                    }
                };

                let raw = &buf[..consumed];

                let outcome = {
                    let mut state = shared.borrow_mut();
                    dispatch(
                        &message,
                        raw,
                        now_ms(),
                        &mut state,
                        &mut connection.replication,
                    )
                };

                match outcome {
                    Ok(Outcome::Response(reply)) => (consumed, Step::Respond(reply)),
                    Ok(Outcome::FullResync(reply)) => (consumed, Step::FullResync(reply)),
                    Err(error) => {
                        let _ = connection.stream.write_all(&error.reply_bytes()).await;
                        return Err(ConnectionError::Dispatch(error));
                    }
                }
            };

            connection.buffer.advance(consumed);

            match step {
                Step::Respond(reply) => {
                    connection.stream.write_all(&reply).await?;
                    connection.stream.flush().await?;
                }
                Step::FullResync(reply) => {
                    connection.role = ConnectionRole::SyncingReplica;
                    connection.stream.write_all(&reply).await?;
                    connection.stream.write_all(&rdb::psync_frame()).await?;
                    connection.stream.flush().await?;

                    connection
                        .replication
                        .complete_sync()
                        .map_err(DispatchError::from)?;
                    connection.role = ConnectionRole::ConnectedReplica;

                    let (sender, feed) = mpsc::unbounded_channel();
                    shared
                        .borrow_mut()
                        .register_replica(&connection.peer, sender);
                    info!(peer = %connection.peer, "replica synchronized");

                    // frames the peer pipelined behind PSYNC still drain
                    // in arrival order before the feed takes over
                    handoff = Some(feed);
                }
            }
        }

        if let Some(feed) = handoff.take() {
            return serve_replica(connection, feed).await;
        }

        let read = connection.stream.read_buf(&mut connection.buffer).await?;

        if read == 0 {
            return Ok(());
        }
    }
}

/// Drains the propagation feed into the replica's socket.
///
/// Bytes the replica sends back (REPLCONF ACK and the like) are read and
/// discarded; a closed socket or feed ends the loop.
async fn serve_replica(
    connection: &mut Connection,
    mut feed: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = connection.stream.split();
    let mut scratch = [0u8; READ_BUFFER_CAPACITY];

    loop {
        tokio::select! {
            queued = feed.recv() => match queued {
                Some(frame) => {
                    trace!(peer = %connection.peer, bytes = frame.len(), "forwarding write");
                    writer.write_all(&frame).await?;
                    writer.flush().await?;
                }
                None => return Ok(()),
            },
            read = reader.read(&mut scratch) => {
                if read? == 0 {
                    return Ok(());
                }
            }
        }
    }
}
