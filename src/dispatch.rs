//! Request dispatcher.
//!
//! Applies one parsed request to the keyspace and to the connection's
//! replication state, and produces the reply plus whatever side effect
//! the connection must carry out. Dispatch runs to completion between
//! I/O suspension points; nothing here blocks or awaits.

use thiserror::Error;
use tracing::{debug, trace};

use crate::command::{Request, RequestError};
use crate::replication::{HandshakeError, ReplicationState};
use crate::resp::{self, Message};
use crate::server::ServerState;

#[derive(Error, Debug, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl DispatchError {
    /// The best-effort `-ERR` reply owed before the connection closes.
    pub fn reply_bytes(&self) -> Vec<u8> {
        resp::error_reply(&self.to_string())
    }
}

/// What the connection must do after a request was applied.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Send this reply and keep reading.
    Response(Vec<u8>),
    /// Send this reply, follow it with the RDB snapshot frame, and
    /// convert the connection into a propagation target.
    FullResync(Vec<u8>),
}

/// Applies `message` to the server and connection state.
///
/// `raw_frame` is the verbatim byte image of the message as it arrived;
/// write commands forward exactly those bytes to the replicas so the
/// offset accounting stays byte-exact.
pub fn dispatch(
    message: &Message<'_>,
    raw_frame: &[u8],
    now_ms: i64,
    state: &mut ServerState,
    replication: &mut ReplicationState,
) -> Result<Outcome, DispatchError> {
    let request = Request::parse(message, now_ms)?;

    match request {
        Request::Ping(argument) => {
            replication.observe_ping();

            let reply = match argument {
                Some(text) => Message::Bulk(text).encode(),
                None => Message::Simple("PONG").encode(),
            };

            Ok(Outcome::Response(reply))
        }
        Request::Echo(text) => Ok(Outcome::Response(Message::Bulk(text).encode())),
        Request::Get(key) => {
            let reply = match state.keyspace.get(key.as_bytes(), now_ms) {
                Some(value) => Message::Bulk(value).encode(),
                None => Message::NullBulk.encode(),
            };

            Ok(Outcome::Response(reply))
        }
        Request::Set {
            key,
            value,
            deadline_ms,
        } => {
            match deadline_ms {
                Some(deadline) => state.keyspace.put_with_expiry(key.as_bytes(), value, deadline),
                None => state.keyspace.put(key.as_bytes(), value),
            }

            if state.role.is_master() {
                trace!(key, replicas = state.replica_count(), "propagating write");
                state.propagate(raw_frame);
            }

            Ok(Outcome::Response(Message::Simple("OK").encode()))
        }
        Request::Info(sections) => {
            let body = info_body(&sections, state);
            Ok(Outcome::Response(Message::Bulk(body.as_bytes()).encode()))
        }
        Request::Replconf(args) => {
            replication.apply_replconf(&args)?;
            debug!(state = ?replication, "replica handshake advanced");
            Ok(Outcome::Response(Message::Simple("OK").encode()))
        }
        Request::Psync { replid, offset } => {
            replication.apply_psync(replid, offset)?;

            let Some(master_replid) = &state.master_replid else {
                return Err(DispatchError::Handshake(HandshakeError::UnsupportedPsync));
            };

            let reply = format!("FULLRESYNC {} {}", master_replid, state.master_repl_offset);

            Ok(Outcome::FullResync(Message::Simple(&reply).encode()))
        }
        Request::Unknown => Ok(Outcome::Response(Message::Simple("OK").encode())),
    }
}

/// Only the replication section exists; bare `INFO` gets it too.
fn info_body(sections: &[&str], state: &ServerState) -> String {
    let replication_wanted = sections.is_empty()
        || sections
            .iter()
            .any(|section| section.eq_ignore_ascii_case("replication"));

    if replication_wanted {
        state.replication_info()
    } else {
        String::new()
    }
}
