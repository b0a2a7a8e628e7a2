//! A single-node, in-memory key-value server speaking the RESP wire format.
//!
//! This crate provides a Redis-compatible server that supports:
//!
//! - Basic key-value operations (GET, SET with millisecond expiry)
//! - Server commands (PING, ECHO, INFO)
//! - Master-replica replication via the PSYNC/REPLCONF/FULLRESYNC handshake
//! - Write-command propagation to connected replicas
//!
//! All connections are driven by a single-threaded cooperative scheduler
//! (a tokio `current_thread` runtime with a `LocalSet`), so the keyspace
//! and the connection registry are owned by the loop thread and never
//! touched through a lock.

pub mod command;
pub mod connection;
pub mod dispatch;
pub mod keyspace;
pub mod rdb;
pub mod replication;
pub mod resp;
pub mod server;
