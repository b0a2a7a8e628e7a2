//! Server configuration, process-wide state, and the accept loop.
//!
//! The server runs on a single-threaded cooperative scheduler: one tokio
//! `current_thread` runtime with a `LocalSet`, one task per connection.
//! `ServerState` lives behind `Rc<RefCell<_>>`, is only ever touched from
//! the loop thread, and no borrow is held across an await.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::serve_client;
use crate::keyspace::Keyspace;
use crate::replication::{self, HandshakeError};

/// Errors that can occur during command-line argument parsing.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum CliError {
    #[error("Invalid command line flag")]
    InvalidCommandLineFlag,
    #[error("Invalid port flag value")]
    InvalidPortFlagValue,
    #[error("Invalid master address")]
    InvalidMasterAddress,
    #[error("Invalid master port")]
    InvalidMasterPort,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// The role this instance runs as.
///
/// A master accepts writes and replicates them; a replica mirrors a
/// master and serves reads.
#[derive(Debug, PartialEq, Clone)]
pub enum Role {
    Master,
    Replica { host: String, port: u16 },
}

impl Role {
    /// The role name used by INFO (Redis reports replicas as "slave").
    pub fn as_str(&self) -> &str {
        match self {
            Role::Master => "master",
            Role::Replica { .. } => "slave",
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

/// Startup configuration parsed from the command line.
///
/// # Supported Arguments
///
/// * `--port <port>` - Port number to listen on (default: 6379)
/// * `--replicaof "<host> <port>"` - Run as a replica of the given master
#[derive(Debug, PartialEq, Clone)]
pub struct StartupConfig {
    pub port: u16,
    pub replicaof: Option<(String, u16)>,
}

impl StartupConfig {
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, CliError> {
        let mut iter = args.into_iter().skip(1);
        let mut port: Option<u16> = None;
        let mut replicaof: Option<(String, u16)> = None;

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--port" => {
                    let Some(port_str) = iter.next() else {
                        return Err(CliError::InvalidCommandLineFlag);
                    };

                    port = Some(parse_port(&port_str).ok_or(CliError::InvalidPortFlagValue)?);
                }
                "--replicaof" => {
                    let Some(master_address) = iter.next() else {
                        return Err(CliError::InvalidCommandLineFlag);
                    };

                    replicaof = Some(validate_master_address(&master_address)?);
                }
                _ => return Err(CliError::InvalidCommandLineFlag),
            }
        }

        Ok(StartupConfig {
            port: port.unwrap_or(6379),
            replicaof,
        })
    }
}

/// Process-wide state, owned by the loop thread.
#[derive(Debug)]
pub struct ServerState {
    pub role: Role,
    pub listen_port: u16,
    /// Present iff this instance is a master (40 hex digits).
    pub master_replid: Option<String>,
    /// Bytes of write commands propagated (master) or ingested (replica)
    /// since boot.
    pub master_repl_offset: i64,
    pub keyspace: Keyspace,
    replicas: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
}

impl ServerState {
    pub fn new(config: &StartupConfig, listen_port: u16) -> Self {
        let role = match &config.replicaof {
            Some((host, port)) => Role::Replica {
                host: host.clone(),
                port: *port,
            },
            None => Role::Master,
        };

        let master_replid = match role {
            Role::Master => Some(generate_replid()),
            Role::Replica { .. } => None,
        };

        ServerState {
            role,
            listen_port,
            master_replid,
            master_repl_offset: 0,
            keyspace: Keyspace::new(),
            replicas: HashMap::new(),
        }
    }

    /// Adds a connection that completed the handshake to the propagation
    /// set.
    pub fn register_replica(&mut self, peer: &str, sender: mpsc::UnboundedSender<Vec<u8>>) {
        self.replicas.insert(peer.to_string(), sender);
        info!(peer = %peer, replicas = self.replicas.len(), "replica connected");
    }

    pub fn remove_replica(&mut self, peer: &str) {
        if self.replicas.remove(peer).is_some() {
            info!(peer = %peer, replicas = self.replicas.len(), "replica disconnected");
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Forwards the verbatim bytes of a write command to every connected
    /// replica, in arrival order, and advances the replication offset.
    ///
    /// Replicas whose feed has closed are dropped from the set here; the
    /// serve loop notices independently when its socket dies.
    pub fn propagate(&mut self, frame: &[u8]) {
        self.replicas.retain(|peer, sender| {
            let delivered = sender.send(frame.to_vec()).is_ok();

            if !delivered {
                debug!(peer = %peer, "dropping replica with a closed feed");
            }

            delivered
        });

        self.master_repl_offset += frame.len() as i64;
    }

    /// The `INFO replication` section body, in field declaration order.
    pub fn replication_info(&self) -> String {
        let mut body = format!("role:{}\n", self.role.as_str());

        if let Some(replid) = &self.master_replid {
            body.push_str(&format!("master_replid:{}\n", replid));
        }

        body.push_str(&format!("master_repl_offset:{}\n", self.master_repl_offset));
        body
    }
}

pub struct Server {
    listener: TcpListener,
    shared: Rc<RefCell<ServerState>>,
}

impl Server {
    /// Binds the listening socket and builds the process-wide state.
    ///
    /// Binding before the replica handshake means the advertised
    /// listening port is the real one even when the configured port was 0.
    pub async fn bind(config: StartupConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port)).await?;
        let listen_port = listener.local_addr()?.port();
        let shared = Rc::new(RefCell::new(ServerState::new(&config, listen_port)));

        Ok(Server { listener, shared })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the server until a fatal error.
    ///
    /// A replica completes its upstream handshake before the first client
    /// is accepted. Must be called from within a `LocalSet`.
    pub async fn run(self) -> Result<(), ServerError> {
        let upstream = match &self.shared.borrow().role {
            Role::Replica { host, port } => Some(format!("{}:{}", host, port)),
            Role::Master => None,
        };

        if let Some(master_address) = upstream {
            let listen_port = self.shared.borrow().listen_port;
            let link = replication::sync_with_master(&master_address, listen_port).await?;

            tokio::task::spawn_local(replication::serve_master_link(
                link,
                Rc::clone(&self.shared),
            ));
        }

        {
            let state = self.shared.borrow();
            info!(port = state.listen_port, role = state.role.as_str(), "listening");
        }

        loop {
            let (stream, peer_address) = self.listener.accept().await?;
            debug!(peer = %peer_address, "accepted connection");

            tokio::task::spawn_local(serve_client(
                stream,
                peer_address.to_string(),
                Rc::clone(&self.shared),
            ));
        }
    }
}

fn generate_replid() -> String {
    const HEX_DIGITS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();

    (0..40)
        .map(|_| HEX_DIGITS[rng.random_range(0..HEX_DIGITS.len())] as char)
        .collect()
}

/// Parses a TCP port, rejecting 0 so the value is always routable.
fn parse_port(value: &str) -> Option<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Splits a `--replicaof` value into its host and port parts. The host
/// may be an IPv4 address or a hostname.
fn validate_master_address(master_address: &str) -> Result<(String, u16), CliError> {
    let mut parts = master_address.split_whitespace();

    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CliError::InvalidMasterAddress);
    };

    if !is_valid_host(host) {
        return Err(CliError::InvalidMasterAddress);
    }

    let port = parse_port(port).ok_or(CliError::InvalidMasterPort)?;

    Ok((host.to_string(), port))
}

/// Anything made of four numeric dot-separated fields is held to IPv4
/// octet ranges; everything else only has to look like a hostname.
fn is_valid_host(host: &str) -> bool {
    let numeric = host.chars().all(|c| c.is_ascii_digit() || c == '.');

    if numeric && host.split('.').count() == 4 {
        return host.split('.').all(is_valid_octet);
    }

    let hostname = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*$").unwrap();
    hostname.is_match(host)
}

fn is_valid_octet(octet: &str) -> bool {
    (1..=3).contains(&octet.len()) && octet.parse::<u8>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        let test_cases = [
            ("6379", Some(6379), "valid standard port"),
            ("1", Some(1), "minimum valid port"),
            ("65535", Some(65535), "maximum valid port"),
            ("0", None, "zero port"),
            ("65536", None, "port too high"),
            ("not_a_number", None, "invalid format"),
            ("-1", None, "negative port"),
            ("", None, "empty string"),
            ("80.5", None, "decimal number"),
        ];

        for (input, expected, description) in test_cases {
            assert_eq!(parse_port(input), expected, "{}: {}", description, input);
        }
    }

    #[test]
    fn test_validate_master_address() {
        let test_cases = [
            (
                "127.0.0.1 6379",
                Ok(("127.0.0.1".to_string(), 6379)),
                "valid IPv4 address",
            ),
            (
                "localhost 6380",
                Ok(("localhost".to_string(), 6380)),
                "valid hostname",
            ),
            (
                "redis-master.example.com 65535",
                Ok(("redis-master.example.com".to_string(), 65535)),
                "valid domain with maximum port",
            ),
            (
                "localhost 100000",
                Err(CliError::InvalidMasterPort),
                "port too high",
            ),
            ("localhost 0", Err(CliError::InvalidMasterPort), "port too low"),
            ("localhost", Err(CliError::InvalidMasterAddress), "missing port"),
            (
                "localhost 6379 extra",
                Err(CliError::InvalidMasterAddress),
                "too many arguments",
            ),
            ("", Err(CliError::InvalidMasterAddress), "empty string"),
            (
                "256.0.0.1 6379",
                Err(CliError::InvalidMasterAddress),
                "IPv4 octet out of range",
            ),
            (
                "my_host! 6379",
                Err(CliError::InvalidMasterAddress),
                "invalid hostname characters",
            ),
        ];

        for (input, expected, description) in test_cases {
            assert_eq!(
                validate_master_address(input),
                expected,
                "{}: {}",
                description,
                input
            );
        }
    }

    #[test]
    fn test_startup_config_defaults() {
        let args = vec!["redlite".to_string()];

        let config = StartupConfig::from_args(args).unwrap();
        assert_eq!(config.port, 6379);
        assert_eq!(config.replicaof, None);
    }

    #[test]
    fn test_startup_config_success_cases() {
        let test_cases = vec![
            (
                vec![
                    "redlite".to_string(),
                    "--port".to_string(),
                    "6677".to_string(),
                ],
                6677,
                None,
            ),
            (
                vec![
                    "redlite".to_string(),
                    "--replicaof".to_string(),
                    "127.0.0.1 6380".to_string(),
                ],
                6379,
                Some(("127.0.0.1".to_string(), 6380)),
            ),
            (
                vec![
                    "redlite".to_string(),
                    "--port".to_string(),
                    "7000".to_string(),
                    "--replicaof".to_string(),
                    "localhost 6381".to_string(),
                ],
                7000,
                Some(("localhost".to_string(), 6381)),
            ),
        ];

        for (args, expected_port, expected_replicaof) in test_cases {
            let config = StartupConfig::from_args(args).unwrap();
            assert_eq!(config.port, expected_port);
            assert_eq!(config.replicaof, expected_replicaof);
        }
    }

    #[test]
    fn test_startup_config_invalid_flags() {
        let test_cases = vec![
            (
                vec!["redlite".to_string(), "--port".to_string()],
                CliError::InvalidCommandLineFlag,
            ),
            (
                vec![
                    "redlite".to_string(),
                    "--port".to_string(),
                    "invalid".to_string(),
                ],
                CliError::InvalidPortFlagValue,
            ),
            (
                vec!["redlite".to_string(), "--verbose".to_string()],
                CliError::InvalidCommandLineFlag,
            ),
            (
                vec!["redlite".to_string(), "--replicaof".to_string()],
                CliError::InvalidCommandLineFlag,
            ),
            (
                vec![
                    "redlite".to_string(),
                    "--replicaof".to_string(),
                    "127.0.0.1".to_string(),
                ],
                CliError::InvalidMasterAddress,
            ),
            (
                vec![
                    "redlite".to_string(),
                    "--replicaof".to_string(),
                    "127.0.0.1 invalid".to_string(),
                ],
                CliError::InvalidMasterPort,
            ),
        ];

        for (args, expected_error) in test_cases {
            assert_eq!(StartupConfig::from_args(args), Err(expected_error));
        }
    }

    #[test]
    fn test_master_state_has_a_hex_replid() {
        let config = StartupConfig {
            port: 6379,
            replicaof: None,
        };
        let state = ServerState::new(&config, 6379);

        let replid = state.master_replid.unwrap();
        assert_eq!(replid.len(), 40);
        assert!(replid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_replica_state_omits_replid() {
        let config = StartupConfig {
            port: 6380,
            replicaof: Some(("127.0.0.1".to_string(), 6379)),
        };
        let state = ServerState::new(&config, 6380);

        assert_eq!(state.master_replid, None);
        assert_eq!(state.role.as_str(), "slave");
        assert_eq!(
            state.replication_info(),
            "role:slave\nmaster_repl_offset:0\n"
        );
    }

    #[test]
    fn test_replication_info_field_order_on_master() {
        let config = StartupConfig {
            port: 6379,
            replicaof: None,
        };
        let state = ServerState::new(&config, 6379);

        let body = state.replication_info();
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "role:master");
        assert!(lines[1].starts_with("master_replid:"));
        assert_eq!(lines[2], "master_repl_offset:0");
    }

    #[test]
    fn test_propagate_delivers_in_order_and_advances_offset() {
        let config = StartupConfig {
            port: 6379,
            replicaof: None,
        };
        let mut state = ServerState::new(&config, 6379);

        let (sender, mut feed) = mpsc::unbounded_channel();
        state.register_replica("127.0.0.1:50000", sender);

        let first = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        let second = b"*3\r\n$3\r\nSET\r\n$1\r\nj\r\n$1\r\nw\r\n";
        state.propagate(first);
        state.propagate(second);

        assert_eq!(feed.try_recv().unwrap(), first.to_vec());
        assert_eq!(feed.try_recv().unwrap(), second.to_vec());
        assert_eq!(
            state.master_repl_offset,
            (first.len() + second.len()) as i64
        );
    }

    #[test]
    fn test_propagate_drops_replicas_with_closed_feeds() {
        let config = StartupConfig {
            port: 6379,
            replicaof: None,
        };
        let mut state = ServerState::new(&config, 6379);

        let (sender, feed) = mpsc::unbounded_channel();
        state.register_replica("127.0.0.1:50000", sender);
        assert_eq!(state.replica_count(), 1);

        drop(feed);
        state.propagate(b"*1\r\n$4\r\nPING\r\n");

        assert_eq!(state.replica_count(), 0);
    }
}
