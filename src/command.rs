//! Typed request model.
//!
//! Lifts a parsed RESP message into a validated command. Requests borrow
//! their keys and values from the same read buffer the message borrowed
//! from; the dispatcher copies whatever it needs to keep.
//!
//! Expiry deadlines are computed here, at parse time, so the timestamp
//! reflects the moment the command arrived rather than the moment it was
//! applied.

use thiserror::Error;

use crate::resp::Message;

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("invalid command")]
    InvalidCommand,
    #[error("wrong number of arguments")]
    InvalidRequestArity,
    #[error("invalid command argument")]
    InvalidCommandArgument,
    #[error("invalid expiration")]
    InvalidExpiration,
    #[error("invalid PSYNC offset")]
    InvalidPsyncOffset,
}

/// A validated client request.
#[derive(Debug, PartialEq)]
pub enum Request<'a> {
    Ping(Option<&'a [u8]>),
    Echo(&'a [u8]),
    Get(&'a str),
    Set {
        key: &'a str,
        value: &'a [u8],
        deadline_ms: Option<i64>,
    },
    Info(Vec<&'a str>),
    Replconf(Vec<&'a str>),
    Psync {
        replid: &'a str,
        offset: i64,
    },
    Unknown,
}

impl<'a> Request<'a> {
    /// Lifts a message into a typed request.
    ///
    /// `now_ms` is the wall-clock timestamp of the frame's arrival and is
    /// the base for any `PX` deadline.
    pub fn parse(message: &Message<'a>, now_ms: i64) -> Result<Self, RequestError> {
        let Message::Array(items) = message else {
            return Err(RequestError::InvalidCommand);
        };

        let mut words: Vec<&'a [u8]> = Vec::with_capacity(items.len());

        for item in items {
            match item {
                Message::Bulk(bytes) => words.push(*bytes),
                _ => return Err(RequestError::InvalidCommand),
            }
        }

        let Some(name) = words.first() else {
            return Err(RequestError::InvalidCommand);
        };

        match name.to_ascii_uppercase().as_slice() {
            b"PING" => match words.len() {
                1 => Ok(Request::Ping(None)),
                2 => Ok(Request::Ping(Some(words[1]))),
                _ => Err(RequestError::InvalidRequestArity),
            },
            b"ECHO" => match words.len() {
                2 => Ok(Request::Echo(words[1])),
                _ => Err(RequestError::InvalidRequestArity),
            },
            b"GET" => {
                if words.len() != 2 {
                    return Err(RequestError::InvalidRequestArity);
                }

                let key = as_text(words[1])?;

                if key.is_empty() {
                    return Err(RequestError::InvalidCommandArgument);
                }

                Ok(Request::Get(key))
            }
            b"SET" => parse_set(&words, now_ms),
            b"INFO" => {
                let mut sections = Vec::with_capacity(words.len() - 1);

                for word in &words[1..] {
                    sections.push(as_text(*word)?);
                }

                Ok(Request::Info(sections))
            }
            b"REPLCONF" => {
                if words.len() < 3 {
                    return Err(RequestError::InvalidRequestArity);
                }

                let mut args = Vec::with_capacity(words.len() - 1);

                for word in &words[1..] {
                    args.push(as_text(*word)?);
                }

                Ok(Request::Replconf(args))
            }
            b"PSYNC" => {
                if words.len() != 3 {
                    return Err(RequestError::InvalidRequestArity);
                }

                let replid = as_text(words[1])?;
                let offset = as_text(words[2])?
                    .parse::<i64>()
                    .map_err(|_| RequestError::InvalidPsyncOffset)?;

                Ok(Request::Psync { replid, offset })
            }
            _ => Ok(Request::Unknown),
        }
    }

    /// Write commands are the ones a master forwards to its replicas.
    pub fn is_write(&self) -> bool {
        matches!(self, Request::Set { .. })
    }
}

fn parse_set<'a>(words: &[&'a [u8]], now_ms: i64) -> Result<Request<'a>, RequestError> {
    if words.len() != 3 && words.len() != 5 {
        return Err(RequestError::InvalidRequestArity);
    }

    let key = as_text(words[1])?;
    let value = words[2];

    let deadline_ms = if words.len() == 5 {
        if !words[3].eq_ignore_ascii_case(b"PX") {
            return Err(RequestError::InvalidCommandArgument);
        }

        let millis = as_text(words[4])?
            .parse::<i64>()
            .map_err(|_| RequestError::InvalidExpiration)?;

        Some(now_ms.saturating_add(millis))
    } else {
        None
    };

    Ok(Request::Set {
        key,
        value,
        deadline_ms,
    })
}

fn as_text(bytes: &[u8]) -> Result<&str, RequestError> {
    std::str::from_utf8(bytes).map_err(|_| RequestError::InvalidCommandArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn command(words: &[&'static [u8]]) -> Message<'static> {
        Message::Array(words.iter().map(|word| Message::Bulk(*word)).collect())
    }

    #[test]
    fn test_parse_valid_requests() {
        let test_cases: Vec<(Vec<&'static [u8]>, Request)> = vec![
            (vec![b"PING"], Request::Ping(None)),
            (vec![b"ping"], Request::Ping(None)),
            (vec![b"PING", b"hey"], Request::Ping(Some(b"hey"))),
            (vec![b"ECHO", b"Hello, world!"], Request::Echo(b"Hello, world!")),
            (vec![b"GET", b"grape"], Request::Get("grape")),
            (
                vec![b"SET", b"grape", b"mango"],
                Request::Set {
                    key: "grape",
                    value: b"mango",
                    deadline_ms: None,
                },
            ),
            (
                vec![b"SET", b"grape", b"mango", b"PX", b"100"],
                Request::Set {
                    key: "grape",
                    value: b"mango",
                    deadline_ms: Some(NOW + 100),
                },
            ),
            (
                vec![b"set", b"grape", b"mango", b"px", b"100"],
                Request::Set {
                    key: "grape",
                    value: b"mango",
                    deadline_ms: Some(NOW + 100),
                },
            ),
            (vec![b"INFO"], Request::Info(vec![])),
            (vec![b"INFO", b"replication"], Request::Info(vec!["replication"])),
            (
                vec![b"REPLCONF", b"listening-port", b"6380"],
                Request::Replconf(vec!["listening-port", "6380"]),
            ),
            (
                vec![b"REPLCONF", b"capa", b"psync2"],
                Request::Replconf(vec!["capa", "psync2"]),
            ),
            (
                vec![b"PSYNC", b"?", b"-1"],
                Request::Psync {
                    replid: "?",
                    offset: -1,
                },
            ),
            (vec![b"FLUSHALL"], Request::Unknown),
            (vec![b"SUBSCRIBE", b"news"], Request::Unknown),
        ];

        for (words, expected) in test_cases {
            let message = command(&words);
            assert_eq!(
                Request::parse(&message, NOW),
                Ok(expected),
                "parsing {:?}",
                words.iter().map(|w| String::from_utf8_lossy(w)).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_parse_invalid_requests() {
        let test_cases: Vec<(Vec<&'static [u8]>, RequestError, &str)> = vec![
            (
                vec![b"PING", b"a", b"b"],
                RequestError::InvalidRequestArity,
                "PING with two arguments",
            ),
            (vec![b"ECHO"], RequestError::InvalidRequestArity, "bare ECHO"),
            (
                vec![b"ECHO", b"a", b"b"],
                RequestError::InvalidRequestArity,
                "ECHO with two arguments",
            ),
            (vec![b"GET"], RequestError::InvalidRequestArity, "bare GET"),
            (
                vec![b"GET", b""],
                RequestError::InvalidCommandArgument,
                "GET with empty key",
            ),
            (
                vec![b"SET", b"k"],
                RequestError::InvalidRequestArity,
                "SET without value",
            ),
            (
                vec![b"SET", b"k", b"v", b"PX"],
                RequestError::InvalidRequestArity,
                "SET PX without count",
            ),
            (
                vec![b"SET", b"k", b"v", b"EX", b"100"],
                RequestError::InvalidCommandArgument,
                "SET with unsupported option",
            ),
            (
                vec![b"SET", b"k", b"v", b"PX", b"soon"],
                RequestError::InvalidExpiration,
                "SET PX with non-numeric count",
            ),
            (
                vec![b"SET", b"k", b"v", b"PX", b"5.0"],
                RequestError::InvalidExpiration,
                "SET PX with decimal count",
            ),
            (
                vec![b"REPLCONF", b"capa"],
                RequestError::InvalidRequestArity,
                "REPLCONF with one argument",
            ),
            (
                vec![b"PSYNC", b"?"],
                RequestError::InvalidRequestArity,
                "PSYNC without offset",
            ),
            (
                vec![b"PSYNC", b"?", b"later"],
                RequestError::InvalidPsyncOffset,
                "PSYNC with non-numeric offset",
            ),
        ];

        for (words, expected, description) in test_cases {
            let message = command(&words);
            assert_eq!(
                Request::parse(&message, NOW),
                Err(expected),
                "{}",
                description
            );
        }
    }

    #[test]
    fn test_parse_rejects_non_command_shapes() {
        let test_cases = vec![
            Message::Simple("PING"),
            Message::Bulk(b"PING"),
            Message::NullBulk,
            Message::Array(vec![]),
            Message::Array(vec![Message::Simple("PING")]),
            Message::Array(vec![Message::Bulk(b"GET"), Message::NullBulk]),
        ];

        for message in test_cases {
            assert_eq!(
                Request::parse(&message, NOW),
                Err(RequestError::InvalidCommand),
                "parsing {:?}",
                message
            );
        }
    }

    #[test]
    fn test_set_deadline_is_computed_at_parse_time() {
        let message = command(&[b"SET", b"k", b"v", b"PX", b"250"]);

        let early = Request::parse(&message, 1_000).unwrap();
        let late = Request::parse(&message, 9_000).unwrap();

        assert_eq!(
            early,
            Request::Set {
                key: "k",
                value: b"v",
                deadline_ms: Some(1_250),
            }
        );
        assert_eq!(
            late,
            Request::Set {
                key: "k",
                value: b"v",
                deadline_ms: Some(9_250),
            }
        );
    }

    #[test]
    fn test_is_write() {
        let set = command(&[b"SET", b"k", b"v"]);
        let get = command(&[b"GET", b"k"]);

        assert!(Request::parse(&set, NOW).unwrap().is_write());
        assert!(!Request::parse(&get, NOW).unwrap().is_write());
    }
}
