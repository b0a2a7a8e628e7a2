//! Streaming RESP codec.
//!
//! Parsing is zero-copy: `Message` borrows its text and byte payloads
//! straight from the input buffer, so a parsed message must be consumed
//! before the buffer advances. Serialization produces the canonical byte
//! sequence for a message and never mutates it.
//!
//! `Truncated` is the framing signal: it means the input ends before a
//! complete message, and the connection loop should keep the bytes it has
//! and read more. Every other error is a protocol violation.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RespError {
    #[error("unknown RESP tag")]
    UnknownTag,
    #[error("missing CRLF delimiter")]
    MissingDelimiter,
    #[error("bad length header")]
    BadLengthHeader,
    #[error("nested arrays are not supported")]
    NestedArrayNotSupported,
    #[error("input ends before a complete message")]
    Truncated,
    #[error("invalid UTF-8 sequence")]
    InvalidUtf8,
}

/// A RESP message, borrowing its payload from the read buffer.
///
/// The null bulk string (`$-1\r\n`) is a distinct sentinel so that an
/// empty bulk string (`$0\r\n\r\n`) round-trips without being confused
/// with absence.
#[derive(Debug, PartialEq, Clone)]
pub enum Message<'a> {
    Simple(&'a str),
    Bulk(&'a [u8]),
    NullBulk,
    Array(Vec<Message<'a>>),
}

impl<'a> Message<'a> {
    /// Parses one message from the front of `input`.
    ///
    /// Returns the message and the number of bytes it occupied. Extra
    /// bytes after the first complete message are left untouched, which
    /// is what makes pipelined frames work.
    pub fn parse(input: &'a [u8]) -> Result<(Self, usize), RespError> {
        parse_at(input, 0, 0)
    }

    /// Serializes the message into its canonical wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Message::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Message::Bulk(bytes) => {
                out.push(b'$');
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(bytes);
                out.extend_from_slice(b"\r\n");
            }
            Message::NullBulk => {
                out.extend_from_slice(b"$-1\r\n");
            }
            Message::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }
}

/// Encodes a best-effort `-ERR` reply for errors that owe one.
pub fn error_reply(detail: &str) -> Vec<u8> {
    format!("-ERR {}\r\n", detail).into_bytes()
}

fn parse_at(input: &[u8], pos: usize, depth: usize) -> Result<(Message<'_>, usize), RespError> {
    let Some(tag) = input.get(pos) else {
        return Err(RespError::Truncated);
    };

    match tag {
        b'+' => {
            let (line, next) = read_line(input, pos + 1)?;
            let text = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
            Ok((Message::Simple(text), next))
        }
        b'$' => {
            let (header, next) = read_line(input, pos + 1)?;

            if header == b"-1" {
                return Ok((Message::NullBulk, next));
            }

            let length = parse_length(header)?;
            let end = next
                .checked_add(length)
                .and_then(|n| n.checked_add(2))
                .ok_or(RespError::BadLengthHeader)?;

            if input.len() < end {
                return Err(RespError::Truncated);
            }

            if &input[next + length..end] != b"\r\n" {
                return Err(RespError::MissingDelimiter);
            }

            Ok((Message::Bulk(&input[next..next + length]), end))
        }
        b'*' => {
            if depth > 0 {
                return Err(RespError::NestedArrayNotSupported);
            }

            let (header, next) = read_line(input, pos + 1)?;
            let count = parse_length(header)?;

            let mut items = Vec::with_capacity(count.min(16));
            let mut cursor = next;

            for _ in 0..count {
                let (item, after) = parse_at(input, cursor, depth + 1)?;
                items.push(item);
                cursor = after;
            }

            Ok((Message::Array(items), cursor))
        }
        _ => Err(RespError::UnknownTag),
    }
}

/// Reads up to the next CRLF, returning the line content and the position
/// just past the delimiter. A line that simply runs out of input is
/// `Truncated`; a CR followed by anything but LF, or a bare LF, is
/// `MissingDelimiter`.
fn read_line(input: &[u8], start: usize) -> Result<(&[u8], usize), RespError> {
    let mut index = start;

    loop {
        match input.get(index) {
            None => return Err(RespError::Truncated),
            Some(b'\n') => return Err(RespError::MissingDelimiter),
            Some(b'\r') => match input.get(index + 1) {
                None => return Err(RespError::Truncated),
                Some(b'\n') => return Ok((&input[start..index], index + 2)),
                Some(_) => return Err(RespError::MissingDelimiter),
            },
            Some(_) => index += 1,
        }
    }
}

/// Length headers are strictly an unsigned decimal. `-1` is handled by
/// the caller before this runs, so a sign, a dot, or whitespace here is
/// a `BadLengthHeader`.
fn parse_length(header: &[u8]) -> Result<usize, RespError> {
    if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
        return Err(RespError::BadLengthHeader);
    }

    std::str::from_utf8(header)
        .map_err(|_| RespError::BadLengthHeader)?
        .parse::<usize>()
        .map_err(|_| RespError::BadLengthHeader)
}
