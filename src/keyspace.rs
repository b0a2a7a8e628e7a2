//! The in-memory keyspace.
//!
//! Keys and values are byte strings owned by the keyspace; inserts deep-copy
//! out of the ephemeral read buffers they were parsed from. Expiry is lazy:
//! an entry past its deadline is reaped by the read that observes it, so
//! `count` may include entries that have expired but not yet been touched.

use std::collections::HashMap;

/// Wall-clock Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

#[derive(Debug, PartialEq)]
pub struct KeyEntry {
    pub value: Vec<u8>,
    pub expires_at_ms: Option<i64>,
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<Vec<u8>, KeyEntry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Keyspace {
            entries: HashMap::new(),
        }
    }

    /// Upserts an entry with no deadline, replacing any prior entry.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.entries.insert(
            key.to_vec(),
            KeyEntry {
                value: value.to_vec(),
                expires_at_ms: None,
            },
        );
    }

    /// Upserts an entry that expires at the given absolute deadline.
    pub fn put_with_expiry(&mut self, key: &[u8], value: &[u8], deadline_ms: i64) {
        self.entries.insert(
            key.to_vec(),
            KeyEntry {
                value: value.to_vec(),
                expires_at_ms: Some(deadline_ms),
            },
        );
    }

    /// Returns the live value for `key`, reaping it if expired.
    ///
    /// An entry whose deadline is exactly `now_ms` counts as expired.
    pub fn get(&mut self, key: &[u8], now_ms: i64) -> Option<&[u8]> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry
                .expires_at_ms
                .is_some_and(|deadline| now_ms >= deadline),
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|entry| entry.value.as_slice())
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}
