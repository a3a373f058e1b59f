//! Sort key shared by the index side and the disk side of a reconciliation.
//!
//! A [`UidKey`] encodes `(path, modification time)` as a single string:
//!
//! ```text
//! /src/lib.rs @ 1700000000123 ms  ->  "\0src\0lib.rs\0" + "00000001700000000123"
//! ```
//!
//! Every `/` of the path becomes `\0`, which sorts below any byte that can
//! appear in a file name. Comparing two keys byte-wise therefore walks the
//! tree in pre-order with siblings sorted by name, and the fixed-width
//! timestamp orders different versions of the same path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const SEPARATOR: char = '\0';
const TIMESTAMP_WIDTH: usize = 20;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UidKey(String);

impl UidKey {
    /// Build the key for `path` (relative to the source root, `/`-separated,
    /// with a leading `/`) last modified at `mtime_ms`.
    #[must_use]
    pub fn new(path: &str, mtime_ms: u64) -> Self {
        let mut encoded = encode_path(path);
        encoded.push(SEPARATOR);
        encoded.push_str(&format!("{mtime_ms:0width$}", width = TIMESTAMP_WIDTH));
        Self(encoded)
    }

    #[must_use]
    pub fn from_modified(path: &str, modified: SystemTime) -> Self {
        Self::new(path, system_time_ms(modified))
    }

    /// Start key for everything under `dir`. An empty `dir` covers the whole
    /// source root.
    #[must_use]
    pub fn prefix(dir: &str) -> String {
        let mut encoded = encode_path(dir.trim_end_matches('/'));
        encoded.push(SEPARATOR);
        encoded
    }

    /// Validate an already-encoded key.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (path, stamp) = raw.rsplit_once(SEPARATOR)?;
        if path.is_empty()
            || stamp.len() != TIMESTAMP_WIDTH
            || !stamp.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// Recover the `/`-separated path.
    #[must_use]
    pub fn path(&self) -> String {
        self.encoded_path().replace(SEPARATOR, "/")
    }

    #[must_use]
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.0
            .rsplit_once(SEPARATOR)
            .and_then(|(_, stamp)| stamp.parse().ok())
    }

    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Whether both keys name the same path, whatever their timestamps.
    #[must_use]
    pub fn same_path(&self, other: &UidKey) -> bool {
        self.encoded_path() == other.encoded_path()
    }

    fn encoded_path(&self) -> &str {
        self.0
            .rsplit_once(SEPARATOR)
            .map_or(self.0.as_str(), |(path, _)| path)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UidKey({}@{})", self.path(), self.timestamp_ms().unwrap_or(0))
    }
}

impl fmt::Display for UidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

fn encode_path(path: &str) -> String {
    path.replace('/', "\0")
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
