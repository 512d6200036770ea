use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identifies the type of a cached artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMime {
    pub name: String,
    pub extension: String,
    pub mime_type: String,
}

/// Status and headers of the origin response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEnvelope {
    pub headers: BTreeMap<String, Vec<String>>,
    pub status: u16,
}

/// One cached response. Records are never edited in place; a refresh writes
/// a whole new value under the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInformation {
    pub file_mime: FileMime,
    pub envelope: FileEnvelope,
    pub content: Bytes,
    /// SHA-256 of `content`. Empty means "no usable entry".
    pub checksum: Bytes,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub extra_metadata: BTreeMap<String, String>,
}

impl FileInformation {
    pub fn has_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }

    /// Fresh while `now - modified_at` is strictly below `ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Ok(ttl) = TimeDelta::from_std(ttl) else {
            return true;
        };
        now.signed_duration_since(self.modified_at) < ttl
    }
}
