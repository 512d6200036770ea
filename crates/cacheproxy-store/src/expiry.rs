use rocksdb::CompactionDecision;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) const HEADER_LEN: usize = 8;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Absolute expiry for a write made at `now`. `None` never expires.
pub(crate) fn expiry_from_ttl(now: u64, ttl: Option<Duration>) -> u64 {
    match ttl {
        Some(ttl) => now.saturating_add(ttl.as_millis().min(u64::MAX as u128) as u64).max(1),
        None => 0,
    }
}

pub(crate) fn is_expired(expires_at: u64, now: u64) -> bool {
    expires_at != 0 && expires_at <= now
}

pub(crate) fn wrap(value: &[u8], expires_at: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + value.len());
    buf.extend_from_slice(&expires_at.to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Split a stored value into its expiry and payload.
pub(crate) fn split(stored: &[u8]) -> Option<(u64, &[u8])> {
    if stored.len() < HEADER_LEN {
        return None;
    }
    let (header, value) = stored.split_at(HEADER_LEN);
    let expires_at = u64::from_le_bytes(header.try_into().ok()?);
    Some((expires_at, value))
}

/// Compaction filter: drop values whose expiry has passed. RocksDB turns a
/// removal into a tombstone above the bottom level, so older versions of the
/// key stay hidden.
pub(crate) fn drop_expired(_level: u32, _key: &[u8], stored: &[u8]) -> CompactionDecision {
    match split(stored) {
        Some((expires_at, _)) if is_expired(expires_at, now_ms()) => CompactionDecision::Remove,
        _ => CompactionDecision::Keep,
    }
}
