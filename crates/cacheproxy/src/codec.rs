//! Binary form of [`FileInformation`] as stored in the cache store.
//!
//! Records are MessagePack maps with named fields, tagged with a schema
//! number. Header values are joined with `,` on the way in and split on the
//! way out, so a value that itself contains a comma comes back as several
//! values. A header with no values is not written at all.

use crate::file_info::{FileEnvelope, FileInformation, FileMime};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
#[error("failed to encode cache record: {0}")]
pub struct EncodeError(#[from] rmp_serde::encode::Error);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed cache record: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),

    #[error("unsupported cache record schema {0}")]
    Schema(u32),

    #[error("status code {0} out of range")]
    Status(u32),

    #[error("timestamp {seconds}.{nanos:09} out of range")]
    Timestamp { seconds: i64, nanos: u32 },
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    schema: u32,
    file_mime: WireMime,
    envelope: WireEnvelope,
    content: Bytes,
    checksum: Bytes,
    created_at: WireTimestamp,
    modified_at: WireTimestamp,
    #[serde(default)]
    extra_metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct WireMime {
    name: String,
    extension: String,
    mime_type: String,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    headers: BTreeMap<String, String>,
    status: u32,
}

/// Absolute instant: seconds and nanoseconds since the Unix epoch.
#[derive(Serialize, Deserialize)]
struct WireTimestamp {
    seconds: i64,
    nanos: u32,
}

impl From<&DateTime<Utc>> for WireTimestamp {
    fn from(t: &DateTime<Utc>) -> Self {
        Self {
            seconds: t.timestamp(),
            nanos: t.timestamp_subsec_nanos(),
        }
    }
}

impl TryFrom<WireTimestamp> for DateTime<Utc> {
    type Error = DecodeError;

    fn try_from(t: WireTimestamp) -> Result<Self, Self::Error> {
        DateTime::from_timestamp(t.seconds, t.nanos).ok_or(DecodeError::Timestamp {
            seconds: t.seconds,
            nanos: t.nanos,
        })
    }
}

pub fn encode(info: &FileInformation) -> Result<Vec<u8>, EncodeError> {
    let wire = WireRecord {
        schema: SCHEMA_VERSION,
        file_mime: WireMime {
            name: info.file_mime.name.clone(),
            extension: info.file_mime.extension.clone(),
            mime_type: info.file_mime.mime_type.clone(),
        },
        envelope: WireEnvelope {
            headers: info
                .envelope
                .headers
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.join(",")))
                .collect(),
            status: u32::from(info.envelope.status),
        },
        content: info.content.clone(),
        checksum: info.checksum.clone(),
        created_at: (&info.created_at).into(),
        modified_at: (&info.modified_at).into(),
        extra_metadata: info.extra_metadata.clone(),
    };
    Ok(rmp_serde::to_vec_named(&wire)?)
}

/// Decode a stored record. Empty input yields an all-default record, whose
/// empty checksum marks it unusable.
pub fn decode(bytes: &[u8]) -> Result<FileInformation, DecodeError> {
    if bytes.is_empty() {
        return Ok(FileInformation::default());
    }

    let wire: WireRecord = rmp_serde::from_slice(bytes)?;
    if wire.schema != SCHEMA_VERSION {
        return Err(DecodeError::Schema(wire.schema));
    }
    let status =
        u16::try_from(wire.envelope.status).map_err(|_| DecodeError::Status(wire.envelope.status))?;

    Ok(FileInformation {
        file_mime: FileMime {
            name: wire.file_mime.name,
            extension: wire.file_mime.extension,
            mime_type: wire.file_mime.mime_type,
        },
        envelope: FileEnvelope {
            headers: wire
                .envelope
                .headers
                .into_iter()
                .map(|(k, v)| {
                    let values = v.split(',').map(str::to_owned).collect();
                    (k, values)
                })
                .collect(),
            status,
        },
        content: wire.content,
        checksum: wire.checksum,
        created_at: wire.created_at.try_into()?,
        modified_at: wire.modified_at.try_into()?,
        extra_metadata: wire.extra_metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> FileInformation {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::TimeDelta::nanoseconds(123_456_789);
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), vec!["text/html; charset=utf-8".to_string()]);
        headers.insert(
            "set-cookie".to_string(),
            vec!["a=1".to_string(), "b=2".to_string()],
        );
        let mut extra = BTreeMap::new();
        extra.insert("origin".to_string(), "http://example.com".to_string());

        FileInformation {
            file_mime: FileMime {
                name: "/index.html?x=1".to_string(),
                extension: ".html".to_string(),
                mime_type: "text/html; charset=utf-8".to_string(),
            },
            envelope: FileEnvelope { headers, status: 200 },
            content: Bytes::from_static(b"<html><body>hi</body></html>"),
            checksum: Bytes::from(vec![0xab; 32]),
            created_at: created,
            modified_at: created + chrono::TimeDelta::seconds(5),
            extra_metadata: extra,
        }
    }

    #[test]
    fn round_trips_every_field() {
        let info = sample();
        let decoded = decode(&encode(&info).unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn round_trips_default_record() {
        let info = FileInformation::default();
        let decoded = decode(&encode(&info).unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn header_values_with_commas_are_split() {
        let mut info = sample();
        info.envelope
            .headers
            .insert("accept".to_string(), vec!["text/html, image/jpeg".to_string()]);

        let decoded = decode(&encode(&info).unwrap()).unwrap();
        assert_eq!(
            decoded.envelope.headers["accept"],
            vec!["text/html".to_string(), " image/jpeg".to_string()]
        );
    }

    #[test]
    fn headers_without_values_are_dropped() {
        let mut info = sample();
        info.envelope.headers.insert("x-empty".to_string(), Vec::new());
        info.envelope.headers.insert("x-blank".to_string(), vec![String::new()]);

        let decoded = decode(&encode(&info).unwrap()).unwrap();
        assert!(!decoded.envelope.headers.contains_key("x-empty"));
        assert_eq!(decoded.envelope.headers["x-blank"], vec![String::new()]);
        assert!(decoded
            .envelope
            .headers
            .values()
            .all(|values| !values.is_empty()));
    }

    #[test]
    fn empty_input_is_zero_record() {
        let decoded = decode(&[]).unwrap();
        assert_eq!(decoded, FileInformation::default());
        assert!(!decoded.has_checksum());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode(&[0xc1, 0x00, 0x13]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = encode(&sample()).unwrap();
        assert!(decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let mut wire: WireRecord = rmp_serde::from_slice(&encode(&sample()).unwrap()).unwrap();
        wire.schema = 99;
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(matches!(decode(&bytes), Err(DecodeError::Schema(99))));
    }

    #[test]
    fn out_of_range_status_is_rejected() {
        let mut wire: WireRecord = rmp_serde::from_slice(&encode(&sample()).unwrap()).unwrap();
        wire.envelope.status = 70_000;
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(matches!(decode(&bytes), Err(DecodeError::Status(70_000))));
    }
}
