use crate::director::strip_hop_by_hop;
use crate::error::{CacheError, ForwardError};
use crate::file_info::{FileEnvelope, FileInformation, FileMime};
use crate::repository::{self, CacheStorage};
use crate::{sniff, telemetry};
use axum::body::{Body, HttpBody};
use axum::http::{response, HeaderMap, Response, Uri};
use axum::BoxError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an origin response is written to the cache.
pub struct Interceptor {
    storage: Arc<dyn CacheStorage>,
    cache_ttl: Duration,
    tracked: Vec<String>,
}

impl Interceptor {
    pub fn new(storage: Arc<dyn CacheStorage>, cache_ttl: Duration, tracked: Vec<String>) -> Self {
        Self {
            storage,
            cache_ttl,
            tracked,
        }
    }

    /// Run on every forwarded response before it reaches the client.
    ///
    /// A fresh entry with a checksum is left alone and the origin body is
    /// streamed through. Otherwise the body is buffered, described and, when
    /// its content class is tracked, written back under `key`. Storage
    /// failures are logged and never change what the client receives.
    pub async fn intercept<B>(
        &self,
        key: &str,
        request_uri: &Uri,
        resp: Response<B>,
    ) -> Result<Response<Body>, ForwardError>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let now = Utc::now();
        let (mut parts, body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        match repository::load(&self.storage, key).await {
            Ok(existing) if existing.has_checksum() && existing.is_fresh(now, self.cache_ttl) => {
                tracing::debug!(key, "cached entry still fresh, not rewriting");
                return Ok(Response::from_parts(parts, Body::new(body)));
            }
            Ok(_) | Err(CacheError::NotFound) => {}
            Err(e) => tracing::warn!(key, error = %e, "cache lookup before write failed"),
        }

        let content = body
            .collect()
            .await
            .map_err(|e| ForwardError::Body(e.into()))?
            .to_bytes();

        let info = describe(request_uri, &parts, content.clone(), now);
        if !self.is_file_tracked(&info) {
            tracing::debug!(key, mime = %info.file_mime.mime_type, "content not tracked");
            return Ok(Response::from_parts(parts, Body::from(content)));
        }

        match repository::save(&self.storage, key, info).await {
            Ok(()) => {
                metrics::counter!(telemetry::CACHE_WRITES).increment(1);
                tracing::debug!(key, bytes = content.len(), "stored response");
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to store response"),
        }

        Ok(Response::from_parts(parts, Body::from(content)))
    }

    /// True when the extension, or any `;`-separated part of the MIME type,
    /// equals a tracked entry ignoring ASCII case.
    pub fn is_file_tracked(&self, info: &FileInformation) -> bool {
        let mime = &info.file_mime;
        self.tracked.iter().any(|tracked| {
            mime.extension.eq_ignore_ascii_case(tracked)
                || mime
                    .mime_type
                    .split(';')
                    .any(|part| part.trim().eq_ignore_ascii_case(tracked))
        })
    }
}

fn describe(uri: &Uri, parts: &response::Parts, content: Bytes, now: DateTime<Utc>) -> FileInformation {
    let name = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    FileInformation {
        file_mime: FileMime {
            extension: sniff::extension(uri.path()),
            mime_type: sniff::file_mime(&content, &parts.headers),
            name,
        },
        envelope: FileEnvelope {
            headers: header_map(&parts.headers),
            status: parts.status.as_u16(),
        },
        checksum: sniff::checksum(&content),
        content,
        created_at: now,
        modified_at: now,
        extra_metadata: BTreeMap::new(),
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}
