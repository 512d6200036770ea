use crate::cache_key::cache_key;
use crate::director::Director;
use crate::error::{CacheError, ForwardError, ProxyError};
use crate::file_info::FileInformation;
use crate::interceptor::Interceptor;
use crate::repository::{self, CacheStorage};
use crate::telemetry;
use crate::transport::RewriteTransport;
use axum::body::Body;
use axum::extract::State;
use axum::http::uri::InvalidUri;
use axum::http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::routing::any;
use axum::Router;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

pub const X_CACHE: &str = "x-cache";

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    /// `0` lets the OS pick; the bound port is published after `listen` binds.
    pub port: u16,
    pub cache_ttl: Duration,
    /// Extensions and MIME types whose responses are persisted.
    pub tracked: Vec<String>,
    pub upstream_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cache_ttl: Duration::from_secs(36 * 60 * 60),
            tracked: [".html", ".htm", "text/html", ".jpg", ".jpeg", "image/jpeg"]
                .into_iter()
                .map(String::from)
                .collect(),
            upstream_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Reverse proxy in front of a single http or https origin that answers from the
/// disk cache when it can.
pub struct CacheableProxy {
    storage: Arc<dyn CacheStorage>,
    target_url: String,
    director: Director,
    interceptor: Interceptor,
    client: HttpClient,
    host: String,
    port: AtomicU16,
    upstream_timeout: Duration,
    drain_timeout: Duration,
}

impl CacheableProxy {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        target_url: &str,
        settings: ProxySettings,
    ) -> Result<Self, ProxyError> {
        let target_url = target_url.trim();
        let invalid = |reason: String| ProxyError::InvalidTarget {
            url: target_url.to_string(),
            reason,
        };

        let target: Uri = target_url
            .parse()
            .map_err(|e: InvalidUri| invalid(e.to_string()))?;
        let (Some(scheme), Some(authority)) = (target.scheme(), target.authority()) else {
            return Err(invalid("expected an absolute url".to_string()));
        };
        if !matches!(scheme.as_str(), "http" | "https") {
            return Err(ProxyError::UnsupportedScheme(scheme.to_string()));
        }

        let director = Director::new(scheme.clone(), authority.clone());
        let interceptor = Interceptor::new(
            Arc::clone(&storage),
            settings.cache_ttl,
            settings.tracked,
        );
        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            storage,
            target_url: target_url.to_string(),
            director,
            interceptor,
            client,
            host: settings.host,
            port: AtomicU16::new(settings.port),
            upstream_timeout: settings.upstream_timeout,
            drain_timeout: settings.drain_timeout,
        })
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn cache_key(&self, method: &Method, uri: &Uri) -> String {
        cache_key(method, &self.target_url, uri)
    }

    /// The configured port, or the bound one once `listen` has bound.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// `":<port>"`.
    pub fn serve_host(&self) -> String {
        format!(":{}", self.port())
    }

    /// Client transport that sends requests aimed at the target origin to
    /// this proxy instead.
    pub fn redirect_transport(&self) -> Result<RewriteTransport<HttpClient>, InvalidUri> {
        RewriteTransport::new(
            self.client.clone(),
            self.director.authority().as_str(),
            &format!("localhost{}", self.serve_host()),
        )
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Bind, report `host:port` on `ready`, and serve until `shutdown` fires.
    ///
    /// After cancellation, in-flight connections get the drain window to
    /// finish; past it the server is abandoned and `DrainTimeout` returned.
    pub async fn listen(
        self: Arc<Self>,
        shutdown: CancellationToken,
        ready: oneshot::Sender<String>,
    ) -> Result<(), ProxyError> {
        let addr = format!("{}:{}", self.host, self.port());
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.port.store(bound.port(), Ordering::Release);

        let ready_addr = format!("{}:{}", self.host, bound.port());
        tracing::info!(addr = %ready_addr, target = %self.target_url, "proxy listening");
        if ready.send(ready_addr).is_err() {
            tracing::debug!("ready receiver dropped");
        }

        let drain = self.drain_timeout;
        let serve = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let mut serve = std::pin::pin!(serve.into_future());

        tokio::select! {
            result = &mut serve => return result.map_err(ProxyError::Serve),
            _ = shutdown.cancelled() => {}
        }

        tracing::info!(drain_ms = drain.as_millis() as u64, "draining connections");
        match tokio::time::timeout(drain, serve).await {
            Ok(result) => {
                tracing::info!("proxy stopped");
                result.map_err(ProxyError::Serve)
            }
            Err(_) => {
                tracing::warn!(drain_ms = drain.as_millis() as u64, "connections still open after drain window");
                Err(ProxyError::DrainTimeout(drain))
            }
        }
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let key = self.cache_key(req.method(), req.uri());
        tracing::info!(method = %req.method(), uri = %req.uri(), "request received");

        match repository::load(&self.storage, &key).await {
            Ok(info) if info.has_checksum() => {
                metrics::counter!(telemetry::CACHE_HITS).increment(1);
                tracing::debug!(key = %key, "cache hit");
                return restore(info);
            }
            Ok(_) => tracing::debug!(key = %key, "cached entry unusable"),
            Err(CacheError::NotFound) => tracing::debug!(key = %key, "cache miss"),
            Err(e) => tracing::warn!(key = %key, error = %e, "cache lookup failed"),
        }

        metrics::counter!(telemetry::CACHE_MISSES).increment(1);
        match self.forward(req, &key).await {
            Ok(mut resp) => {
                resp.headers_mut().insert(X_CACHE, HeaderValue::from_static("MISS"));
                resp
            }
            Err(e) => origin_failure(e),
        }
    }

    async fn forward(&self, req: Request<Body>, key: &str) -> Result<Response<Body>, ForwardError> {
        let request_uri = req.uri().clone();
        let outbound = self.director.direct(req)?;

        let resp: Response<Incoming> =
            tokio::time::timeout(self.upstream_timeout, self.client.request(outbound))
                .await
                .map_err(|_| ForwardError::Timeout(self.upstream_timeout))??;

        self.interceptor.intercept(key, &request_uri, resp).await
    }
}

/// Axum entry point for every proxied path.
pub async fn proxy_handler(
    State(proxy): State<Arc<CacheableProxy>>,
    req: Request<Body>,
) -> Response<Body> {
    proxy.handle(req).await
}

/// Rebuild a client response from a cached record: stored headers, then
/// status, then body.
fn restore(info: FileInformation) -> Response<Body> {
    let mut resp = Response::new(Body::from(info.content));

    let headers = resp.headers_mut();
    for (name, values) in &info.envelope.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "skipping invalid stored header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => tracing::debug!(header = %name, "skipping invalid stored header value"),
            }
        }
    }
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));

    *resp.status_mut() = StatusCode::from_u16(info.envelope.status).unwrap_or_else(|_| {
        tracing::warn!(status = info.envelope.status, "stored status out of range, serving 200");
        StatusCode::OK
    });
    resp
}

fn origin_failure(e: ForwardError) -> Response<Body> {
    metrics::counter!(telemetry::ORIGIN_ERRORS).increment(1);
    tracing::error!(error = %e, "origin request failed");

    let status = match e {
        ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    let mut resp = Response::new(Body::from(status.canonical_reason().unwrap_or("Bad Gateway")));
    *resp.status_mut() = status;
    resp
}
