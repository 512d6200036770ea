use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use cacheproxy::proxy::{HttpClient, X_CACHE};
use cacheproxy::{
    CacheError, CacheStorage, CacheableProxy, FileEnvelope, FileInformation, ProxyError,
    ProxySettings, RemoteFileCache, StoreSettings,
};
use chrono::Utc;
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const UNREACHABLE: &str = "http://127.0.0.1:9";

struct Origin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Origin {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn page(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "text/html")], "<html>origin</html>")
}

async fn blob(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        vec![0u8, 1, 2, 3],
    )
}

async fn slow(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    ([(header::CONTENT_TYPE, "text/html")], "<html>late</html>")
}

async fn spawn_origin() -> Origin {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/page.html", get(page))
        .route("/blob", get(blob))
        .route("/slow.html", get(slow))
        .with_state(Arc::clone(&hits));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Origin { addr, hits }
}

struct RunningProxy {
    proxy: Arc<CacheableProxy>,
    addr: String,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), ProxyError>>,
}

impl RunningProxy {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) -> Result<(), ProxyError> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("proxy should stop promptly")
            .unwrap()
    }
}

fn test_settings() -> ProxySettings {
    ProxySettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn start_proxy(storage: Arc<dyn CacheStorage>, target: &str) -> RunningProxy {
    start_proxy_with(storage, target, test_settings()).await
}

async fn start_proxy_with(
    storage: Arc<dyn CacheStorage>,
    target: &str,
    settings: ProxySettings,
) -> RunningProxy {
    let proxy = Arc::new(CacheableProxy::new(storage, target, settings).unwrap());

    let shutdown = CancellationToken::new();
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(Arc::clone(&proxy).listen(shutdown.clone(), tx));
    let addr = rx.await.unwrap();

    RunningProxy {
        proxy,
        addr,
        shutdown,
        handle,
    }
}

fn open_cache(dir: &TempDir) -> Arc<RemoteFileCache> {
    Arc::new(RemoteFileCache::open(StoreSettings::new(dir.path())).unwrap())
}

fn client() -> HttpClient {
    let connector = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .unwrap()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new()).build(connector)
}

async fn fetch(client: &HttpClient, url: &str) -> (StatusCode, HeaderMap, Bytes) {
    let req = Request::get(url).body(Body::empty()).unwrap();
    let resp = client.request(req).await.unwrap();
    let (parts, body) = resp.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

struct FailingStorage;

impl CacheStorage for FailingStorage {
    fn get(&self, _key: &str) -> Result<FileInformation, CacheError> {
        Err(CacheError::Task("store offline".into()))
    }

    fn set(&self, _key: &str, _info: &FileInformation) -> Result<(), CacheError> {
        Err(CacheError::Task("store offline".into()))
    }
}

#[tokio::test]
async fn seeded_entry_is_served_without_origin() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), UNREACHABLE).await;

    let port = running.proxy.port();
    assert_ne!(port, 0);
    assert_eq!(running.proxy.serve_host(), format!(":{port}"));
    assert!(running.addr.ends_with(&format!(":{port}")));

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), vec!["text/html".to_string()]);
    let now = Utc::now();
    let key = running
        .proxy
        .cache_key(&Method::GET, &"/index.html".parse().unwrap());
    cache
        .set(
            &key,
            &FileInformation {
                envelope: FileEnvelope { headers, status: 200 },
                content: Bytes::from_static(b"<html>cached</html>"),
                checksum: cacheproxy::sniff::checksum(b"<html>cached</html>"),
                created_at: now,
                modified_at: now,
                ..Default::default()
            },
        )
        .unwrap();

    let (status, headers, body) = fetch(&client(), &running.url("/index.html")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/html");
    assert_eq!(headers[X_CACHE], "HIT");
    assert_eq!(&body[..], b"<html>cached</html>");

    running.stop().await.unwrap();
    cache.close().await.unwrap();
}

#[tokio::test]
async fn miss_then_hit() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), &origin.url()).await;
    let client = client();

    let (status, headers, first) = fetch(&client, &running.url("/page.html")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[X_CACHE], "MISS");
    assert_eq!(&first[..], b"<html>origin</html>");

    let (status, headers, second) = fetch(&client, &running.url("/page.html")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[X_CACHE], "HIT");
    assert_eq!(headers[header::CONTENT_TYPE], "text/html");
    assert_eq!(second, first);

    assert_eq!(origin.hits(), 1);
    running.stop().await.unwrap();
    cache.close().await.unwrap();
}

#[tokio::test]
async fn untracked_content_is_always_forwarded() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), &origin.url()).await;
    let client = client();

    for _ in 0..2 {
        let (status, headers, body) = fetch(&client, &running.url("/blob")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[X_CACHE], "MISS");
        assert_eq!(&body[..], &[0u8, 1, 2, 3][..]);
    }

    assert_eq!(origin.hits(), 2);
    assert_eq!(cache.stats().entries, 0);
    running.stop().await.unwrap();
    cache.close().await.unwrap();
}

#[tokio::test]
async fn entries_survive_restart() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();

    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), &origin.url()).await;
    fetch(&client(), &running.url("/page.html")).await;
    running.stop().await.unwrap();
    cache.close().await.unwrap();
    drop(cache);

    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), &origin.url()).await;
    let (_, headers, body) = fetch(&client(), &running.url("/page.html")).await;
    assert_eq!(headers[X_CACHE], "HIT");
    assert_eq!(&body[..], b"<html>origin</html>");
    assert_eq!(origin.hits(), 1);

    running.stop().await.unwrap();
    cache.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), UNREACHABLE).await;

    let (status, _, _) = fetch(&client(), &running.url("/page.html")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    running.stop().await.unwrap();
    cache.close().await.unwrap();
}

#[tokio::test]
async fn storage_failures_fail_open() {
    let origin = spawn_origin().await;
    let running = start_proxy(Arc::new(FailingStorage), &origin.url()).await;
    let client = client();

    for _ in 0..2 {
        let (status, headers, body) = fetch(&client, &running.url("/page.html")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[X_CACHE], "MISS");
        assert_eq!(&body[..], b"<html>origin</html>");
    }

    assert_eq!(origin.hits(), 2);
    running.stop().await.unwrap();
}

#[tokio::test]
async fn redirect_transport_replays_through_proxy() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let running = start_proxy(cache.clone(), &origin.url()).await;

    let transport = running.proxy.redirect_transport().unwrap();
    let direct_url = format!("{}/page.html", origin.url());

    for expected in ["MISS", "HIT"] {
        let req = Request::get(direct_url.as_str()).body(Body::empty()).unwrap();
        let resp = transport.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[X_CACHE], expected);
    }

    assert_eq!(origin.hits(), 1);
    running.stop().await.unwrap();
    cache.close().await.unwrap();
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let proxy = Arc::new(
        CacheableProxy::new(
            Arc::new(FailingStorage),
            UNREACHABLE,
            ProxySettings {
                host: "127.0.0.1".to_string(),
                port,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let (tx, rx) = oneshot::channel();
    let result = proxy.listen(CancellationToken::new(), tx).await;

    assert!(matches!(result, Err(ProxyError::Bind { .. })));
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn drain_deadline_bounds_shutdown() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let drain = Duration::from_millis(300);
    let running = start_proxy_with(
        cache.clone(),
        &origin.url(),
        ProxySettings {
            upstream_timeout: Duration::from_secs(60),
            drain_timeout: drain,
            ..test_settings()
        },
    )
    .await;

    let client = client();
    let url = running.url("/slow.html");
    let in_flight = tokio::spawn(async move {
        let req = Request::get(url).body(Body::empty()).unwrap();
        client.request(req).await
    });
    for _ in 0..100 {
        if origin.hits() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(origin.hits(), 1, "request should be waiting on the origin");

    let started = Instant::now();
    running.shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("listen must return once the drain window closes")
        .unwrap();

    assert!(matches!(result, Err(ProxyError::DrainTimeout(d)) if d == drain));
    assert!(started.elapsed() >= drain);
    assert!(started.elapsed() < Duration::from_secs(3));

    in_flight.abort();
    cache.close().await.unwrap();
}
