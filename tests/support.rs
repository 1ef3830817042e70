//! Shared helpers for integration tests: a scriptable mock upstream plus a
//! fully wired proxy instance listening on an ephemeral port.

#![allow(dead_code)]

use apiproxy::apicache::ApiClient;
use apiproxy::cache::{Cacher, SqliteCache};
use apiproxy::gateway::{build_router, GatewayState, Registry, WorkerPool, WorkerPoolConfig};
use apiproxy::shared::time::format_api_datetime;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted upstream behavior: `(path, form params) -> (status, body)`.
pub type UpstreamFn = dyn Fn(&str, &BTreeMap<String, String>) -> (u16, String) + Send + Sync;

#[derive(Clone)]
struct UpstreamState {
    handler: Arc<UpstreamFn>,
    hits: Arc<AtomicUsize>,
}

async fn upstream_any(State(state): State<UpstreamState>, req: Request<Body>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let path = req.uri().path().to_string();
    let bytes = axum::body::to_bytes(req.into_body(), 1 << 20)
        .await
        .unwrap_or_default();
    let params: BTreeMap<String, String> =
        url::form_urlencoded::parse(&bytes).into_owned().collect();
    let (status, body) = (state.handler)(&path, &params);
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "text/xml")],
        body,
    )
        .into_response()
}

pub struct TestProxy {
    pub base_url: String,
    pub state: GatewayState,
    upstream_hits: Arc<AtomicUsize>,
    http: reqwest::Client,
    _cache_dir: tempfile::TempDir,
}

impl TestProxy {
    pub fn hits(&self) -> usize {
        self.upstream_hits.load(Ordering::SeqCst)
    }

    pub async fn get(&self, path_and_query: &str) -> (u16, String) {
        let resp = self
            .http
            .get(format!("{}{path_and_query}", self.base_url))
            .send()
            .await
            .expect("proxy request");
        let status = resp.status().as_u16();
        let body = resp.text().await.expect("proxy body");
        (status, body)
    }
}

pub async fn start_proxy(handler: Arc<UpstreamFn>, retries: u32) -> TestProxy {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = Router::new()
        .fallback(upstream_any)
        .with_state(UpstreamState {
            handler,
            hits: hits.clone(),
        });
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(upstream_listener, upstream).await.unwrap();
    });

    let cache_dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn Cacher> =
        Arc::new(SqliteCache::open(&cache_dir.path().join("apicache.db")).unwrap());
    let client = Arc::new(
        ApiClient::new(
            &format!("http://{upstream_addr}/"),
            "apiproxy-tests",
            Duration::from_secs(5),
            retries,
            cache.clone(),
        )
        .unwrap(),
    );
    let pool = Arc::new(WorkerPool::start(
        client.clone(),
        WorkerPoolConfig {
            workers: 4,
            requests_per_second: 1000,
            max_errors: 1000,
            error_period: Duration::from_secs(60),
        },
    ));
    let state = GatewayState {
        client,
        pool,
        registry: Arc::new(Registry::with_defaults()),
        cache,
        retries,
        log_requests: false,
        censor_log: true,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestProxy {
        base_url: format!("http://{addr}"),
        state,
        upstream_hits: hits,
        http: reqwest::Client::new(),
        _cache_dir: cache_dir,
    }
}

pub fn timestamp_in(seconds: i64) -> String {
    format_api_datetime(Utc::now() + ChronoDuration::seconds(seconds))
}

pub fn ok_body(cached_until: &str, payload: &str) -> String {
    format!(
        "<eveapi version=\"2\">\n<currentTime>{}</currentTime>\n{payload}\n<cachedUntil>{cached_until}</cachedUntil>\n</eveapi>",
        format_api_datetime(Utc::now()),
    )
}

pub fn error_body(code: i32, text: &str, cached_until: &str) -> String {
    ok_body(cached_until, &format!("<error code=\"{code}\">{text}</error>"))
}
