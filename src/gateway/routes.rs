//! HTTP front: path normalization, form decoding, dispatch, serialization.

use super::handlers::{dispatch, Registry};
use super::stats;
use crate::apicache::{synthesize_error, ApiClient, ApiRequest};
use crate::cache::Cacher;
use crate::gateway::workers::WorkerPool;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_FORM_BYTES: usize = 1024 * 1024;
const UNKNOWN_PAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SLOW_REQUEST: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct GatewayState {
    pub client: Arc<ApiClient>,
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<Registry>,
    pub cache: Arc<dyn Cacher>,
    pub retries: u32,
    pub log_requests: bool,
    pub censor_log: bool,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/stats", get(stats_page))
        .route("/logon", get(logon))
        .route("/logoff", get(logoff))
        .fallback(proxy_any)
        .with_state(state)
}

async fn stats_page(State(state): State<GatewayState>) -> Response {
    let text = stats::stats_text(&state).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
        .into_response()
}

async fn logon() -> Response {
    let level = stats::enable_verbose();
    tracing::info!(level, "verbose logging increased");
    StatusCode::OK.into_response()
}

async fn logoff() -> Response {
    stats::disable_verbose();
    tracing::info!("verbose logging disabled");
    StatusCode::OK.into_response()
}

/// Collapse duplicate slashes and `.`/`..` segments, drop any trailing
/// slash, and keep the result rooted.
pub fn clean_path(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn is_form_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.trim()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
        .unwrap_or(false)
}

fn xml_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

async fn proxy_any(State(state): State<GatewayState>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let path = clean_path(parts.uri.path());

    let level = stats::verbosity();
    if level >= 5 {
        tracing::info!(%path, "starting request");
    }

    let Some(kind) = state.registry.lookup(&path) else {
        tracing::info!(%path, "invalid page requested");
        return xml_response(
            StatusCode::NOT_FOUND,
            synthesize_error(404, "Invalid API page.", UNKNOWN_PAGE_TTL),
        );
    };

    // Parameters come from the query string and, for form posts, the body;
    // body values win on collision.
    let mut params: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    if is_form_content_type(&parts.headers) {
        match axum::body::to_bytes(body, MAX_FORM_BYTES).await {
            Ok(bytes) => {
                params.extend(url::form_urlencoded::parse(&bytes).into_owned());
            }
            Err(err) => {
                tracing::warn!(%path, "failed to read request body: {err}");
            }
        }
    }

    let mut request = ApiRequest::new(&path);
    for (key, value) in params {
        match key.trim().to_ascii_lowercase().as_str() {
            "force" => request.force = truthy(&value),
            "nocache" => request.no_cache = truthy(&value),
            _ => request.set(&key, value),
        }
    }

    let response = dispatch(&state, kind, request).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let out = xml_response(status, response.body);

    let elapsed = started.elapsed();
    if level >= 4 {
        tracing::info!(%path, "request took {:.2}s", elapsed.as_secs_f64());
    } else if level >= 1 && elapsed > SLOW_REQUEST {
        tracing::warn!(%path, "slow request took {:.2}s", elapsed.as_secs_f64());
    }

    out
}
