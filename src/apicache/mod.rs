//! Caching upstream API client: cache consultation, temp-ban gating,
//! retried POSTs, cache-directive parsing, and cache writeback.

pub mod directive;
pub mod request;
pub mod synth;

pub use directive::{CacheDirective, DirectiveError};
pub use request::ApiRequest;
pub use synth::synthesize_error;

use crate::cache::Cacher;
use crate::shared::error::AppResult;
use crate::shared::time::format_api_datetime;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Status used for responses short-circuited by an active temp-ban.
pub const PANIC_STATUS: u16 = 418;
/// Status used for synthetic proxy-failure responses.
pub const PROXY_ERROR_STATUS: u16 = 504;

const TRANSPORT_ERROR_TTL: Duration = Duration::from_secs(5 * 60);
const MALFORMED_ERROR_TTL: Duration = Duration::from_secs(15 * 60);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDLE_CONNECTIONS: usize = 64;
const MAX_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Error reported inside an upstream response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiError {
    pub code: i32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Raw XML body, upstream or synthesized. Never empty.
    pub body: Vec<u8>,
    /// Whether the body was served without contacting the upstream.
    pub from_cache: bool,
    /// When the body stops being valid.
    pub expires: DateTime<Utc>,
    /// Hint that caller-supplied credentials were rejected.
    pub invalidate: bool,
    /// Upstream business error, if any (zero code means none).
    pub error: ApiError,
    /// HTTP status to relay to the caller.
    pub status: u16,
}

#[derive(Debug, Clone)]
struct PanicState {
    until: DateTime<Utc>,
    code: i32,
    reason: String,
}

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("timeout reading upstream response")]
    Timeout,
    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

pub struct ApiClient {
    base_url: String,
    retries: u32,
    timeout: Duration,
    http: reqwest::Client,
    cacher: Arc<dyn Cacher>,
    panic: RwLock<Option<PanicState>>,
}

fn compute_invalidate(status: u16, error_code: i32) -> bool {
    status == 403 || (100..=299).contains(&error_code)
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        user_agent: &str,
        timeout: Duration,
        retries: u32,
        cacher: Arc<dyn Cacher>,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .build()
            .map_err(|e| format!("HTTP_CLIENT_INIT: {e}"))?;

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        let timeout = if timeout.is_zero() || timeout > MAX_TIMEOUT {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };

        Ok(Self {
            base_url,
            retries,
            timeout,
            http,
            cacher,
            panic: RwLock::new(None),
        })
    }

    /// Cache-only lookup; `None` when the entry is absent, expired, or the
    /// request opted out of cache reads.
    pub fn get_cached(&self, request: &ApiRequest) -> Option<ApiResponse> {
        if request.force || request.no_cache {
            return None;
        }
        let tag = request.fingerprint();
        match self.cacher.get(&tag) {
            Ok(Some(entry)) => Some(ApiResponse {
                body: entry.body,
                from_cache: true,
                expires: entry.expires,
                invalidate: false,
                error: ApiError::default(),
                status: entry.status,
            }),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%tag, "cache read failed: {err}");
                None
            }
        }
    }

    /// Active temp-ban window, if any. For observability only.
    pub fn panic_snapshot(&self) -> Option<(DateTime<Utc>, i32)> {
        let guard = self.panic.read().unwrap_or_else(|p| p.into_inner());
        guard
            .as_ref()
            .filter(|p| p.until > Utc::now())
            .map(|p| (p.until, p.code))
    }

    /// Perform the request: cache, panic gate, upstream POST with retries,
    /// directive parse, panic detection, writeback. Every failure path yields
    /// a well-formed synthetic response, never an empty body.
    pub async fn execute(&self, request: &ApiRequest) -> ApiResponse {
        let tag = request.fingerprint();

        if let Some(hit) = self.get_cached(request) {
            return hit;
        }

        if let Some(banned) = self.panic_short_circuit(request, &tag) {
            return banned;
        }

        let (status, body) = match self.post_with_retries(request).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(path = request.path(), "upstream unreachable: {err}");
                return self.synthesize_and_store(
                    request,
                    &tag,
                    format!("APIProxy Error: {err}"),
                    TRANSPORT_ERROR_TTL,
                );
            }
        };

        let parsed = match directive::parse(&body) {
            Ok(directive) => directive,
            Err(err) => {
                tracing::warn!(path = request.path(), "unusable upstream body: {err}");
                return self.synthesize_and_store(
                    request,
                    &tag,
                    format!("APIProxy Error: {err}"),
                    MALFORMED_ERROR_TTL,
                );
            }
        };

        let mut expires = parsed.cached_until;
        if let Some(floor) = request.expires_floor {
            if floor > expires {
                expires = floor;
            }
        }

        if (901..=905).contains(&parsed.error_code) {
            self.enter_panic(parsed.error_code, &parsed.error_text, expires, request);
        }

        let error = ApiError {
            code: parsed.error_code,
            text: parsed.error_text,
        };
        let response = ApiResponse {
            invalidate: compute_invalidate(status, error.code),
            body,
            from_cache: false,
            expires,
            error,
            status,
        };

        if !request.no_cache {
            self.store(&tag, &response);
        }
        response
    }

    fn panic_short_circuit(&self, request: &ApiRequest, tag: &str) -> Option<ApiResponse> {
        let now = Utc::now();
        let panic = {
            let guard = self.panic.read().unwrap_or_else(|p| p.into_inner());
            guard.clone()?
        };
        if panic.until <= now {
            return None;
        }

        let ttl = (panic.until - now).to_std().unwrap_or_default();
        let response = ApiResponse {
            body: synthesize_error(panic.code, &panic.reason, ttl),
            from_cache: true,
            expires: panic.until,
            invalidate: false,
            error: ApiError {
                code: panic.code,
                text: panic.reason,
            },
            status: PANIC_STATUS,
        };
        if !request.no_cache {
            self.store(tag, &response);
        }
        Some(response)
    }

    fn enter_panic(&self, code: i32, reason: &str, until: DateTime<Utc>, request: &ApiRequest) {
        tracing::warn!(
            code,
            path = request.path(),
            "major upstream error: {reason}"
        );
        tracing::warn!(
            "pausing all upstream requests until {}",
            format_api_datetime(until)
        );
        let mut guard = self.panic.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(PanicState {
            until,
            code,
            reason: reason.to_string(),
        });
    }

    fn synthesize_and_store(
        &self,
        request: &ApiRequest,
        tag: &str,
        text: String,
        ttl: Duration,
    ) -> ApiResponse {
        let response = ApiResponse {
            body: synthesize_error(500, &text, ttl),
            from_cache: false,
            expires: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            invalidate: false,
            error: ApiError::default(),
            status: PROXY_ERROR_STATUS,
        };
        if !request.no_cache {
            self.store(tag, &response);
        }
        response
    }

    fn store(&self, tag: &str, response: &ApiResponse) {
        if let Err(err) =
            self.cacher
                .store(tag, response.status, &response.body, response.expires)
        {
            tracing::warn!(%tag, "cache store failed: {err}");
        }
    }

    async fn post_with_retries(
        &self,
        request: &ApiRequest,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let url = format!("{}{}", self.base_url, request.path());
        let total = self.retries.max(1);
        let mut last = None;

        for attempt in 1..=total {
            match self.post_once(&url, request.params()).await {
                Ok(pair) => return Ok(pair),
                Err(err) => {
                    tracing::warn!(
                        path = request.path(),
                        attempt,
                        total,
                        "upstream attempt failed: {err}"
                    );
                    last = Some(err);
                    if attempt < total {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        Err(last.unwrap_or(TransportError::Timeout))
    }

    async fn post_once(
        &self,
        url: &str,
        form: &BTreeMap<String, String>,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let attempt = async {
            let resp = self.http.post(url).form(form).send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok::<_, TransportError>((status, body.to_vec()))
        };

        // The deadline covers the full body read. On expiry the in-flight
        // transfer is dropped and any late bytes are discarded.
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}
