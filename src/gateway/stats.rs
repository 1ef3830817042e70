//! Request logging, runtime verbosity, and the /stats counter dump.

use super::routes::GatewayState;
use crate::apicache::{ApiRequest, ApiResponse};
use crate::shared::time::format_api_datetime;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

pub fn enable_verbose() -> i32 {
    VERBOSITY.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn disable_verbose() {
    VERBOSITY.store(0, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy)]
pub(super) enum RequestSource {
    Cache,
    Worker(usize),
}

fn censor_value(key: &str, value: &str, level: i32, censor: bool) -> String {
    // Full credentials only show up at high verbosity with censoring off.
    if key == "vcode" && value.len() == 64 && censor && level < 3 {
        format!("{}...", &value[..8])
    } else {
        value.to_string()
    }
}

pub(super) fn log_request(
    state: &GatewayState,
    request: &ApiRequest,
    response: &ApiResponse,
    source: RequestSource,
) {
    let level = verbosity();
    let from_worker = matches!(source, RequestSource::Worker(_));

    let wanted = (from_worker || level > 0)
        && (level >= 2 || state.log_requests || response.status != 200);
    if !wanted {
        return;
    }

    let mut query = String::new();
    for (key, value) in request.params() {
        let sep = if query.is_empty() { '?' } else { '&' };
        let shown = censor_value(key, value, level, state.censor_log);
        let _ = write!(query, "{sep}{key}={shown}");
    }

    let source = match source {
        RequestSource::Cache => "cache".to_string(),
        RequestSource::Worker(id) => format!("w{id}"),
    };
    let error = if response.error.code != 0 {
        format!(" Error {}: {}", response.error.code, response.error.text)
    } else {
        String::new()
    };

    tracing::info!(
        "{source}: /{}{query} HTTP: {} Expires: {}{error}",
        request.path(),
        response.status,
        format_api_datetime(response.expires),
    );
}

pub(super) async fn stats_text(state: &GatewayState) -> String {
    let workers = state.pool.stats();
    let mut out = String::new();

    let idle = workers.online.saturating_sub(workers.active);
    let _ = writeln!(out, "workers: {idle} idle, {} active", workers.active);
    for (id, count) in workers.counts.iter().enumerate() {
        let _ = writeln!(out, "  worker {id}: {count} requests");
    }

    match state.cache.stats() {
        Ok(cache) => {
            let _ = writeln!(
                out,
                "cache: {} entries ({} expired), {} body bytes",
                cache.entries, cache.expired, cache.body_bytes
            );
        }
        Err(err) => {
            let _ = writeln!(out, "cache: unavailable ({err})");
        }
    }

    let (rps, errors) = state.pool.limiter_counts().await;
    let _ = writeln!(
        out,
        "limits: {rps} events in req/s window, {errors} events in error window"
    );

    match state.client.panic_snapshot() {
        Some((until, code)) => {
            let _ = writeln!(
                out,
                "panic: code {code} until {}",
                format_api_datetime(until)
            );
        }
        None => {
            let _ = writeln!(out, "panic: clear");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::censor_value;

    const VCODE: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn long_vcode_values_are_censored_by_default() {
        assert_eq!(censor_value("vcode", VCODE, 0, true), "01234567...");
    }

    #[test]
    fn high_verbosity_shows_the_full_value() {
        assert_eq!(censor_value("vcode", VCODE, 3, true), VCODE);
    }

    #[test]
    fn censoring_only_applies_to_vcode() {
        assert_eq!(censor_value("keyid", VCODE, 0, true), VCODE);
    }

    #[test]
    fn short_vcode_values_pass_through() {
        assert_eq!(censor_value("vcode", "abc", 0, true), "abc");
    }
}
