//! Bisection repair for endpoints taking comma-separated id lists.
//!
//! Some endpoints fail an entire batched request (error 135) when a single
//! id is invalid. When a caller opts in with a `fix` parameter, the invalid
//! ids are isolated by binary search and the request is re-issued with only
//! the valid subset.

use super::handlers::api_request;
use super::routes::GatewayState;
use crate::apicache::{ApiRequest, ApiResponse, PROXY_ERROR_STATUS};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

const INVALID_ID_ERROR_CODE: i32 = 135;
/// Best-effort ceiling; massed concurrent probes can overshoot slightly, the
/// point is to keep a pathological request from running away.
const MAX_ID_ERRORS: u32 = 16;
/// The upstream rejects batches beyond this size outright.
const MAX_IDS: usize = 250;

enum RepairAbort {
    /// Error ceiling reached or a transport failure; keep the original reply.
    GiveUp,
    /// A probe hit a real upstream error; surface that response instead.
    Surface(ApiResponse),
}

pub(super) async fn run(state: &GatewayState, mut request: ApiRequest) -> ApiResponse {
    let fix = request.remove("fix").is_some();

    let original = api_request(state, request.clone()).await;
    if !fix {
        return original;
    }

    let ids: Vec<String> = match request.get("ids") {
        Some(raw) => raw.split(',').map(str::to_string).collect(),
        None => return original,
    };
    // Nothing to bisect for single ids; oversized batches fail upstream
    // regardless of their content.
    if ids.len() <= 1 || ids.len() > MAX_IDS {
        return original;
    }
    if original.error.code != INVALID_ID_ERROR_CODE {
        return original;
    }

    tracing::debug!(
        path = request.path(),
        count = ids.len(),
        "isolating invalid ids"
    );

    let errors = AtomicU32::new(0);
    let valid = match find_valid(state, &request, &ids, &errors).await {
        Ok(valid) => valid,
        Err(RepairAbort::GiveUp) => {
            tracing::debug!(
                path = request.path(),
                errors = errors.load(Ordering::Relaxed),
                "id repair abandoned"
            );
            return original;
        }
        Err(RepairAbort::Surface(response)) => return response,
    };
    if valid.is_empty() {
        return original;
    }

    let mut fixed = request.clone();
    fixed.set("ids", valid.join(","));
    let response = api_request(state, fixed).await;
    tracing::debug!(
        path = request.path(),
        errors = errors.load(Ordering::Relaxed),
        kept = valid.len(),
        "id repair complete"
    );
    response
}

/// In-order subsequence of `ids` that probes as valid. Each half is probed
/// whole before being split further, so a valid run costs a single request.
fn find_valid<'a>(
    state: &'a GatewayState,
    base: &'a ApiRequest,
    ids: &'a [String],
    errors: &'a AtomicU32,
) -> Pin<Box<dyn Future<Output = Result<Vec<String>, RepairAbort>> + Send + 'a>> {
    Box::pin(async move {
        if errors.load(Ordering::Relaxed) >= MAX_ID_ERRORS {
            return Err(RepairAbort::GiveUp);
        }

        let (left, right) = ids.split_at(ids.len() / 2);
        let mut valid = Vec::with_capacity(ids.len());

        for side in [left, right] {
            if probe(state, base, side, errors).await? {
                valid.extend_from_slice(side);
            } else if side.len() > 1 {
                valid.extend(find_valid(state, base, side, errors).await?);
            }
        }

        Ok(valid)
    })
}

async fn probe(
    state: &GatewayState,
    base: &ApiRequest,
    ids: &[String],
    errors: &AtomicU32,
) -> Result<bool, RepairAbort> {
    if errors.load(Ordering::Relaxed) >= MAX_ID_ERRORS {
        return Err(RepairAbort::GiveUp);
    }

    let mut request = base.clone();
    request.set("ids", ids.join(","));
    let response = api_request(state, request).await;

    if response.status == PROXY_ERROR_STATUS {
        return Err(RepairAbort::GiveUp);
    }
    match response.error.code {
        0 => Ok(true),
        INVALID_ID_ERROR_CODE => {
            errors.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
        _ => Err(RepairAbort::Surface(response)),
    }
}
