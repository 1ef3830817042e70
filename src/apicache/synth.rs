//! Synthetic upstream-style error documents.

use crate::shared::time::format_api_datetime;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Build an error document in the upstream's own schema so downstream
/// clients can parse proxy failures exactly like real upstream errors.
pub fn synthesize_error(code: i32, text: &str, ttl: Duration) -> Vec<u8> {
    synthesize_error_at(Utc::now(), code, text, ttl)
}

pub(crate) fn synthesize_error_at(
    now: DateTime<Utc>,
    code: i32,
    text: &str,
    ttl: Duration,
) -> Vec<u8> {
    let expires = now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
    format!(
        "<eveapi version=\"2\">\n\
         <currentTime>{}</currentTime>\n\
         <error code=\"{}\">{}</error>\n\
         <cachedUntil>{}</cachedUntil>\n\
         </eveapi>",
        format_api_datetime(now),
        code,
        text,
        format_api_datetime(expires),
    )
    .into_bytes()
}
