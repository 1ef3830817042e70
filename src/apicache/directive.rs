//! Extraction of the cache directive embedded in upstream response bodies.
//!
//! Only `<error code="…">…</error>` and `<cachedUntil>…</cachedUntil>` are
//! interpreted; everything else in the document is passed through verbatim.

use crate::shared::time::parse_api_datetime;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    pub error_code: i32,
    pub error_text: String,
    pub cached_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("malformed XML")]
    Xml,
    #[error("malformed cache directive")]
    Time,
}

/// Scan the body for the first `error` and `cachedUntil` elements. The whole
/// document is walked so tag mismatches anywhere surface as [`DirectiveError::Xml`];
/// a missing or unparseable `cachedUntil` is [`DirectiveError::Time`].
pub fn parse(body: &[u8]) -> Result<CacheDirective, DirectiveError> {
    let mut reader = Reader::from_reader(body);

    let mut error: Option<(i32, String)> = None;
    let mut cached_until_raw: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.name().as_ref() {
                b"error" if error.is_none() => {
                    let mut code: Option<i32> = None;
                    for attr in start.attributes() {
                        let attr = attr.map_err(|_| DirectiveError::Xml)?;
                        if attr.key.as_ref() == b"code" {
                            let raw = attr.unescape_value().map_err(|_| DirectiveError::Xml)?;
                            code = Some(raw.trim().parse().map_err(|_| DirectiveError::Xml)?);
                        }
                    }
                    let text = reader
                        .read_text(start.name())
                        .map_err(|_| DirectiveError::Xml)?;
                    error = Some((code.unwrap_or(0), text.trim().to_string()));
                }
                b"cachedUntil" if cached_until_raw.is_none() => {
                    let text = reader
                        .read_text(start.name())
                        .map_err(|_| DirectiveError::Xml)?;
                    cached_until_raw = Some(text.trim().to_string());
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return Err(DirectiveError::Xml),
        }
    }

    let cached_until = cached_until_raw
        .as_deref()
        .and_then(parse_api_datetime)
        .ok_or(DirectiveError::Time)?;

    let (error_code, error_text) = error.unwrap_or((0, String::new()));
    Ok(CacheDirective {
        error_code,
        error_text,
        cached_until,
    })
}
