//! Upstream request description and its cache fingerprint.

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// A single upstream API call: endpoint path plus normalized form parameters.
///
/// Parameter keys are case-folded and trimmed on insertion, so two requests
/// that differ only in key spelling or insertion order share a fingerprint.
#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    path: String,
    params: BTreeMap<String, String>,

    /// Bypass the cache read but still store the fresh result.
    pub force: bool,
    /// Bypass the cache entirely, neither reading nor writing.
    pub no_cache: bool,
    /// Raises the resulting cache expiry, never lowers it. Used to keep
    /// dependent endpoints expiring in lockstep.
    pub expires_floor: Option<DateTime<Utc>>,
}

impl ApiRequest {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.trim_start_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.params
            .insert(key.trim().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.params.remove(key)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// 40-hex-char cache tag: sha1 over `key: value\n` lines in ascending key
    /// order, followed by the path with no separator.
    pub fn fingerprint(&self) -> String {
        let mut digest = Sha1::new();
        for (key, value) in &self.params {
            digest.update(format!("{key}: {value}\n"));
        }
        digest.update(&self.path);
        let out = digest.finalize();
        format!("{out:x}")
    }
}
