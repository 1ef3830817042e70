//! Persistent response cache: fingerprint -> (status, body, expires).

mod sqlite;

pub use sqlite::SqliteCache;

use crate::shared::error::AppResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub status: u16,
    pub body: Vec<u8>,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: u64,
    pub expired: u64,
    pub body_bytes: u64,
}

/// Storage backends must be safe for concurrent use. `get` never returns an
/// entry whose expiry has passed; a corrupt entry is invalidated and reported
/// as a miss rather than served stale.
pub trait Cacher: Send + Sync + 'static {
    fn store(&self, tag: &str, status: u16, body: &[u8], expires: DateTime<Utc>) -> AppResult<()>;
    fn get(&self, tag: &str) -> AppResult<Option<CachedEntry>>;
    fn purge_expired(&self) -> AppResult<usize>;
    fn purge_all(&self) -> AppResult<usize>;
    fn stats(&self) -> AppResult<CacheStats>;
}

/// Stand-in cacher that stores nothing. Useful for tests and for running
/// the client without persistence.
#[derive(Debug, Default)]
pub struct NullCache;

impl Cacher for NullCache {
    fn store(
        &self,
        tag: &str,
        status: u16,
        _body: &[u8],
        expires: DateTime<Utc>,
    ) -> AppResult<()> {
        tracing::debug!(%tag, status, %expires, "null cache discarding entry");
        Ok(())
    }

    fn get(&self, _tag: &str) -> AppResult<Option<CachedEntry>> {
        Ok(None)
    }

    fn purge_expired(&self) -> AppResult<usize> {
        Ok(0)
    }

    fn purge_all(&self) -> AppResult<usize> {
        Ok(0)
    }

    fn stats(&self) -> AppResult<CacheStats> {
        Ok(CacheStats::default())
    }
}

/// Periodically remove expired entries in the background.
pub fn spawn_sweeper(cache: Arc<dyn Cacher>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            let swept = tokio::task::spawn_blocking(move || cache.purge_expired()).await;
            match swept {
                Ok(Ok(count)) => {
                    tracing::debug!(count, "cache sweep collected expired entries");
                }
                Ok(Err(err)) => {
                    tracing::warn!("cache sweep failed: {err}");
                }
                Err(err) => {
                    tracing::warn!("cache sweep task failed: {err}");
                }
            }
        }
    })
}
