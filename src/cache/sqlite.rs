//! SQLite-backed cache store.

use super::{CacheStats, CachedEntry, Cacher};
use crate::shared::error::{db_err, AppResult};
use crate::shared::time::now_unix_seconds;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);
const POOL_MAX_SIZE: u32 = 8;

pub struct SqliteCache {
    pool: Pool<SqliteConnectionManager>,
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

impl SqliteCache {
    pub fn open(path: &Path) -> AppResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(init_connection);
        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .build(manager)
            .map_err(|e| db_err!("failed to open cache database: {e}"))?;

        let conn = pool
            .get()
            .map_err(|e| db_err!("failed to acquire cache connection: {e}"))?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS apicache (
    cacheid     TEXT PRIMARY KEY,
    http_status INTEGER NOT NULL,
    body        BLOB NOT NULL,
    expires     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_apicache_expires ON apicache (expires);
"#,
        )
        .map_err(|e| db_err!("failed to create cache schema: {e}"))?;

        Ok(Self { pool })
    }

    fn conn(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| db_err!("failed to acquire cache connection: {e}"))
    }

    fn delete_tag(&self, tag: &str) {
        if let Ok(conn) = self.conn() {
            let _ = conn.execute("DELETE FROM apicache WHERE cacheid = ?1", params![tag]);
        }
    }
}

impl Cacher for SqliteCache {
    fn store(&self, tag: &str, status: u16, body: &[u8], expires: DateTime<Utc>) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "REPLACE INTO apicache (cacheid, http_status, body, expires) VALUES (?1, ?2, ?3, ?4)",
            params![tag, status as i64, body, expires.timestamp()],
        )
        .map_err(|e| db_err!("failed to store cache entry: {e}"))?;
        Ok(())
    }

    fn get(&self, tag: &str) -> AppResult<Option<CachedEntry>> {
        let conn = self.conn()?;
        let now = now_unix_seconds() as i64;
        let row = conn
            .query_row(
                "SELECT http_status, body, expires FROM apicache WHERE cacheid = ?1 AND expires > ?2",
                params![tag, now],
                |row| {
                    let status: i64 = row.get(0)?;
                    let body: Vec<u8> = row.get(1)?;
                    let expires: i64 = row.get(2)?;
                    Ok((status, body, expires))
                },
            )
            .optional()
            .map_err(|e| db_err!("failed to read cache entry: {e}"))?;

        let Some((status, body, expires)) = row else {
            return Ok(None);
        };

        let Ok(status) = u16::try_from(status) else {
            tracing::warn!(%tag, status, "invalidating cache entry with bad status");
            self.delete_tag(tag);
            return Ok(None);
        };
        let Some(expires) = DateTime::<Utc>::from_timestamp(expires, 0) else {
            tracing::warn!(%tag, expires, "invalidating cache entry with bad expiry");
            self.delete_tag(tag);
            return Ok(None);
        };

        Ok(Some(CachedEntry {
            status,
            body,
            expires,
        }))
    }

    fn purge_expired(&self) -> AppResult<usize> {
        let conn = self.conn()?;
        let now = now_unix_seconds() as i64;
        conn.execute("DELETE FROM apicache WHERE expires <= ?1", params![now])
            .map_err(|e| db_err!("failed to purge expired cache entries: {e}"))
    }

    fn purge_all(&self) -> AppResult<usize> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM apicache", [])
            .map_err(|e| db_err!("failed to clear cache: {e}"))
    }

    fn stats(&self) -> AppResult<CacheStats> {
        let conn = self.conn()?;
        let now = now_unix_seconds() as i64;
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(expires <= ?1), 0),
                    COALESCE(SUM(LENGTH(body)), 0)
             FROM apicache",
            params![now],
            |row| {
                Ok(CacheStats {
                    entries: row.get::<_, i64>(0)? as u64,
                    expired: row.get::<_, i64>(1)? as u64,
                    body_bytes: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(|e| db_err!("failed to read cache stats: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteCache;
    use crate::cache::Cacher;
    use chrono::{Duration, Utc};

    fn open_temp() -> (tempfile::TempDir, SqliteCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = SqliteCache::open(&dir.path().join("apicache.db")).expect("open cache");
        (dir, cache)
    }

    #[test]
    fn stores_and_returns_unexpired_entries() {
        let (_dir, cache) = open_temp();
        let expires = Utc::now() + Duration::hours(1);
        cache.store("tag-a", 200, b"<eveapi/>", expires).unwrap();

        let entry = cache.get("tag-a").unwrap().expect("hit");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, b"<eveapi/>");
        assert_eq!(entry.expires.timestamp(), expires.timestamp());
    }

    #[test]
    fn expired_entries_are_misses() {
        let (_dir, cache) = open_temp();
        let expires = Utc::now() - Duration::seconds(1);
        cache.store("tag-b", 200, b"old", expires).unwrap();
        assert!(cache.get("tag-b").unwrap().is_none());
    }

    #[test]
    fn store_replaces_existing_entries() {
        let (_dir, cache) = open_temp();
        let expires = Utc::now() + Duration::hours(1);
        cache.store("tag-c", 200, b"first", expires).unwrap();
        cache.store("tag-c", 504, b"second", expires).unwrap();

        let entry = cache.get("tag-c").unwrap().expect("hit");
        assert_eq!(entry.status, 504);
        assert_eq!(entry.body, b"second");
    }

    #[test]
    fn purge_expired_removes_only_dead_rows() {
        let (_dir, cache) = open_temp();
        cache
            .store("live", 200, b"x", Utc::now() + Duration::hours(1))
            .unwrap();
        cache
            .store("dead", 200, b"y", Utc::now() - Duration::hours(1))
            .unwrap();

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(cache.get("live").unwrap().is_some());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.expired, 0);
    }

    #[test]
    fn purge_all_empties_the_store() {
        let (_dir, cache) = open_temp();
        cache
            .store("a", 200, b"x", Utc::now() + Duration::hours(1))
            .unwrap();
        cache
            .store("b", 200, b"y", Utc::now() + Duration::hours(1))
            .unwrap();

        assert_eq!(cache.purge_all().unwrap(), 2);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }
}
