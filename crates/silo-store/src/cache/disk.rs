//! Persistent path-info cache (tier 2).
//!
//! A small SQLite database shared by every process talking to the same
//! caches, keyed by `(cache url, hash part)`. Entries carry the raw
//! narinfo text for positive answers and a presence flag for negative
//! ones, with the same TTL semantics as the in-process tier.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::path_info::{timestamp_secs, TTL_NEGATIVE_SECS, TTL_POSITIVE_SECS};

const DB_FILENAME: &str = "narinfo-cache.sqlite";

/// A cached lookup: `Absent` is a remembered miss.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DiskCacheHit {
    Absent,
    Present(String),
}

pub(crate) struct DiskCache {
    conn: Mutex<Connection>,
}

impl DiskCache {
    /// Open (creating if needed) the cache under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        let path = dir.join(DB_FILENAME);
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open path-info cache at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for the path-info cache")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for the path-info cache")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS caches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT UNIQUE NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS narinfos (
                cache INTEGER NOT NULL,
                hash_part TEXT NOT NULL,
                present INTEGER NOT NULL,
                narinfo TEXT,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (cache, hash_part),
                FOREIGN KEY (cache) REFERENCES caches(id) ON DELETE CASCADE
            );
            "#,
        )
        .context("failed to initialize the path-info cache schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Row id for a cache URL, allocating one on first sight.
    pub fn cache_id(&self, url: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("disk cache lock");
        conn.execute(
            "INSERT OR IGNORE INTO caches (url, timestamp) VALUES (?1, ?2)",
            params![url, timestamp_secs() as i64],
        )?;
        let id = conn.query_row(
            "SELECT id FROM caches WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Fresh cached answer, if any. Stale rows are treated as absent and
    /// left for the next upsert to overwrite.
    pub fn lookup(&self, cache_id: i64, hash_part: &str) -> Result<Option<DiskCacheHit>> {
        let conn = self.conn.lock().expect("disk cache lock");
        let row: Option<(bool, Option<String>, i64)> = conn
            .query_row(
                "SELECT present, narinfo, timestamp FROM narinfos
                 WHERE cache = ?1 AND hash_part = ?2",
                params![cache_id, hash_part],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((present, narinfo, stored_at)) = row else {
            return Ok(None);
        };
        let ttl = if present {
            TTL_POSITIVE_SECS
        } else {
            TTL_NEGATIVE_SECS
        };
        if timestamp_secs() >= (stored_at as u64).saturating_add(ttl) {
            return Ok(None);
        }
        if present {
            match narinfo {
                Some(text) => Ok(Some(DiskCacheHit::Present(text))),
                None => Ok(None),
            }
        } else {
            Ok(Some(DiskCacheHit::Absent))
        }
    }

    /// Record an answer, replacing any previous one for the key.
    pub fn upsert(&self, cache_id: i64, hash_part: &str, narinfo: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().expect("disk cache lock");
        conn.execute(
            "INSERT OR REPLACE INTO narinfos (cache, hash_part, present, narinfo, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                cache_id,
                hash_part,
                narinfo.is_some(),
                narinfo,
                timestamp_secs() as i64
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn remembers_positive_and_negative_answers() -> Result<()> {
        let dir = tempdir()?;
        let cache = DiskCache::open(dir.path())?;
        let id = cache.cache_id("https://cache.example.org")?;

        assert_eq!(cache.lookup(id, "aaaa")?, None);
        cache.upsert(id, "aaaa", None)?;
        assert_eq!(cache.lookup(id, "aaaa")?, Some(DiskCacheHit::Absent));
        cache.upsert(id, "aaaa", Some("StorePath: ..."))?;
        assert_eq!(
            cache.lookup(id, "aaaa")?,
            Some(DiskCacheHit::Present("StorePath: ...".into()))
        );
        Ok(())
    }

    #[test]
    fn entries_are_scoped_per_cache_url() -> Result<()> {
        let dir = tempdir()?;
        let cache = DiskCache::open(dir.path())?;
        let one = cache.cache_id("https://one.example.org")?;
        let two = cache.cache_id("https://two.example.org")?;
        assert_ne!(one, two);
        assert_eq!(cache.cache_id("https://one.example.org")?, one);

        cache.upsert(one, "aaaa", Some("text"))?;
        assert_eq!(cache.lookup(two, "aaaa")?, None);
        Ok(())
    }

    #[test]
    fn survives_reopening() -> Result<()> {
        let dir = tempdir()?;
        {
            let cache = DiskCache::open(dir.path())?;
            let id = cache.cache_id("https://cache.example.org")?;
            cache.upsert(id, "bbbb", Some("persisted"))?;
        }
        let cache = DiskCache::open(dir.path())?;
        let id = cache.cache_id("https://cache.example.org")?;
        assert_eq!(
            cache.lookup(id, "bbbb")?,
            Some(DiskCacheHit::Present("persisted".into()))
        );
        Ok(())
    }
}
