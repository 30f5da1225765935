//! Named response caches backed by the `cache_entries` table.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::api::FetchedResponse;
use crate::store::{DbState, StoreResult};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub stored_at: Option<DateTime<Utc>>,
}

/// Cache storage shared by the agent and its background refresh tasks.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    db: Arc<DbState>,
}

impl CacheStorage {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn lookup(&self, cache_name: &str, request_key: &str) -> StoreResult<Option<CachedResponse>> {
        let conn = self.db.lock()?;
        let row = conn
            .query_row(
                "SELECT status, content_type, body, stored_at FROM cache_entries
                 WHERE cache_name = ?1 AND request_key = ?2",
                params![cache_name, request_key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(status, content_type, body, stored_at)| CachedResponse {
            status: u16::try_from(status).unwrap_or(200),
            content_type,
            body,
            stored_at: DateTime::parse_from_rfc3339(&stored_at)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }))
    }

    /// Insert or replace the entry for `request_key`.
    pub fn store(&self, cache_name: &str, request_key: &str, response: &FetchedResponse) -> StoreResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO cache_entries (cache_name, request_key, status, content_type, body, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(cache_name, request_key) DO UPDATE SET
                status = excluded.status,
                content_type = excluded.content_type,
                body = excluded.body,
                stored_at = excluded.stored_at",
            params![
                cache_name,
                request_key,
                i64::from(response.status),
                response.content_type,
                response.body,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(())
    }

    pub fn cache_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.db.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn entry_count(&self, cache_name: &str) -> StoreResult<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?1",
            params![cache_name],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Drop every cache whose name is not in `keep`. Returns the purged names.
    pub fn purge_except(&self, keep: &[String]) -> StoreResult<Vec<String>> {
        let stale: Vec<String> = self
            .cache_names()?
            .into_iter()
            .filter(|name| !keep.contains(name))
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        for name in &stale {
            tx.execute(
                "DELETE FROM cache_entries WHERE cache_name = ?1",
                params![name],
            )?;
        }
        tx.commit()?;
        Ok(stale)
    }
}
