//! Local durable store: JSON records in named tables.
//!
//! Every table lives in the `records` SQLite table keyed by
//! `(table_name, record_key)`. Single operations go straight through the
//! connection; multi-table writes go through [`DbState::transaction`], which
//! commits everything or nothing.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::db::{DbState, StoreError, StoreResult};

/// Table holding every order, keyed by `localId`.
pub const ORDERS_TABLE: &str = "orders";
/// Table holding pending sync work, keyed by `{entity_type}:{entity_id}`.
pub const SYNC_QUEUE_TABLE: &str = "sync_queue";
/// Table holding deferred-sync registrations, keyed by tag.
pub const DEFERRED_SYNC_TABLE: &str = "deferred_sync";

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode<T: DeserializeOwned>(table: &str, key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|source| StoreError::Serialization {
        table: table.to_string(),
        key: key.to_string(),
        source,
    })
}

fn put_record<T: Serialize>(conn: &Connection, table: &str, key: &str, value: &T) -> StoreResult<()> {
    let json = serde_json::to_string(value).map_err(|source| StoreError::Serialization {
        table: table.to_string(),
        key: key.to_string(),
        source,
    })?;
    let now = now_stamp();
    conn.execute(
        "INSERT INTO records (table_name, record_key, value, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(table_name, record_key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![table, key, json, now],
    )?;
    Ok(())
}

fn get_record<T: DeserializeOwned>(conn: &Connection, table: &str, key: &str) -> StoreResult<Option<T>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM records WHERE table_name = ?1 AND record_key = ?2",
            params![table, key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|raw| decode(table, key, &raw)).transpose()
}

fn query_records<T, F>(conn: &Connection, table: &str, mut filter: F) -> StoreResult<Vec<T>>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> bool,
{
    let mut stmt = conn.prepare(
        "SELECT record_key, value FROM records WHERE table_name = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for (key, raw) in rows {
        let value: T = decode(table, &key, &raw)?;
        if filter(&value) {
            out.push(value);
        }
    }
    Ok(out)
}

fn delete_record(conn: &Connection, table: &str, key: &str) -> StoreResult<bool> {
    let removed = conn.execute(
        "DELETE FROM records WHERE table_name = ?1 AND record_key = ?2",
        params![table, key],
    )?;
    Ok(removed > 0)
}

fn count_records(conn: &Connection, table: &str) -> StoreResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE table_name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as usize)
}

impl DbState {
    /// Insert or replace a record.
    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> StoreResult<()> {
        let conn = self.lock()?;
        put_record(&conn, table, key, value)
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> StoreResult<Option<T>> {
        let conn = self.lock()?;
        get_record(&conn, table, key)
    }

    /// All records of `table` accepted by `filter`, in insertion order.
    pub fn query<T, F>(&self, table: &str, filter: F) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let conn = self.lock()?;
        query_records(&conn, table, filter)
    }

    /// Returns `true` when a record was removed.
    pub fn delete(&self, table: &str, key: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        delete_record(&conn, table, key)
    }

    pub fn count(&self, table: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        count_records(&conn, table)
    }

    /// Run `f` inside an immediate SQLite transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error rolls
    /// back every write made through the [`StoreTx`].
    pub fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<R, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let store_tx = StoreTx { tx };
        let out = f(&store_tx)?;
        store_tx.tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

/// Handle passed to [`DbState::transaction`] closures.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> StoreResult<()> {
        put_record(&self.tx, table, key, value)
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> StoreResult<Option<T>> {
        get_record(&self.tx, table, key)
    }

    pub fn query<T, F>(&self, table: &str, filter: F) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        query_records(&self.tx, table, filter)
    }

    pub fn delete(&self, table: &str, key: &str) -> StoreResult<bool> {
        delete_record(&self.tx, table, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        id: String,
        qty: i64,
    }

    fn snap(id: &str, qty: i64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            qty,
        }
    }

    #[test]
    fn put_get_delete_round_trip() {
        let db = DbState::open_in_memory().unwrap();
        db.put("clientes", "c1", &snap("c1", 1)).unwrap();

        let loaded: Option<Snapshot> = db.get("clientes", "c1").unwrap();
        assert_eq!(loaded, Some(snap("c1", 1)));

        assert!(db.delete("clientes", "c1").unwrap());
        assert!(!db.delete("clientes", "c1").unwrap());
        let gone: Option<Snapshot> = db.get("clientes", "c1").unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn tables_are_isolated_by_name() {
        let db = DbState::open_in_memory().unwrap();
        db.put("productos", "k", &snap("p", 1)).unwrap();
        db.put("clientes", "k", &snap("c", 2)).unwrap();

        let p: Snapshot = db.get("productos", "k").unwrap().unwrap();
        let c: Snapshot = db.get("clientes", "k").unwrap().unwrap();
        assert_eq!(p.id, "p");
        assert_eq!(c.id, "c");
        assert_eq!(db.count("productos").unwrap(), 1);
    }

    #[test]
    fn query_filters_in_insertion_order() {
        let db = DbState::open_in_memory().unwrap();
        for (id, qty) in [("b", 5), ("a", 1), ("c", 9)] {
            db.put("productos", id, &snap(id, qty)).unwrap();
        }
        let big: Vec<Snapshot> = db.query("productos", |s: &Snapshot| s.qty > 2).unwrap();
        let ids: Vec<&str> = big.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"b") && ids.contains(&"c"));
    }

    #[test]
    fn failed_transaction_rolls_back_every_table() {
        let db = DbState::open_in_memory().unwrap();
        db.put(ORDERS_TABLE, "o1", &snap("o1", 1)).unwrap();

        let result: Result<(), StoreError> = db.transaction(|tx| {
            tx.put(ORDERS_TABLE, "o1", &snap("o1", 99))?;
            tx.put(SYNC_QUEUE_TABLE, "order:o1", &snap("q", 0))?;
            Err(StoreError::Poisoned)
        });
        assert!(result.is_err());

        let order: Snapshot = db.get(ORDERS_TABLE, "o1").unwrap().unwrap();
        assert_eq!(order.qty, 1);
        assert_eq!(db.count(SYNC_QUEUE_TABLE).unwrap(), 0);
    }

    #[test]
    fn committed_transaction_applies_all_writes() {
        let db = DbState::open_in_memory().unwrap();
        db.transaction(|tx| -> StoreResult<()> {
            tx.put(ORDERS_TABLE, "o1", &snap("o1", 1))?;
            tx.put(SYNC_QUEUE_TABLE, "order:o1", &snap("q", 0))?;
            let seen: Option<Snapshot> = tx.get(ORDERS_TABLE, "o1")?;
            assert!(seen.is_some());
            Ok(())
        })
        .unwrap();

        assert_eq!(db.count(ORDERS_TABLE).unwrap(), 1);
        assert_eq!(db.count(SYNC_QUEUE_TABLE).unwrap(), 1);
    }

    #[test]
    fn corrupt_record_is_reported_not_skipped() {
        let db = DbState::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO records (table_name, record_key, value) VALUES ('orders', 'bad', '{not json')",
                [],
            )
            .unwrap();
        }
        let result: StoreResult<Vec<Snapshot>> = db.query(ORDERS_TABLE, |_| true);
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }

    #[test]
    fn committed_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = crate::db::init(dir.path()).unwrap();
            db.put(ORDERS_TABLE, "o1", &snap("o1", 7)).unwrap();
        }
        let db = crate::db::init(dir.path()).unwrap();
        let order: Snapshot = db.get(ORDERS_TABLE, "o1").unwrap().unwrap();
        assert_eq!(order.qty, 7);
    }
}
