//! Sync status bookkeeping (§3, §4.2, §4.4).
//!
//! `{schema}_status_table` is append-only: every successful pull appends a
//! new `(table_name, dataETag, sync_date)` row rather than overwriting the
//! last one, so the full sync history for a table is recoverable by
//! scanning it. "Latest" and "initial" are both derived by querying that
//! history (`MAX`/`MIN` over `sync_date`), not stored as separate columns.
//! Grounded on `local_storage_sql.py`'s status-table read/write helpers
//! used to decide whether a pull is a no-op (`hasIncomingChanges`,
//! SUPPLEMENTED).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::ident::{quote_ident, validate_ident_component};

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub table_id: String,
    pub data_etag: Option<String>,
    pub sync_date: DateTime<Utc>,
}

pub struct StatusTable<'c> {
    conn: &'c Connection,
    table: String,
}

impl<'c> StatusTable<'c> {
    pub fn new(conn: &'c Connection, schema: &str) -> Result<Self> {
        validate_ident_component(schema)?;
        let table = format!("{schema}_status_table");
        let status = StatusTable { conn, table };
        status.ensure_table()?;
        Ok(status)
    }

    fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (table_name TEXT NOT NULL, dataETag TEXT, sync_date TEXT NOT NULL)",
            quote_ident(&self.table)
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    /// The most recent status row recorded for `table_id`.
    pub fn get(&self, table_id: &str) -> Result<Option<SyncStatus>> {
        let sql = format!(
            "SELECT dataETag, sync_date FROM {} WHERE table_name = ?1 ORDER BY sync_date DESC, rowid DESC LIMIT 1",
            quote_ident(&self.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let row: Option<(Option<String>, String)> = stmt
            .query_row(params![table_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(row.map(|(data_etag, sync_date)| SyncStatus {
            table_id: table_id.to_string(),
            data_etag,
            sync_date: sync_date.parse().unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Append a new status row recording `data_etag` as of `sync_date`.
    /// Never overwrites a prior row — the table is append-only, so the
    /// full pull/push history for `table_id` stays queryable.
    pub fn set(&self, table_id: &str, data_etag: Option<&str>, sync_date: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {t} (table_name, dataETag, sync_date) VALUES (?1, ?2, ?3)",
            t = quote_ident(&self.table)
        );
        self.conn
            .execute(&sql, params![table_id, data_etag, sync_date.to_rfc3339()])?;
        Ok(())
    }

    /// The `dataETag` this table had the first time it was ever synced
    /// (SUPPLEMENTED: `getInitialDataETag`), derived from the oldest row
    /// rather than a separately stored column.
    pub fn initial_data_etag(&self, table_id: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT dataETag FROM {} WHERE table_name = ?1 ORDER BY sync_date ASC, rowid ASC LIMIT 1",
            quote_ident(&self.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let data_etag: Option<Option<String>> = stmt
            .query_row(params![table_id], |r| r.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(data_etag.flatten())
    }

    /// Whether the server's current `data_etag` differs from what this
    /// client last recorded, i.e. whether a pull is worth running at all.
    pub fn has_incoming_changes(&self, table_id: &str, server_data_etag: &str) -> Result<bool> {
        match self.get(table_id)? {
            Some(status) => Ok(status.data_etag.as_deref() != Some(server_data_etag)),
            None => Ok(true),
        }
    }
}
