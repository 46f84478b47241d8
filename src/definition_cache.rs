//! Table definition cache (§4.6).
//!
//! Server table definitions are expensive to refetch and rarely change:
//! each is cached keyed by `tableId`, tagged with the `schemaETag` it was
//! fetched under. A schema-etag mismatch invalidates the entry. Grounded on
//! `odkx_local_table.py`'s `_getCachedTableDefinition` / definition-caching
//! helpers, which store the serialized definition alongside its schema etag
//! in a dedicated local table.

use rusqlite::{params, Connection};

use crate::definition::TableDefinition;
use crate::error::{Result, SyncError};
use crate::ident::{quote_ident, validate_ident_component};

pub struct DefinitionCache<'c> {
    conn: &'c Connection,
    table: String,
}

impl<'c> DefinitionCache<'c> {
    pub fn new(conn: &'c Connection, schema: &str) -> Result<Self> {
        validate_ident_component(schema)?;
        let table = format!("{schema}_odkxpy_cached_defintions");
        let cache = DefinitionCache { conn, table };
        cache.ensure_table()?;
        Ok(cache)
    }

    fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (tableId TEXT NOT NULL, schemaETag TEXT NOT NULL, odkxpydef TEXT NOT NULL, PRIMARY KEY (tableId))",
            quote_ident(&self.table)
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    /// Look up the cached definition for `table_id`, returning it only if
    /// its cached `schemaETag` matches `expected_schema_etag`. A mismatch or
    /// a miss both return `Ok(None)` so callers fall back to a live fetch.
    pub fn get(&self, table_id: &str, expected_schema_etag: &str) -> Result<Option<TableDefinition>> {
        let sql = format!(
            "SELECT schemaETag, odkxpydef FROM {} WHERE tableId = ?1",
            quote_ident(&self.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let row: Option<(String, String)> = stmt
            .query_row(params![table_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        match row {
            Some((etag, json)) if etag == expected_schema_etag => {
                Ok(Some(serde_json::from_str(&json)?))
            }
            _ => Ok(None),
        }
    }

    /// Require a cache hit, for call sites that have already established a
    /// matching schema etag is expected to be present (e.g. right after a
    /// successful `put`).
    pub fn require(&self, table_id: &str, expected_schema_etag: &str) -> Result<TableDefinition> {
        self.get(table_id, expected_schema_etag)?
            .ok_or_else(|| SyncError::CacheNotFound(table_id.to_string()))
    }

    pub fn put(&self, definition: &TableDefinition) -> Result<()> {
        let json = serde_json::to_string(definition)?;
        let sql = format!(
            "INSERT INTO {t} (tableId, schemaETag, odkxpydef) VALUES (?1, ?2, ?3)
             ON CONFLICT(tableId) DO UPDATE SET schemaETag = excluded.schemaETag, odkxpydef = excluded.odkxpydef",
            t = quote_ident(&self.table)
        );
        self.conn
            .execute(&sql, params![definition.table_id, definition.schema_etag, json])?;
        Ok(())
    }

    pub fn invalidate(&self, table_id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE tableId = ?1", quote_ident(&self.table));
        self.conn.execute(&sql, params![table_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ColumnArena, ColumnDef, ElementType};
    use std::collections::BTreeMap;

    fn def(schema_etag: &str) -> TableDefinition {
        let mut arena = ColumnArena::new();
        arena.insert(ColumnDef {
            element_key: "name".into(),
            element_name: "name".into(),
            element_type: ElementType::String,
            parent: None,
            children: vec![],
            properties: BTreeMap::new(),
        });
        TableDefinition {
            table_id: "trips".into(),
            schema_etag: schema_etag.into(),
            columns: arena,
            ordered_keys: vec!["name".into()],
        }
    }

    #[test]
    fn round_trips_and_invalidates_on_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = DefinitionCache::new(&conn, "main").unwrap();
        assert!(cache.get("trips", "e1").unwrap().is_none());

        cache.put(&def("e1")).unwrap();
        let got = cache.get("trips", "e1").unwrap().unwrap();
        assert_eq!(got.table_id, "trips");

        assert!(cache.get("trips", "e2").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_previous_entry() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = DefinitionCache::new(&conn, "main").unwrap();
        cache.put(&def("e1")).unwrap();
        cache.put(&def("e2")).unwrap();
        assert!(cache.get("trips", "e1").unwrap().is_none());
        assert!(cache.get("trips", "e2").unwrap().is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = DefinitionCache::new(&conn, "main").unwrap();
        cache.put(&def("e1")).unwrap();
        cache.invalidate("trips").unwrap();
        assert!(cache.get("trips", "e1").unwrap().is_none());
    }
}
