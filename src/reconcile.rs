//! External-source reconciler (§4.3).
//!
//! Reconciles rows read from an external source (CSV import, a linked
//! spreadsheet, ...) against `T_<ext>`: each incoming row is hashed over
//! its materialized columns and classified `New`/`Modified`/`Unchanged`
//! against the existing `T_<ext>` row with the same id. A row that can't
//! be matched by id falls back to a join on `external_id_column` — first
//! against `T_<ext>`, then against master `T` — so a CSV keyed on some
//! natural key (an email, a barcode) can still line up with the row it's
//! meant to update. Rows that match neither way get a fresh UUID and are
//! classified `New`. Columns the incoming row doesn't carry at all are
//! backfilled from the matched row before hashing, so a partial row
//! (e.g. a CSV missing a column added after the last import) doesn't read
//! as "modified" just because that column went from some value to `None`.
//! [`LocalSyncMode`] controls which classes are actually written. Grounded
//! on `odkx_local_table.py::OdkxLocalTable.updateRowsFromExternalSource`
//! and its hash-based change detection.

use std::collections::BTreeMap;

use chrono::Utc;
use log::debug;
use rusqlite::types::Value;
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::definition::TableDefinition;
use crate::error::{Result, SyncError};
use crate::hash::hash_row;
use crate::ident::quote_ident;
use crate::types::{LocalSyncMode, RowState};

/// The principal external-source reconciliation stamps onto rows it
/// creates or rewrites — distinct from any configured default user, since
/// these edits didn't come from a person acting through the app (§4.3).
const LOCAL_SYNC_PRINCIPAL: &str = "localSync";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
}

/// One row as read from the external source: materialized column keys
/// mapped to their (possibly absent) string value. An `"id"` entry, if
/// present, pins the row's identity; otherwise it's resolved via
/// `external_id_column`, or else a fresh one is generated.
pub type ExternalRow = BTreeMap<String, Option<String>>;

pub struct ExternalSourceReconciler<'c> {
    conn: &'c Connection,
    master_table: String,
    ext_table: String,
}

impl<'c> ExternalSourceReconciler<'c> {
    pub fn new(conn: &'c Connection, master_table: impl Into<String>, ext_table: impl Into<String>, _config: &SyncConfig) -> Self {
        ExternalSourceReconciler {
            conn,
            master_table: master_table.into(),
            ext_table: ext_table.into(),
        }
    }

    /// Reconcile `rows` into `T_<ext>`. `external_id_column`, when given,
    /// names the data column incoming rows use as their natural key when
    /// they don't carry an `id` the reconciler already knows (§4.3 step 3).
    ///
    /// Fails with `PendingLocalChanges` if `T_<ext>` has any row not in
    /// `unchanged`/`synced` state — those are local edits a reconcile run
    /// would silently clobber.
    pub fn reconcile(
        &self,
        definition: &TableDefinition,
        rows: &[ExternalRow],
        mode: LocalSyncMode,
        external_id_column: Option<&str>,
    ) -> Result<ReconcileReport> {
        self.check_no_pending_local_changes(&definition.table_id)?;
        self.import_missing_master_rows(definition)?;
        self.refresh_existing_hashes(definition)?;

        let data_keys = definition.column_keys();
        let mut report = ReconcileReport::default();
        let now = Utc::now().to_rfc3339();

        for incoming in rows {
            let resolved = self.resolve_identity(incoming, external_id_column)?;
            let id = resolved.id;

            let existing_values = self.existing_row_values(&id, &data_keys)?;
            let backfilled = backfill_missing(incoming, &existing_values, &data_keys);

            let fields: Vec<(&str, Option<&str>)> = data_keys
                .iter()
                .map(|k| (k.as_str(), backfilled.get(k).and_then(|v| v.as_deref())))
                .collect();
            let new_hash = hash_row(fields);

            let existing_hash = self.existing_hash(&id)?;
            let classification = match &existing_hash {
                None => Classification::New,
                Some(h) if *h == new_hash => Classification::Unchanged,
                Some(_) => Classification::Modified,
            };

            match classification {
                Classification::New => report.new += 1,
                Classification::Modified => report.modified += 1,
                Classification::Unchanged => report.unchanged += 1,
            }

            if !should_apply(mode, classification) {
                debug!("reconcile {}: skipping {:?} row {id} under {:?}", self.ext_table, classification, mode);
                continue;
            }
            if classification == Classification::Unchanged {
                continue;
            }

            let create_user = match classification {
                Classification::New => LOCAL_SYNC_PRINCIPAL.to_string(),
                _ => self
                    .existing_create_user(&id)?
                    .unwrap_or_else(|| LOCAL_SYNC_PRINCIPAL.to_string()),
            };

            self.upsert_row(
                &id,
                resolved.row_etag.as_deref(),
                definition,
                &backfilled,
                &new_hash,
                &now,
                &create_user,
                classification,
            )?;
        }

        Ok(report)
    }

    /// §4.3 precondition: reconcile refuses to run while `T_<ext>` has any
    /// row still mid-sync (anything other than `unchanged`/`synced`) —
    /// those represent local edits not yet pushed, which a reconcile pass
    /// would overwrite without ever giving the user a chance to push them.
    fn check_no_pending_local_changes(&self, table_id: &str) -> Result<()> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE state NOT IN (?1, ?2)",
            quote_ident(&self.ext_table)
        );
        let pending: i64 = self.conn.query_row(
            &sql,
            [RowState::Unchanged.as_str(), RowState::Synced.as_str()],
            |r| r.get(0),
        )?;
        if pending > 0 {
            return Err(SyncError::PendingLocalChanges(table_id.to_string()));
        }
        Ok(())
    }

    /// §4.3 step 1: copy every master row whose id isn't already present
    /// in `T_<ext>` across, so master rows never pulled through the
    /// external source yet still have something to reconcile against.
    fn import_missing_master_rows(&self, definition: &TableDefinition) -> Result<()> {
        let mut cols = vec!["id".to_string()];
        cols.extend(crate::provisioner::system_column_names().iter().map(|s| s.to_string()));
        cols.extend(definition.column_keys());
        let col_list = cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

        self.conn.execute(
            &format!(
                "INSERT INTO {ext} ({cols}, state)
                 SELECT {cols}, ?1 FROM {master} m
                 WHERE NOT EXISTS (SELECT 1 FROM {ext} e WHERE e.id = m.id)",
                ext = quote_ident(&self.ext_table),
                master = quote_ident(&self.master_table),
                cols = col_list,
            ),
            [RowState::Unchanged.as_str()],
        )?;
        Ok(())
    }

    /// §4.3 step 2: recompute `T_<ext>.hash` over hashable columns for
    /// every row that doesn't have one yet (rows this call just imported
    /// from master, or provisioned before any reconcile ran).
    fn refresh_existing_hashes(&self, definition: &TableDefinition) -> Result<()> {
        let data_keys = definition.column_keys();
        let col_list = data_keys.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT id, {cols} FROM {ext} WHERE hash IS NULL",
            cols = col_list,
            ext = quote_ident(&self.ext_table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<(String, Vec<Option<String>>)> = stmt
            .query_map([], |r| {
                let id: String = r.get(0)?;
                let mut values = Vec::with_capacity(data_keys.len());
                for i in 0..data_keys.len() {
                    values.push(r.get(1 + i)?);
                }
                Ok((id, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for (id, values) in rows {
            let fields: Vec<(&str, Option<&str>)> = data_keys
                .iter()
                .zip(values.iter())
                .map(|(k, v)| (k.as_str(), v.as_deref()))
                .collect();
            let hash = hash_row(fields);
            self.conn.execute(
                &format!("UPDATE {} SET hash = ?1 WHERE id = ?2", quote_ident(&self.ext_table)),
                rusqlite::params![hash, id],
            )?;
        }
        Ok(())
    }

    /// Resolves the incoming row's identity: an explicit `id` wins; failing
    /// that, `external_id_column` is looked up first in `T_<ext>`, then in
    /// master `T` (§4.3 step 3); failing that, a fresh UUID is generated.
    /// When a join hits, the matched row's `rowETag` comes along so the
    /// upsert doesn't clobber it with `NULL`.
    fn resolve_identity(&self, incoming: &ExternalRow, external_id_column: Option<&str>) -> Result<ResolvedIdentity> {
        if let Some(id) = incoming.get("id").and_then(|v| v.clone()) {
            return Ok(ResolvedIdentity { id, row_etag: None });
        }

        if let Some(col) = external_id_column {
            if let Some(key_value) = incoming.get(col).and_then(|v| v.clone()) {
                if let Some(found) = self.find_by_external_id(&self.ext_table, col, &key_value)? {
                    return Ok(found);
                }
                if let Some(found) = self.find_by_external_id(&self.master_table, col, &key_value)? {
                    return Ok(found);
                }
            }
        }

        Ok(ResolvedIdentity { id: Uuid::new_v4().to_string(), row_etag: None })
    }

    fn find_by_external_id(&self, table: &str, column: &str, value: &str) -> Result<Option<ResolvedIdentity>> {
        let sql = format!(
            "SELECT id, {re} FROM {t} WHERE {col} = ?1 LIMIT 1",
            re = quote_ident("rowETag"),
            t = quote_ident(table),
            col = quote_ident(column),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let found: Option<(String, Option<String>)> = stmt
            .query_row([value], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(found.map(|(id, row_etag)| ResolvedIdentity { id, row_etag }))
    }

    fn existing_row_values(&self, id: &str, data_keys: &[String]) -> Result<ExternalRow> {
        let col_list = data_keys.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT {cols} FROM {t} WHERE id = ?1",
            cols = col_list,
            t = quote_ident(&self.ext_table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let values: Option<Vec<Option<String>>> = stmt
            .query_row([id], |r| {
                let mut values = Vec::with_capacity(data_keys.len());
                for i in 0..data_keys.len() {
                    values.push(r.get(i)?);
                }
                Ok(values)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;

        let mut out = ExternalRow::new();
        if let Some(values) = values {
            for (key, value) in data_keys.iter().zip(values.into_iter()) {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    fn existing_hash(&self, id: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT hash FROM {} WHERE id = ?1",
            quote_ident(&self.ext_table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let hash: Option<String> = stmt
            .query_row([id], |r| r.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(hash)
    }

    fn existing_create_user(&self, id: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT createUser FROM {} WHERE id = ?1",
            quote_ident(&self.ext_table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let user: Option<Option<String>> = stmt
            .query_row([id], |r| r.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(user.flatten())
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_row(
        &self,
        id: &str,
        row_etag: Option<&str>,
        definition: &TableDefinition,
        incoming: &ExternalRow,
        hash: &str,
        now: &str,
        create_user: &str,
        classification: Classification,
    ) -> Result<()> {
        let state = match classification {
            Classification::New => RowState::New,
            Classification::Modified => RowState::Modified,
            Classification::Unchanged => RowState::Unchanged,
        };

        let mut cols = vec![
            "id".to_string(),
            "hash".to_string(),
            "state".to_string(),
            "savepointTimestamp".to_string(),
            "savepointType".to_string(),
            "savepointCreator".to_string(),
            "formId".to_string(),
            "createUser".to_string(),
            "lastUpdateUser".to_string(),
            "defaultAccess".to_string(),
        ];
        let mut values = vec![
            Value::Text(id.to_string()),
            Value::Text(hash.to_string()),
            Value::Text(state.as_str().to_string()),
            Value::Text(now.to_string()),
            Value::Text("COMPLETE".to_string()),
            Value::Text(LOCAL_SYNC_PRINCIPAL.to_string()),
            Value::Null,
            Value::Text(create_user.to_string()),
            Value::Text(LOCAL_SYNC_PRINCIPAL.to_string()),
            Value::Text("FULL".to_string()),
        ];
        if let Some(etag) = row_etag {
            cols.push("rowETag".to_string());
            values.push(Value::Text(etag.to_string()));
        }
        for key in definition.column_keys() {
            cols.push(key.clone());
            let value = incoming.get(&key).and_then(|v| v.clone());
            values.push(value.map(Value::Text).unwrap_or(Value::Null));
        }

        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", quote_ident(&self.ext_table)),
            [id],
        )?;
        let col_list = cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; cols.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.ext_table),
            col_list,
            placeholders
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(())
    }
}

struct ResolvedIdentity {
    id: String,
    row_etag: Option<String>,
}

/// Fills in any data key `incoming` doesn't carry at all from `existing`,
/// so hashing never sees "missing from the CSV" and "set to empty on
/// purpose" as the same thing becoming a spurious change. A key the
/// incoming row *does* carry, even as an explicit `None`, is left alone.
fn backfill_missing(incoming: &ExternalRow, existing: &ExternalRow, data_keys: &[String]) -> ExternalRow {
    let mut out = incoming.clone();
    for key in data_keys {
        if !incoming.contains_key(key) {
            if let Some(value) = existing.get(key) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    New,
    Modified,
    Unchanged,
}

fn should_apply(mode: LocalSyncMode, classification: Classification) -> bool {
    match (mode, classification) {
        (LocalSyncMode::Full, _) => true,
        (LocalSyncMode::OnlyNewRecords, Classification::New) => true,
        (LocalSyncMode::OnlyNewRecords, _) => false,
        (LocalSyncMode::OnlyExistingRecords, Classification::Modified) => true,
        (LocalSyncMode::OnlyExistingRecords, _) => false,
    }
}
