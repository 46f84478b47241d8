//! Push engine (§4.4, §4.5).
//!
//! Two modes:
//! - **Normal push**: operates on the external-source table `L` (`T_<ext>`),
//!   not master `T` directly — `L` is where local edits and external-source
//!   imports actually land (§4.3, §4.4). Rows with `state` `new`/`modified`
//!   in `L` are sent through the alter-rows RPC, left-joined against master
//!   `T` so system columns the caller never set fall back to the row's last
//!   known server value rather than `NULL`. The `rowETag` sent for each row
//!   comes from `L` itself, unless `force_push` is set, in which case it
//!   comes from `T`'s current etag — letting a caller intentionally
//!   overwrite a remote edit it hasn't even seen yet.
//! - **History replay**: used when migrating a table's full edit history
//!   to a new tableId (§4.9). Batches are sent oldest-`savepointTimestamp`
//!   first, one revision per `id` per batch; a gating column
//!   (`state_upload`) on the row's `_rev` companion table tracks how far
//!   replay has gotten; any `IN_CONFLICT` here is fatal, since replaying
//!   history out of order would corrupt the target table's revision chain.
//!
//! Grounded on `odkx_server_table.py::OdkxServerTableClient.alterRows` and
//! the force-push / history-replay notes in `odkx_local_table.py`.

use log::{info, warn};
use rusqlite::Connection;

use crate::config::SyncConfig;
use crate::definition::TableDefinition;
use crate::error::{Result, SyncError};
use crate::ident::quote_ident;
use crate::provisioner::TableNames;
use crate::remote::RemoteTable;
use crate::status::StatusTable;
use crate::types::{
    AlterRowsRequest, FilterScope, OrderedColumn, RowOutcome, RowState, ServerRow,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub synced: usize,
    pub conflicts: usize,
}

pub struct PushEngine<'c, R> {
    conn: &'c Connection,
    remote: &'c R,
    schema: String,
}

/// System columns `L` supplies unconditionally, in declaration order, and
/// the matching accessor into a query row starting right after `l.id`.
const L_OWNED_COLUMNS: &[&str] = &[
    "dataETagAtModification",
    "savepointTimestamp",
    "savepointCreator",
    "savepointType",
    "lastUpdateUser",
    "formId",
];

/// System columns that fall back to master `T` when `L` doesn't carry a
/// value of its own (§4.4 step 2).
const COALESCED_COLUMNS: &[&str] = &[
    "createUser",
    "locale",
    "defaultAccess",
    "rowOwner",
    "groupReadOnly",
    "groupModify",
    "groupPrivileged",
    "deleted",
];

impl<'c, R: RemoteTable> PushEngine<'c, R> {
    pub fn new(conn: &'c Connection, remote: &'c R, config: &SyncConfig) -> Self {
        PushEngine {
            conn,
            remote,
            schema: config.schema.clone(),
        }
    }

    /// Push `L`'s (`ext_table`'s) locally `new`/`modified` rows against
    /// master `T`. Refuses to run while `L` has unresolved `conflict` rows
    /// — those must be resolved first. Successful and conflicting outcomes
    /// are recorded back onto `L`, never onto `T`.
    pub fn push(
        &self,
        definition: &TableDefinition,
        names: &TableNames,
        ext_table: &str,
        force_push: bool,
    ) -> Result<PushReport> {
        let table_id = &definition.table_id;
        let conflict_count = self.count_with_state(ext_table, RowState::Conflict)?;
        if conflict_count > 0 {
            return Err(SyncError::UnresolvedConflicts(table_id.clone()));
        }

        let status = StatusTable::new(self.conn, &self.schema)?;
        let data_etag = status
            .get(table_id)?
            .and_then(|s| s.data_etag)
            .ok_or_else(|| SyncError::State("cannot push before an initial pull"))?;

        let rows = self.load_pending_rows(names, ext_table, definition, force_push)?;
        if rows.is_empty() {
            return Ok(PushReport::default());
        }

        let request = AlterRowsRequest { rows, data_etag };
        let response = self.remote.alter_rows(table_id, request)?;

        let mut report = PushReport::default();
        for result in response.rows {
            match result.outcome {
                RowOutcome::Success => {
                    self.mark_synced(ext_table, &result.id, result.row_etag.as_deref())?;
                    report.synced += 1;
                }
                RowOutcome::InConflict => {
                    self.mark_conflict(ext_table, &result.id)?;
                    report.conflicts += 1;
                }
                RowOutcome::Other => {
                    warn!("push {table_id}: unrecognized outcome for row {}", result.id);
                }
            }
        }
        info!("push {table_id}: {} synced, {} conflicts", report.synced, report.conflicts);
        Ok(report)
    }

    /// Replay a table's full log history into a newly migrated table,
    /// oldest `savepointTimestamp` first. `rev_table` is the companion
    /// table that gates how much history has already been uploaded via
    /// its `state_upload` column (§4.9). `source_names` is the archived
    /// table's relations — the log being replayed — which may differ from
    /// `names`, the destination table's own (empty, freshly provisioned)
    /// relations.
    pub fn push_history(
        &self,
        target_table_id: &str,
        source_names: &TableNames,
        rev_table: &str,
        batch_size: usize,
    ) -> Result<PushReport> {
        let status = StatusTable::new(self.conn, &self.schema)?;
        let mut data_etag = status
            .get(target_table_id)?
            .and_then(|s| s.data_etag)
            .unwrap_or_default();

        let mut report = PushReport::default();
        loop {
            let batch = self.next_history_batch(source_names, rev_table, batch_size)?;
            if batch.is_empty() {
                break;
            }
            let request = AlterRowsRequest {
                rows: batch.clone(),
                data_etag: data_etag.clone(),
            };
            let response = self.remote.alter_rows(target_table_id, request)?;

            for result in &response.rows {
                if result.outcome == RowOutcome::InConflict {
                    return Err(SyncError::ConcurrentHistoryModification(result.id.clone()));
                }
                if let Some(etag) = &result.row_etag {
                    data_etag = etag.clone();
                }
                self.mark_history_uploaded(rev_table, &result.id)?;
                report.synced += 1;
            }
        }
        Ok(report)
    }

    fn count_with_state(&self, table: &str, state: RowState) -> Result<i64> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE state = ?1",
            quote_ident(table)
        );
        self.conn
            .query_row(&sql, [state.as_str()], |r| r.get(0))
            .map_err(SyncError::from)
    }

    /// Builds the `L LEFT JOIN T` projection described in §4.4 step 2: data
    /// columns and the `L`-owned system columns come from `L` unconditionally,
    /// the rest fall back to `T` via `COALESCE`, and `rowETag` is chosen by
    /// `force_push`.
    fn load_pending_rows(
        &self,
        names: &TableNames,
        ext_table: &str,
        definition: &TableDefinition,
        force_push: bool,
    ) -> Result<Vec<ServerRow>> {
        let data_keys = definition.column_keys();
        let row_etag_expr = if force_push {
            format!("t.{}", quote_ident("rowETag"))
        } else {
            format!("l.{}", quote_ident("rowETag"))
        };

        let mut select_list = vec![
            format!("l.{}", quote_ident("id")),
            format!("{row_etag_expr} AS rowETag"),
        ];
        for col in L_OWNED_COLUMNS {
            select_list.push(format!("l.{} AS {}", quote_ident(col), quote_ident(col)));
        }
        for col in COALESCED_COLUMNS {
            select_list.push(format!(
                "COALESCE(l.{c}, t.{c}) AS {c}",
                c = quote_ident(col)
            ));
        }
        for key in &data_keys {
            select_list.push(format!("l.{k} AS {k}", k = quote_ident(key)));
        }

        let sql = format!(
            "SELECT {cols} FROM {l} l LEFT JOIN {t} t ON t.id = l.id WHERE l.state IN (?1, ?2)",
            cols = select_list.join(", "),
            l = quote_ident(ext_table),
            t = quote_ident(&names.master),
        );

        let n_owned = L_OWNED_COLUMNS.len();
        let n_coalesced = COALESCED_COLUMNS.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([RowState::New.as_str(), RowState::Modified.as_str()], |r| {
                let id: String = r.get(0)?;
                let row_etag: Option<String> = r.get(1)?;
                let data_etag_at_modification: Option<String> = r.get(2)?;
                let savepoint_timestamp: Option<String> = r.get(3)?;
                let savepoint_creator: Option<String> = r.get(4)?;
                let savepoint_type: Option<String> = r.get(5)?;
                let last_update_user: Option<String> = r.get(6)?;
                let form_id: Option<String> = r.get(7)?;

                let base = 2 + n_owned;
                let create_user: Option<String> = r.get(base)?;
                let locale: Option<String> = r.get(base + 1)?;
                let default_access: Option<String> = r.get(base + 2)?;
                let row_owner: Option<String> = r.get(base + 3)?;
                let group_read_only: Option<String> = r.get(base + 4)?;
                let group_modify: Option<String> = r.get(base + 5)?;
                let group_privileged: Option<String> = r.get(base + 6)?;
                let deleted: Option<i64> = r.get(base + 7)?;

                let data_base = base + n_coalesced;
                let mut ordered_columns = Vec::with_capacity(data_keys.len());
                for (i, key) in data_keys.iter().enumerate() {
                    let value: Option<String> = r.get(data_base + i)?;
                    ordered_columns.push(OrderedColumn { column: key.clone(), value });
                }

                Ok(ServerRow {
                    id,
                    row_etag,
                    data_etag_at_modification,
                    deleted: deleted.unwrap_or(0) != 0,
                    create_user,
                    last_update_user,
                    form_id,
                    locale,
                    savepoint_type,
                    savepoint_timestamp,
                    savepoint_creator,
                    filter_scope: FilterScope {
                        default_access: default_access.unwrap_or_else(|| "FULL".to_string()),
                        row_owner,
                        group_read_only,
                        group_modify,
                        group_privileged,
                    },
                    ordered_columns,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// A pushed row moves to `sync_attachments`, not `synced` (§4.4 step 5)
    /// — the row's data reached the server, but its attachments (if any)
    /// haven't been uploaded yet; that's the attachment sub-sync's job.
    fn mark_synced(&self, ext_table: &str, id: &str, row_etag: Option<&str>) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET state = ?1, {re} = ?2 WHERE id = ?3",
            quote_ident(ext_table),
            re = quote_ident("rowETag")
        );
        self.conn
            .execute(&sql, rusqlite::params![RowState::SyncAttachments.as_str(), row_etag, id])?;
        Ok(())
    }

    fn mark_conflict(&self, ext_table: &str, id: &str) -> Result<()> {
        let sql = format!("UPDATE {} SET state = ?1 WHERE id = ?2", quote_ident(ext_table));
        self.conn.execute(&sql, rusqlite::params![RowState::Conflict.as_str(), id])?;
        Ok(())
    }

    /// One not-yet-uploaded revision per `id`, earliest `savepointTimestamp`
    /// first, capped at `batch_size` rows total. Restricting to one
    /// revision per id keeps replay from sending two edits of the same row
    /// in a single alter-rows call, which the server would see as the
    /// second one conflicting against the first's own rowETag.
    fn next_history_batch(&self, names: &TableNames, rev_table: &str, batch_size: usize) -> Result<Vec<ServerRow>> {
        let sql = format!(
            "WITH candidates AS (
                SELECT l.id AS id, l.savepointTimestamp AS ts,
                       ROW_NUMBER() OVER (PARTITION BY l.id ORDER BY l.savepointTimestamp ASC) AS rn
                FROM {log} l
                JOIN {rev} r ON r.id = l.id AND r.rowETag = l.rowETag
                WHERE r.state_upload = 0
             )
             SELECT id FROM candidates WHERE rn = 1 ORDER BY ts ASC LIMIT ?1",
            log = quote_ident(&names.log),
            rev = quote_ident(rev_table),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids: Vec<String> = stmt
            .query_map(rusqlite::params![batch_size as i64], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.load_log_row(names, &id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn load_log_row(&self, names: &TableNames, id: &str) -> Result<Option<ServerRow>> {
        let sql = format!(
            "SELECT {re}, dataETagAtModification, savepointTimestamp, savepointCreator, savepointType,
                    createUser, lastUpdateUser, formId, locale, defaultAccess, rowOwner,
                    groupReadOnly, groupModify, groupPrivileged, deleted
             FROM {log} WHERE id = ?1 ORDER BY savepointTimestamp ASC LIMIT 1",
            re = quote_ident("rowETag"),
            log = quote_ident(&names.log),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let found = stmt
            .query_row([id], |r| {
                Ok(ServerRow {
                    id: id.to_string(),
                    row_etag: r.get(0)?,
                    data_etag_at_modification: r.get(1)?,
                    savepoint_timestamp: r.get(2)?,
                    savepoint_creator: r.get(3)?,
                    savepoint_type: r.get(4)?,
                    create_user: r.get(5)?,
                    last_update_user: r.get(6)?,
                    form_id: r.get(7)?,
                    locale: r.get(8)?,
                    filter_scope: FilterScope {
                        default_access: r.get::<_, Option<String>>(9)?.unwrap_or_else(|| "FULL".to_string()),
                        row_owner: r.get(10)?,
                        group_read_only: r.get(11)?,
                        group_modify: r.get(12)?,
                        group_privileged: r.get(13)?,
                    },
                    deleted: r.get::<_, Option<i64>>(14)?.unwrap_or(0) != 0,
                    ordered_columns: vec![],
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(found)
    }

    fn mark_history_uploaded(&self, rev_table: &str, id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET state_upload = 1 WHERE id = ?1",
            quote_ident(rev_table)
        );
        self.conn.execute(&sql, [id])?;
        Ok(())
    }
}

/// Ensures the `_rev` companion table used to gate history replay exists,
/// with one row per `(id, rowETag)` pair in `source_names.log` — the
/// archived table's own log, not the destination's. Replay is driven
/// entirely by what the source recorded; the destination's log starts
/// empty and has nothing to seed from.
pub fn provision_rev_table(conn: &Connection, source_names: &TableNames, rev_table: &str) -> Result<()> {
    crate::ident::validate_ident_component(rev_table)?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT NOT NULL, rowETag TEXT NOT NULL, state_upload INTEGER NOT NULL DEFAULT 0, PRIMARY KEY (id, rowETag))",
            quote_ident(rev_table)
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {rev} (id, rowETag, state_upload)
             SELECT id, {re}, 0 FROM {log}",
            rev = quote_ident(rev_table),
            re = quote_ident("rowETag"),
            log = quote_ident(&source_names.log),
        ),
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ColumnArena, ColumnDef, ElementType};
    use crate::provisioner::TableProvisioner;
    use crate::remote::mock::MockRemote;
    use crate::types::{AlterRowsResponse, RowResult};
    use std::collections::BTreeMap;

    fn test_config() -> SyncConfig {
        SyncConfig::new("main", "alice", "/tmp/odkx-attachments")
    }

    fn def() -> TableDefinition {
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
            schema_etag: "e1".into(),
            columns: arena,
            ordered_keys: vec!["name".into()],
        }
    }

    fn insert_new_row(conn: &Connection, ext: &str, id: &str, name: &str) {
        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, state, defaultAccess) VALUES (?1, ?2, 'new', 'FULL')",
                quote_ident(ext)
            ),
            rusqlite::params![id, name],
        )
        .unwrap();
    }

    fn provision_ext(conn: &Connection, definition: &TableDefinition) -> (TableNames, String) {
        let provisioner = TableProvisioner::new(conn, "main");
        let names = provisioner.provision(definition).unwrap();
        let (ext, _staging) = provisioner.provision_external(definition, "csv", None).unwrap();
        (names, ext)
    }

    #[test]
    fn push_refuses_when_conflicts_pending() {
        let conn = Connection::open_in_memory().unwrap();
        let definition = def();
        let (names, ext) = provision_ext(&conn, &definition);
        conn.execute(
            &format!(
                "INSERT INTO {} (id, state, defaultAccess) VALUES ('r1', 'conflict', 'FULL')",
                quote_ident(&ext)
            ),
            [],
        )
        .unwrap();

        let remote = MockRemote::default();
        let engine = PushEngine::new(&conn, &remote, &test_config());
        let err = engine.push(&definition, &names, &ext, false).unwrap_err();
        assert!(matches!(err, SyncError::UnresolvedConflicts(_)));
    }

    #[test]
    fn push_marks_successful_rows_sync_attachments() {
        let conn = Connection::open_in_memory().unwrap();
        let definition = def();
        let (names, ext) = provision_ext(&conn, &definition);
        let status = StatusTable::new(&conn, "main").unwrap();
        status.set("trips", Some("d1"), chrono::Utc::now()).unwrap();
        insert_new_row(&conn, &ext, "r1", "Alice");

        let remote = MockRemote::default();
        remote.alter_responses.borrow_mut().push(AlterRowsResponse {
            rows: vec![RowResult {
                id: "r1".to_string(),
                row_etag: Some("t1".to_string()),
                outcome: RowOutcome::Success,
            }],
        });

        let engine = PushEngine::new(&conn, &remote, &test_config());
        let report = engine.push(&definition, &names, &ext, false).unwrap();
        assert_eq!(report, PushReport { synced: 1, conflicts: 0 });

        let state: String = conn
            .query_row(&format!("SELECT state FROM {}", quote_ident(&ext)), [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "sync_attachments", "a synced push still needs attachment sub-sync before it's fully synced");
    }

    #[test]
    fn push_marks_conflicting_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let definition = def();
        let (names, ext) = provision_ext(&conn, &definition);
        let status = StatusTable::new(&conn, "main").unwrap();
        status.set("trips", Some("d1"), chrono::Utc::now()).unwrap();
        insert_new_row(&conn, &ext, "r1", "Alice");

        let remote = MockRemote::default();
        remote.alter_responses.borrow_mut().push(AlterRowsResponse {
            rows: vec![RowResult {
                id: "r1".to_string(),
                row_etag: None,
                outcome: RowOutcome::InConflict,
            }],
        });

        let engine = PushEngine::new(&conn, &remote, &test_config());
        let report = engine.push(&definition, &names, &ext, false).unwrap();
        assert_eq!(report, PushReport { synced: 0, conflicts: 1 });
    }

    #[test]
    fn without_force_push_row_etag_comes_from_l() {
        let conn = Connection::open_in_memory().unwrap();
        let definition = def();
        let (names, ext) = provision_ext(&conn, &definition);
        let status = StatusTable::new(&conn, "main").unwrap();
        status.set("trips", Some("d1"), chrono::Utc::now()).unwrap();

        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, state, defaultAccess) VALUES ('r1', 'Alice', 'synced', 'FULL')",
                quote_ident(&names.master)
            ),
            [],
        )
        .unwrap();
        conn.execute(
            &format!(
                "UPDATE {} SET rowETag = 'master-etag' WHERE id = 'r1'",
                quote_ident(&names.master)
            ),
            [],
        )
        .unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, state, rowETag, defaultAccess) VALUES ('r1', 'Alicia', 'modified', 'l-etag', 'FULL')",
                quote_ident(&ext)
            ),
            [],
        )
        .unwrap();

        let remote = MockRemote::default();
        remote.alter_responses.borrow_mut().push(AlterRowsResponse {
            rows: vec![RowResult { id: "r1".to_string(), row_etag: Some("new".to_string()), outcome: RowOutcome::Success }],
        });
        let engine = PushEngine::new(&conn, &remote, &test_config());
        engine.push(&definition, &names, &ext, false).unwrap();

        let sent = remote.alter_calls.borrow();
        let (_, request) = &sent[0];
        assert_eq!(request.rows[0].row_etag.as_deref(), Some("l-etag"));
    }

    #[test]
    fn force_push_takes_row_etag_from_master() {
        let conn = Connection::open_in_memory().unwrap();
        let definition = def();
        let (names, ext) = provision_ext(&conn, &definition);
        let status = StatusTable::new(&conn, "main").unwrap();
        status.set("trips", Some("d1"), chrono::Utc::now()).unwrap();

        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, state, rowETag, defaultAccess) VALUES ('r1', 'Alice', 'synced', 'master-etag', 'FULL')",
                quote_ident(&names.master)
            ),
            [],
        )
        .unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, state, rowETag, defaultAccess) VALUES ('r1', 'Alicia', 'modified', 'l-etag', 'FULL')",
                quote_ident(&ext)
            ),
            [],
        )
        .unwrap();

        let remote = MockRemote::default();
        remote.alter_responses.borrow_mut().push(AlterRowsResponse {
            rows: vec![RowResult { id: "r1".to_string(), row_etag: Some("new".to_string()), outcome: RowOutcome::Success }],
        });
        let engine = PushEngine::new(&conn, &remote, &test_config());
        engine.push(&definition, &names, &ext, true).unwrap();

        let sent = remote.alter_calls.borrow();
        let (_, request) = &sent[0];
        assert_eq!(request.rows[0].row_etag.as_deref(), Some("master-etag"));
    }

    #[test]
    fn missing_system_column_on_l_falls_back_to_master() {
        let conn = Connection::open_in_memory().unwrap();
        let definition = def();
        let (names, ext) = provision_ext(&conn, &definition);
        let status = StatusTable::new(&conn, "main").unwrap();
        status.set("trips", Some("d1"), chrono::Utc::now()).unwrap();

        conn.execute(
            &format!(
                "INSERT INTO {} (id, name, state, rowOwner, defaultAccess) VALUES ('r1', 'Alice', 'synced', 'owner@example.com', 'FULL')",
                quote_ident(&names.master)
            ),
            [],
        )
        .unwrap();
        insert_new_row(&conn, &ext, "r1", "Alicia");

        let remote = MockRemote::default();
        remote.alter_responses.borrow_mut().push(AlterRowsResponse {
            rows: vec![RowResult { id: "r1".to_string(), row_etag: Some("new".to_string()), outcome: RowOutcome::Success }],
        });
        let engine = PushEngine::new(&conn, &remote, &test_config());
        engine.push(&definition, &names, &ext, false).unwrap();

        let sent = remote.alter_calls.borrow();
        let (_, request) = &sent[0];
        assert_eq!(request.rows[0].filter_scope.row_owner.as_deref(), Some("owner@example.com"));
    }
}
