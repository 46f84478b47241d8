//! Table migrator (§4.9).
//!
//! Moves a table's rows from one `tableId`/schema generation to another,
//! mapping columns by `elementKey` and refusing to carry over a column
//! whose physical type changed incompatibly. Grounded on
//! `odkx_migration.py::OdkxMigrationPlan`/`OdkxMigrator`.
//!
//! REDESIGN FLAG (spec.md §9, item 1): migrating a table to its own
//! `tableId` is refused outright — the Python original's column-mapping
//! logic assumes `from` and `to` are distinct tables and produces
//! nonsensical self-referential renames otherwise. Preserved verbatim
//! here rather than special-cased, per Open Question #1's resolution.
//!
//! REDESIGN FLAG (item 2): every column the planner can't map is now
//! logged (not silently dropped), and [`MigrationOptions::strict`] turns
//! an unmapped required column into a hard error instead of a warning.

use chrono::Utc;
use log::{info, warn};
use rusqlite::Connection;

use crate::config::SyncConfig;
use crate::definition::{ColumnDef, TableDefinition};
use crate::error::{Result, SyncError};
use crate::ident::quote_ident;
use crate::provisioner::{system_column_names, TableNames};
use crate::push::{provision_rev_table, PushEngine, PushReport};
use crate::remote::RemoteTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub from_key: String,
    pub to_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedColumn {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub from_table_id: String,
    pub to_table_id: String,
    pub mappings: Vec<ColumnMapping>,
    pub skipped: Vec<SkippedColumn>,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationOptions {
    pub strict: bool,
    pub archive: ArchiveMode,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        MigrationOptions {
            strict: false,
            archive: ArchiveMode::RenameInPlace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Rename the source table's physical relations in place; cheap, but
    /// leaves the archived data under a name derived from the old tableId.
    RenameInPlace,
    /// Copy the source table's rows into a freshly named archive table,
    /// leaving the original name free for reuse.
    Copy,
}

/// Plan a migration from `from` to `to`. Columns are matched by
/// `elementKey`; a match whose SQL type differs between source and
/// target is recorded as skipped rather than mapped, since copying it
/// as-is would silently truncate or corrupt data.
pub fn plan_migration(from: &TableDefinition, to: &TableDefinition) -> Result<MigrationPlan> {
    if from.table_id == to.table_id {
        return Err(SyncError::State(
            "migrating a table to its own tableId is not supported",
        ));
    }

    let mut mappings = Vec::new();
    let mut skipped = Vec::new();

    for from_col in from.materialized_columns() {
        match to.columns.get_by_key(&from_col.element_key) {
            None => skipped.push(SkippedColumn {
                key: from_col.element_key.clone(),
                reason: "no column with this elementKey in the target table".to_string(),
            }),
            Some(to_col) => {
                if columns_compatible(from_col, to_col) {
                    mappings.push(ColumnMapping {
                        from_key: from_col.element_key.clone(),
                        to_key: to_col.element_key.clone(),
                    });
                } else {
                    skipped.push(SkippedColumn {
                        key: from_col.element_key.clone(),
                        reason: format!(
                            "incompatible types: {:?} -> {:?}",
                            from_col.element_type, to_col.element_type
                        ),
                    });
                }
            }
        }
    }

    for col in skipped.iter() {
        warn!(
            "migration {} -> {}: skipping column '{}' ({})",
            from.table_id, to.table_id, col.key, col.reason
        );
    }

    Ok(MigrationPlan {
        from_table_id: from.table_id.clone(),
        to_table_id: to.table_id.clone(),
        mappings,
        skipped,
    })
}

fn columns_compatible(a: &ColumnDef, b: &ColumnDef) -> bool {
    a.element_type.sql_type() == b.element_type.sql_type()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub rows_migrated: usize,
    pub columns_mapped: usize,
    pub columns_skipped: usize,
}

pub struct Migrator<'c> {
    conn: &'c Connection,
    schema: String,
}

impl<'c> Migrator<'c> {
    pub fn new(conn: &'c Connection, schema: impl Into<String>) -> Self {
        Migrator { conn, schema: schema.into() }
    }

    /// Apply `plan`, copying rows from `from_names.master` into
    /// `to_names.master` through the column mapping, then archiving the
    /// source table per `options.archive`. When `dry_run` is set nothing
    /// is written; only the row count that *would* migrate is reported.
    pub fn apply_plan(
        &self,
        plan: &MigrationPlan,
        from_names: &TableNames,
        to_names: &TableNames,
        options: MigrationOptions,
        dry_run: bool,
    ) -> Result<MigrationReport> {
        if options.strict && !plan.skipped.is_empty() {
            return Err(SyncError::State(
                "strict migration refused: one or more source columns could not be mapped",
            ));
        }

        let row_count: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", quote_ident(&from_names.master)),
            [],
            |r| r.get(0),
        )?;

        let report = MigrationReport {
            rows_migrated: row_count as usize,
            columns_mapped: plan.mappings.len(),
            columns_skipped: plan.skipped.len(),
        };

        if dry_run {
            return Ok(report);
        }

        let mut from_cols = vec!["id".to_string()];
        let mut to_cols = vec!["id".to_string()];
        from_cols.extend(system_column_names().iter().map(|s| s.to_string()));
        to_cols.extend(system_column_names().iter().map(|s| s.to_string()));
        for mapping in &plan.mappings {
            from_cols.push(mapping.from_key.clone());
            to_cols.push(mapping.to_key.clone());
        }
        from_cols.push("state".to_string());
        to_cols.push("state".to_string());

        let from_list = from_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let to_list = to_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO {to} ({to_list}) SELECT {from_list} FROM {from}",
                to = quote_ident(&to_names.master),
                from = quote_ident(&from_names.master),
            ),
            [],
        )?;
        tx.commit()?;

        self.archive(from_names, options.archive)?;
        info!(
            "migration {} -> {}: {} row(s), {} column(s) mapped, {} skipped",
            plan.from_table_id, plan.to_table_id, report.rows_migrated, report.columns_mapped, report.columns_skipped
        );
        Ok(report)
    }

    fn archive(&self, names: &TableNames, mode: ArchiveMode) -> Result<()> {
        match mode {
            ArchiveMode::RenameInPlace => {
                let archived = format!("{}_archived_{}", names.master, Utc::now().timestamp());
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        quote_ident(&names.master),
                        quote_ident(&archived)
                    ),
                    [],
                )?;
            }
            ArchiveMode::Copy => {
                let archived = format!("{}_archived_{}", names.master, Utc::now().timestamp());
                self.conn.execute(
                    &format!(
                        "CREATE TABLE {} AS SELECT * FROM {}",
                        quote_ident(&archived),
                        quote_ident(&names.master)
                    ),
                    [],
                )?;
            }
        }
        Ok(())
    }

    /// Replay the archived source table's full log history into the
    /// migrated target via the push engine's history-replay mode
    /// (§4.4/§4.9). `from_names` names the archived table whose `_log` is
    /// being replayed; `to_names`/`to_table_id` name the destination the
    /// replayed rows are sent under — the destination's own log starts out
    /// empty, so the `_rev` gating table must be seeded from the source.
    pub fn replay_history<R: RemoteTable>(
        &self,
        remote: &R,
        from_names: &TableNames,
        to_table_id: &str,
        to_names: &TableNames,
        batch_size: usize,
    ) -> Result<PushReport> {
        let rev_table = format!("{}_rev", to_names.master);
        provision_rev_table(self.conn, from_names, &rev_table)?;
        // push_history only reads config.schema; the other fields are
        // irrelevant to history replay.
        let config = SyncConfig::new(self.schema.clone(), "", "");
        let push = PushEngine::new(self.conn, remote, &config);
        push.push_history(to_table_id, from_names, &rev_table, batch_size)
    }
}
