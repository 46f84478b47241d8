//! Pull engine (§4.2).
//!
//! Pulls the server's diff feed for one table into `T_staging`, resolves
//! the latest version of each row (`ROW_NUMBER() OVER (PARTITION BY id
//! ORDER BY savepointTimestamp DESC, rowETag DESC)`), merges it into `T`,
//! and appends it to `T_log`. Runs inside a single transaction; attachment
//! sub-sync (§4.8) runs afterwards, outside it, since it talks to the
//! network and must not hold the write lock. Grounded on
//! `odkx_local_table.py::OdkxLocalTable.sync` and `local_storage_sql.py`'s
//! staging/merge helpers.

use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::config::SyncConfig;
use crate::definition::TableDefinition;
use crate::error::Result;
use crate::ident::quote_ident;
use crate::provisioner::{system_column_names, TableNames};
use crate::remote::RemoteTable;
use crate::status::StatusTable;
use crate::types::{DiffPage, RowState, ServerRow};

/// Hook invoked after a pull's transaction commits, to reconcile file
/// attachments for rows the pull just brought in (§4.8). Kept separate
/// from [`RemoteTable`] so the pull engine doesn't need to know about
/// manifests or file bytes.
pub trait AttachmentSyncer {
    fn sync_attachments_for_table(&self, definition: &TableDefinition, names: &TableNames) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The server's `dataETag` matched what we last recorded; nothing to do.
    Unchanged,
    /// Rows were pulled and merged; the argument is how many.
    Pulled(usize),
}

pub struct PullEngine<'c, R> {
    conn: &'c Connection,
    remote: &'c R,
    schema: String,
}

impl<'c, R: RemoteTable> PullEngine<'c, R> {
    pub fn new(conn: &'c Connection, remote: &'c R, config: &SyncConfig) -> Self {
        PullEngine {
            conn,
            remote,
            schema: config.schema.clone(),
        }
    }

    pub fn pull(
        &self,
        definition: &TableDefinition,
        names: &TableNames,
        attachments: Option<&dyn AttachmentSyncer>,
    ) -> Result<PullOutcome> {
        let table_id = &definition.table_id;
        let status = StatusTable::new(self.conn, &self.schema)?;
        let info = self.remote.table_info(table_id)?;

        if !status.has_incoming_changes(table_id, &info.data_etag)? {
            debug!("pull {table_id}: dataETag {} unchanged, running attachment sub-sync only", info.data_etag);
            if let Some(syncer) = attachments {
                syncer.sync_attachments_for_table(definition, names)?;
            }
            return Ok(PullOutcome::Unchanged);
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(&format!("DELETE FROM {}", quote_ident(&names.staging)), [])?;

        let data_col_keys: Vec<String> = definition.column_keys();
        let mut pulled = 0usize;
        let mut cursor: Option<String> = None;
        loop {
            let page: DiffPage = self
                .remote
                .diff(table_id, Some(&info.data_etag), cursor.as_deref())?;
            for row in &page.rows {
                self.insert_staging_row(&names.staging, &data_col_keys, row)?;
                pulled += 1;
            }
            if !page.has_more {
                break;
            }
            cursor = page.cursor.clone();
        }

        self.dedupe_latest_wins(&names.staging)?;
        self.merge_staging_into_master(names, &data_col_keys)?;
        self.append_to_log(names, &data_col_keys)?;

        status.set(table_id, Some(&info.data_etag), chrono::Utc::now())?;
        tx.commit()?;

        info!("pull {table_id}: merged {pulled} row(s) at dataETag {}", info.data_etag);

        if let Some(syncer) = attachments {
            syncer.sync_attachments_for_table(definition, names)?;
        }

        Ok(PullOutcome::Pulled(pulled))
    }

    /// Cheap check for whether a pull would find anything, without
    /// actually running one (SUPPLEMENTED: `hasIncomingChanges`).
    pub fn has_incoming_changes(&self, table_id: &str) -> Result<bool> {
        let status = StatusTable::new(self.conn, &self.schema)?;
        let info = self.remote.table_info(table_id)?;
        status.has_incoming_changes(table_id, &info.data_etag)
    }

    /// The `dataETag` this table had the first time it was ever pulled
    /// (SUPPLEMENTED: `getInitialDataETag`).
    pub fn initial_data_etag(&self, table_id: &str) -> Result<Option<String>> {
        StatusTable::new(self.conn, &self.schema)?.initial_data_etag(table_id)
    }

    fn insert_staging_row(&self, staging: &str, data_col_keys: &[String], row: &ServerRow) -> Result<()> {
        let mut cols: Vec<String> = vec!["id".to_string()];
        let mut values: Vec<Value> = vec![Value::Text(row.id.clone())];

        for name in system_column_names() {
            cols.push(name.to_string());
            values.push(system_column_value(name, row));
        }

        for key in data_col_keys {
            cols.push(key.clone());
            let value = row
                .ordered_columns
                .iter()
                .find(|oc| &oc.column == key)
                .and_then(|oc| oc.value.clone());
            values.push(value.map(Value::Text).unwrap_or(Value::Null));
        }

        cols.push("state".to_string());
        values.push(Value::Text(RowState::Fresh.as_str().to_string()));

        let placeholders = vec!["?"; cols.len()].join(", ");
        let col_list = cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(staging),
            col_list,
            placeholders
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(())
    }

    /// Keep only the newest row per `id` in `staging`, per the pull's
    /// latest-wins merge policy.
    fn dedupe_latest_wins(&self, staging: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {t} WHERE rowid NOT IN (
                SELECT rowid FROM (
                    SELECT rowid, ROW_NUMBER() OVER (
                        PARTITION BY id ORDER BY savepointTimestamp DESC, rowETag DESC
                    ) AS rn FROM {t}
                ) WHERE rn = 1
            )",
            t = quote_ident(staging)
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn physical_columns(data_col_keys: &[String]) -> Vec<String> {
        let mut cols = vec!["id".to_string()];
        cols.extend(system_column_names().iter().map(|s| s.to_string()));
        cols.extend(data_col_keys.iter().cloned());
        cols
    }

    /// Every row a pull merges into `T` lands in `sync_attachments`,
    /// regardless of whatever state it carried in staging — attachment
    /// sub-sync is what decides whether it's fully `synced` from here.
    fn merge_staging_into_master(&self, names: &TableNames, data_col_keys: &[String]) -> Result<()> {
        let select_cols = Self::physical_columns(data_col_keys);
        let select_col_list = select_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let mut insert_cols = select_cols.clone();
        insert_cols.push("state".to_string());
        let insert_col_list = insert_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

        self.conn.execute(
            &format!(
                "DELETE FROM {master} WHERE id IN (SELECT id FROM {staging})",
                master = quote_ident(&names.master),
                staging = quote_ident(&names.staging)
            ),
            [],
        )?;
        self.conn.execute(
            &format!(
                "INSERT INTO {master} ({insert_cols}) SELECT {select_cols}, ?1 FROM {staging}",
                master = quote_ident(&names.master),
                staging = quote_ident(&names.staging),
                insert_cols = insert_col_list,
                select_cols = select_col_list,
            ),
            rusqlite::params![RowState::SyncAttachments.as_str()],
        )?;
        Ok(())
    }

    fn append_to_log(&self, names: &TableNames, data_col_keys: &[String]) -> Result<()> {
        let cols = Self::physical_columns(data_col_keys);
        let col_list = cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT INTO {log} ({cols})
             SELECT {cols} FROM {staging} s
             WHERE NOT EXISTS (SELECT 1 FROM {log} l WHERE l.{row_etag} = s.{row_etag})",
            log = quote_ident(&names.log),
            staging = quote_ident(&names.staging),
            cols = col_list,
            row_etag = quote_ident("rowETag"),
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }
}

fn system_column_value(name: &str, row: &ServerRow) -> Value {
    match name {
        "rowETag" => opt_text(row.row_etag.clone()),
        "dataETagAtModification" => opt_text(row.data_etag_at_modification.clone()),
        "savepointTimestamp" => opt_text(row.savepoint_timestamp.clone()),
        "savepointCreator" => opt_text(row.savepoint_creator.clone()),
        "savepointType" => opt_text(row.savepoint_type.clone()),
        "createUser" => opt_text(row.create_user.clone()),
        "lastUpdateUser" => opt_text(row.last_update_user.clone()),
        "formId" => opt_text(row.form_id.clone()),
        "locale" => opt_text(row.locale.clone()),
        "defaultAccess" => Value::Text(row.filter_scope.default_access.clone()),
        "rowOwner" => opt_text(row.filter_scope.row_owner.clone()),
        "groupReadOnly" => opt_text(row.filter_scope.group_read_only.clone()),
        "groupModify" => opt_text(row.filter_scope.group_modify.clone()),
        "groupPrivileged" => opt_text(row.filter_scope.group_privileged.clone()),
        "deleted" => Value::Integer(row.deleted as i64),
        _ => Value::Null,
    }
}

fn opt_text(v: Option<String>) -> Value {
    v.map(Value::Text).unwrap_or(Value::Null)
}
