//! Table provisioner (§4.1).
//!
//! Creates the five per-table relations and the two auxiliary singleton
//! relations (`status_table`, the definition cache) from a
//! [`TableDefinition`], idempotently: repeated calls only add missing
//! columns, never rewrite a column's type. Grounded on
//! `local_storage_sql.py::SqlLocalStorage::_createLocalTable`.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::definition::TableDefinition;
use crate::error::Result;
use crate::ident::{quote_ident, validate_ident_component};

/// System columns present on every relation except where noted.
/// `(name, sql_type)`.
const SYSTEM_COLUMNS: &[(&str, &str)] = &[
    ("rowETag", "TEXT"),
    ("dataETagAtModification", "TEXT"),
    ("savepointTimestamp", "TEXT"),
    ("savepointCreator", "TEXT"),
    ("savepointType", "TEXT"),
    ("createUser", "TEXT"),
    ("lastUpdateUser", "TEXT"),
    ("formId", "TEXT"),
    ("locale", "TEXT"),
    ("defaultAccess", "TEXT"),
    ("rowOwner", "TEXT"),
    ("groupReadOnly", "TEXT"),
    ("groupModify", "TEXT"),
    ("groupPrivileged", "TEXT"),
    ("deleted", "INTEGER"),
];

/// The non-`id`, non-data system column names shared by every relation
/// except `state`/`hash`, in declaration order. Exposed so the pull/push
/// engines can build column lists matching what [`TableProvisioner`]
/// actually created.
pub fn system_column_names() -> Vec<&'static str> {
    SYSTEM_COLUMNS.iter().map(|&(n, _)| n).collect()
}

/// Resolves the physical table names for a logical `tableId` within a
/// schema prefix. SQLite has no server-side schemas, so `schema` becomes a
/// table-name prefix (`{schema}_{table_id}`), preserving the Python
/// `schema.table_name` addressing scheme.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub master: String,
    pub log: String,
    pub staging: String,
}

impl TableNames {
    pub fn new(schema: &str, table_id: &str) -> Result<Self> {
        validate_ident_component(schema)?;
        validate_ident_component(table_id)?;
        let base = format!("{schema}_{table_id}");
        Ok(TableNames {
            master: base.clone(),
            log: format!("{base}_log"),
            staging: format!("{base}_staging"),
        })
    }

    pub fn external(schema: &str, table_id: &str, prefix: &str) -> Result<(String, String)> {
        validate_ident_component(schema)?;
        validate_ident_component(table_id)?;
        validate_ident_component(prefix)?;
        let ext = format!("{schema}_{table_id}_{prefix}");
        Ok((ext.clone(), format!("{ext}_staging")))
    }
}

pub struct TableProvisioner<'c> {
    conn: &'c Connection,
    schema: String,
}

impl<'c> TableProvisioner<'c> {
    pub fn new(conn: &'c Connection, schema: impl Into<String>) -> Self {
        TableProvisioner {
            conn,
            schema: schema.into(),
        }
    }

    /// Create (or extend) the five per-table relations for `definition`.
    /// `T` and `T_log` are always created; `T_staging` too. External-source
    /// tables are created on demand via [`Self::provision_external`].
    pub fn provision(&self, definition: &TableDefinition) -> Result<TableNames> {
        let names = TableNames::new(&self.schema, &definition.table_id)?;
        let data_cols = self.data_columns(definition, None)?;

        self.create_or_extend(&names.master, &data_cols, PkPolicy::Id, true, false)?;
        self.create_or_extend(&names.log, &data_cols, PkPolicy::RowEtag, false, false)?;
        self.create_or_extend(&names.staging, &data_cols, PkPolicy::None, true, false)?;

        self.provision_status_table()?;
        self.provision_definition_cache()?;
        Ok(names)
    }

    /// Create (or extend) `T_<ext>` and `T_<ext>_staging`, restricted to the
    /// caller-supplied subset of materialized columns (or all of them when
    /// `only_columns` is `None`). Fails with `UnknownColumn` if a requested
    /// column isn't in `definition`.
    pub fn provision_external(
        &self,
        definition: &TableDefinition,
        prefix: &str,
        only_columns: Option<&[String]>,
    ) -> Result<(String, String)> {
        if let Some(cols) = only_columns {
            definition.validate_subset(cols)?;
        }
        let (ext, ext_staging) = TableNames::external(&self.schema, &definition.table_id, prefix)?;
        let data_cols = self.data_columns(definition, only_columns)?;

        self.create_or_extend(&ext, &data_cols, PkPolicy::Id, true, true)?;
        self.create_or_extend(&ext_staging, &data_cols, PkPolicy::None, true, true)?;
        Ok((ext, ext_staging))
    }

    fn data_columns(
        &self,
        definition: &TableDefinition,
        only_columns: Option<&[String]>,
    ) -> Result<Vec<(String, &'static str)>> {
        let wanted: Option<BTreeSet<&str>> =
            only_columns.map(|cols| cols.iter().map(|s| s.as_str()).collect());
        let mut out = Vec::new();
        for col in definition.materialized_columns() {
            if let Some(w) = &wanted {
                if !w.contains(col.element_key.as_str()) {
                    continue;
                }
            }
            validate_ident_component(&col.element_key)?;
            out.push((col.element_key.clone(), col.element_type.sql_type()));
        }
        Ok(out)
    }

    fn create_or_extend(
        &self,
        table: &str,
        data_cols: &[(String, &'static str)],
        pk: PkPolicy,
        with_state: bool,
        with_hash: bool,
    ) -> Result<()> {
        validate_ident_component(table)?;
        let exists = self.table_exists(table)?;
        if !exists {
            self.create_table(table, data_cols, pk, with_state, with_hash)?;
        } else {
            self.add_missing_columns(table, data_cols, with_state, with_hash)?;
        }
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_table(
        &self,
        table: &str,
        data_cols: &[(String, &'static str)],
        pk: PkPolicy,
        with_state: bool,
        with_hash: bool,
    ) -> Result<()> {
        let mut cols: Vec<String> = Vec::new();
        cols.push(format!("{} TEXT", quote_ident("id")));
        for (name, ty) in SYSTEM_COLUMNS {
            cols.push(format!("{} {}", quote_ident(name), ty));
        }
        for (name, ty) in data_cols {
            cols.push(format!("{} {}", quote_ident(name), ty));
        }
        if with_state {
            cols.push(format!("{} TEXT", quote_ident("state")));
        }
        if with_hash {
            cols.push(format!("{} TEXT", quote_ident("hash")));
        }
        let pk_col = match pk {
            PkPolicy::Id => Some("id"),
            PkPolicy::RowEtag => Some("rowETag"),
            PkPolicy::None => None,
        };
        let sql = match pk_col {
            Some(pk_col) => format!(
                "CREATE TABLE {} ({}, PRIMARY KEY ({}))",
                quote_ident(table),
                cols.join(", "),
                quote_ident(pk_col)
            ),
            None => format!("CREATE TABLE {} ({})", quote_ident(table), cols.join(", ")),
        };
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn add_missing_columns(
        &self,
        table: &str,
        data_cols: &[(String, &'static str)],
        with_state: bool,
        with_hash: bool,
    ) -> Result<()> {
        let existing = self.existing_columns(table)?;
        let mut wanted: Vec<(String, &'static str)> =
            SYSTEM_COLUMNS.iter().map(|&(n, t)| (n.to_string(), t)).collect();
        wanted.extend(data_cols.iter().cloned());
        if with_state {
            wanted.push(("state".to_string(), "TEXT"));
        }
        if with_hash {
            wanted.push(("hash".to_string(), "TEXT"));
        }
        for (name, ty) in wanted {
            if !existing.contains(&name) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(&name),
                    ty
                );
                self.conn.execute(&sql, [])?;
            }
        }
        Ok(())
    }

    fn existing_columns(&self, table: &str) -> Result<BTreeSet<String>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(1))?
            .collect::<std::result::Result<BTreeSet<String>, _>>()?;
        Ok(names)
    }

    fn provision_status_table(&self) -> Result<()> {
        // Delegate to StatusTable's own schema so there is exactly one
        // place that defines the status table's columns.
        crate::status::StatusTable::new(self.conn, &self.schema)?;
        Ok(())
    }

    fn provision_definition_cache(&self) -> Result<()> {
        // Delegate to DefinitionCache's own schema, for the same reason as
        // provision_status_table: exactly one place defines these columns.
        crate::definition_cache::DefinitionCache::new(self.conn, &self.schema)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum PkPolicy {
    Id,
    RowEtag,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ColumnArena, ColumnDef, ElementType};
    use std::collections::BTreeMap;

    fn def_with_name_col() -> TableDefinition {
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

    #[test]
    fn provision_creates_five_relations_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let provisioner = TableProvisioner::new(&conn, "main");
        let def = def_with_name_col();
        let names = provisioner.provision(&def).unwrap();
        assert_eq!(names.master, "main_trips");
        assert_eq!(names.log, "main_trips_log");
        assert_eq!(names.staging, "main_trips_staging");

        // idempotent re-provisioning must not error or duplicate columns
        provisioner.provision(&def).unwrap();

        let cols = provisioner.existing_columns(&names.master).unwrap();
        assert!(cols.contains("name"));
        assert!(cols.contains("state"));
        assert!(cols.contains("id"));

        let log_cols = provisioner.existing_columns(&names.log).unwrap();
        assert!(!log_cols.contains("state"));
    }

    #[test]
    fn unknown_external_column_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let provisioner = TableProvisioner::new(&conn, "main");
        let def = def_with_name_col();
        let err = provisioner
            .provision_external(&def, "csv", Some(&["bogus".to_string()]))
            .unwrap_err();
        assert!(matches!(err, crate::error::SyncError::UnknownColumn(_)));
    }

    #[test]
    fn provision_external_restricts_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let provisioner = TableProvisioner::new(&conn, "main");
        let mut arena = ColumnArena::new();
        arena.insert(ColumnDef {
            element_key: "name".into(),
            element_name: "name".into(),
            element_type: ElementType::String,
            parent: None,
            children: vec![],
            properties: BTreeMap::new(),
        });
        arena.insert(ColumnDef {
            element_key: "age".into(),
            element_name: "age".into(),
            element_type: ElementType::Integer,
            parent: None,
            children: vec![],
            properties: BTreeMap::new(),
        });
        let def = TableDefinition {
            table_id: "trips".into(),
            schema_etag: "e1".into(),
            columns: arena,
            ordered_keys: vec!["name".into(), "age".into()],
        };
        let (ext, ext_staging) = provisioner
            .provision_external(&def, "csv", Some(&["name".to_string()]))
            .unwrap();
        let cols = provisioner.existing_columns(&ext).unwrap();
        assert!(cols.contains("name"));
        assert!(!cols.contains("age"));
        assert!(cols.contains("hash"));
        let staging_cols = provisioner.existing_columns(&ext_staging).unwrap();
        assert!(staging_cols.contains("hash"));
    }
}
