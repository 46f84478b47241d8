//! Remote server surface (§6).
//!
//! The pull/push/reconcile engines talk to the server only through these
//! traits, never through a concrete HTTP client directly — exactly as the
//! Python original routes every RPC through `OdkxConnection`. This also
//! gives tests a trivial in-memory double instead of a mock HTTP server.
//! Grounded on `odkx_connection.py` and `odkx_server_table.py`'s request
//! builders, and on the trait-per-external-service shape in
//! `components/webext-storage/src/sync/incoming.rs`.

use crate::definition::TableDefinition;
use crate::error::Result;
use crate::types::{AlterRowsRequest, AlterRowsResponse, DiffPage, ServerFile, ServerTableInfo};

/// Per-table RPCs: diff feed, alter-rows, and schema/definition lookup.
pub trait RemoteTable {
    fn table_info(&self, table_id: &str) -> Result<ServerTableInfo>;

    fn table_definition(&self, table_id: &str, schema_etag: &str) -> Result<TableDefinition>;

    /// Fetch one page of the row diff, starting at `cursor` (`None` for the
    /// first page). `data_etag` pins the snapshot the diff is relative to.
    fn diff(&self, table_id: &str, data_etag: Option<&str>, cursor: Option<&str>) -> Result<DiffPage>;

    /// `PUT tables/{id}/ref/{etag}/rows`: push a batch of rows, returning a
    /// per-row outcome (possibly `IN_CONFLICT`).
    fn alter_rows(&self, table_id: &str, request: AlterRowsRequest) -> Result<AlterRowsResponse>;
}

/// Manifest/meta RPCs backing attachment sub-sync (§4.8) and app-level
/// file sync (SUPPLEMENTED, `odkx_server_meta.py` / `odkx_server_file.py`).
pub trait RemoteMeta {
    fn table_manifest(&self, table_id: &str) -> Result<(String, Vec<ServerFile>)>;
    fn form_manifest(&self, table_id: &str, form_id: &str) -> Result<(String, Vec<ServerFile>)>;
    fn app_level_manifest(&self) -> Result<(String, Vec<ServerFile>)>;

    fn download(&self, url: &str) -> Result<Vec<u8>>;
    /// Upload one file's bytes under `filename`, using the
    /// `Content-Disposition: file;` multipart convention (§4.8, Glossary).
    fn upload(&self, table_id: &str, row_id: &str, filename: &str, bytes: &[u8]) -> Result<()>;
}
