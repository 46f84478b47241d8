//! Wire and row-level types shared across the pull, push and reconcile
//! engines. Grounded on the `orderedColumns`/`filterScope` shapes in
//! `odkx_local_table.py::row_asdict`/`row2rec` and the alter-rows payload
//! described in spec.md §6.

use serde::{Deserialize, Serialize};

/// `savepointType` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavepointType {
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "INCOMPLETE")]
    Incomplete,
    #[serde(rename = "CHECKPOINT")]
    Checkpoint,
}

impl SavepointType {
    pub fn as_str(self) -> &'static str {
        match self {
            SavepointType::Complete => "COMPLETE",
            SavepointType::Incomplete => "INCOMPLETE",
            SavepointType::Checkpoint => "CHECKPOINT",
        }
    }
}

/// A row's filter scope: per-row access control (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterScope {
    pub default_access: String,
    pub row_owner: Option<String>,
    pub group_read_only: Option<String>,
    pub group_modify: Option<String>,
    pub group_privileged: Option<String>,
}

impl Default for FilterScope {
    fn default() -> Self {
        FilterScope {
            default_access: "FULL".to_string(),
            row_owner: None,
            group_read_only: None,
            group_modify: None,
            group_privileged: None,
        }
    }
}

/// One `{column, value}` pair in the alter-rows payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedColumn {
    pub column: String,
    pub value: Option<String>,
}

/// A single row as sent to, or received from, the server's alter-rows RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRow {
    pub id: String,
    #[serde(rename = "rowETag")]
    pub row_etag: Option<String>,
    #[serde(rename = "dataETagAtModification")]
    pub data_etag_at_modification: Option<String>,
    pub deleted: bool,
    #[serde(rename = "createUser")]
    pub create_user: Option<String>,
    #[serde(rename = "lastUpdateUser")]
    pub last_update_user: Option<String>,
    #[serde(rename = "formId")]
    pub form_id: Option<String>,
    pub locale: Option<String>,
    #[serde(rename = "savepointType")]
    pub savepoint_type: Option<String>,
    #[serde(rename = "savepointTimestamp")]
    pub savepoint_timestamp: Option<String>,
    #[serde(rename = "savepointCreator")]
    pub savepoint_creator: Option<String>,
    #[serde(rename = "filterScope")]
    pub filter_scope: FilterScope,
    #[serde(rename = "orderedColumns")]
    pub ordered_columns: Vec<OrderedColumn>,
}

/// Request body for `PUT tables/{id}/ref/{etag}/rows` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterRowsRequest {
    pub rows: Vec<ServerRow>,
    #[serde(rename = "dataETag")]
    pub data_etag: String,
}

/// Per-row outcome in an alter-rows response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOutcome {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "IN_CONFLICT")]
    InConflict,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
    pub id: String,
    #[serde(rename = "rowETag")]
    pub row_etag: Option<String>,
    pub outcome: RowOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterRowsResponse {
    pub rows: Vec<RowResult>,
}

/// A page of the cursor-paginated diff feed (§6).
#[derive(Debug, Clone)]
pub struct DiffPage {
    pub rows: Vec<ServerRow>,
    pub data_etag: String,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// A file entry in a table-level or row-level manifest (§6, Glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFile {
    pub filename: String,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub md5hash: Option<String>,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTableInfo {
    pub table_id: String,
    pub data_etag: String,
    pub schema_etag: String,
}

/// Local sync-state tag (Design Note §9: "naturally a tagged variant").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowState {
    Fresh,
    SyncAttachments,
    Synced,
    Conflict,
    New,
    Modified,
    Unchanged,
    HistoryUpload,
}

impl RowState {
    pub fn as_str(self) -> &'static str {
        match self {
            RowState::Fresh => "fresh",
            RowState::SyncAttachments => "sync_attachments",
            RowState::Synced => "synced",
            RowState::Conflict => "conflict",
            RowState::New => "new",
            RowState::Modified => "modified",
            RowState::Unchanged => "unchanged",
            RowState::HistoryUpload => "historyUpload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "fresh" => RowState::Fresh,
            "sync_attachments" => RowState::SyncAttachments,
            "synced" => RowState::Synced,
            "conflict" => RowState::Conflict,
            "new" => RowState::New,
            "modified" => RowState::Modified,
            "unchanged" => RowState::Unchanged,
            "historyUpload" => RowState::HistoryUpload,
            _ => return None,
        })
    }
}

/// `localSyncMode` (Design Note §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalSyncMode {
    Full,
    OnlyNewRecords,
    OnlyExistingRecords,
}
