use thiserror::Error;

/// Crate-wide error type. Every fallible operation in the engine returns
/// `Result<T, SyncError>`.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("no cached definition/form found: {0}")]
    CacheNotFound(String),

    #[error("column '{0}' is not declared in the table definition")]
    UnknownColumn(String),

    #[error("table '{0}' has pending local changes; sync or resetLocalChanges first")]
    PendingLocalChanges(String),

    #[error("table '{0}' has unresolved conflicts; resolve before pushing")]
    UnresolvedConflicts(String),

    #[error("row '{row_id}' is missing column '{column}' the server declares")]
    SchemaDiverged { row_id: String, column: String },

    #[error("concurrent server write during history replay for row '{0}'")]
    ConcurrentHistoryModification(String),

    #[error("attachment sync left {missing} file(s) missing for row '{row_id}'")]
    AttachmentPartial { row_id: String, missing: usize },

    #[error("transport error: HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("invalid state: {0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
