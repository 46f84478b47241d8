//! Engine-wide configuration (Design Note: the Python original threaded
//! these as scattered constructor kwargs across `OdkxLocalTable`,
//! `OdkxConnection`, and the attachment helpers; here they're one struct
//! passed once to whichever engine needs it).

use std::path::PathBuf;

/// Knobs shared by the pull/push/reconcile/attachment engines for one
/// local database.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Table-name prefix standing in for the Python `schema.table`
    /// addressing scheme, since SQLite has no server-side schemas.
    pub schema: String,
    /// Root directory attachment files are stored under.
    pub file_storage_root: PathBuf,
    /// Replace filesystem-reserved characters in attachment filenames
    /// (`<>:"|?*`) for clients running on Windows.
    pub use_windows_compatible_paths: bool,
    /// Principal stamped into `createUser`/`lastUpdateUser`/
    /// `savepointCreator` when the caller doesn't supply one (external
    /// source imports, local edits made outside a form).
    pub default_user: String,
}

impl SyncConfig {
    pub fn new(schema: impl Into<String>, default_user: impl Into<String>, file_storage_root: impl Into<PathBuf>) -> Self {
        SyncConfig {
            schema: schema.into(),
            file_storage_root: file_storage_root.into(),
            use_windows_compatible_paths: cfg!(windows),
            default_user: default_user.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_windows_paths_from_target_os() {
        let config = SyncConfig::new("main", "alice", "/tmp/attachments");
        assert_eq!(config.schema, "main");
        assert_eq!(config.default_user, "alice");
    }
}
