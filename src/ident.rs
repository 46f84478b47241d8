//! SQL identifier quoting.
//!
//! REDESIGN FLAG (spec.md §9, item 3): the original's dynamic SQL assembly
//! treats `tableId`/`schema` as raw string interpolation. Values are always
//! bound as `rusqlite` parameters in this crate; table and column names
//! (which SQLite cannot bind as parameters) are validated against a strict
//! charset and then quoted, never formatted in from unchecked input.

use crate::error::{Result, SyncError};

/// Validate that `s` is safe to use as a bare SQL identifier component
/// (used before building a physical table/column name). Rejects anything
/// outside `[A-Za-z0-9_]`.
pub fn validate_ident_component(s: &str) -> Result<()> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SyncError::State("invalid identifier component"));
    }
    Ok(())
}

/// Double-quote an identifier for use in SQL, escaping embedded quotes.
/// Caller is expected to have validated the identifier's components first
/// via [`validate_ident_component`] wherever the name is built from
/// caller-controlled parts (table/column/prefix names).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
