//! Attachment sub-sync (§4.8, Design Note §9).
//!
//! Rows with `rowpath`-typed columns reference files that live outside
//! the row itself. After a pull merges new row data into `T`, this module
//! reconciles the files those rowpath columns point to against the
//! server's per-table/per-form manifest: a file is only fetched or
//! uploaded when its MD5 differs from (or is missing on) the other side —
//! existence alone doesn't mean the bytes match. A row whose attachments
//! aren't all present moves to `sync_attachments` rather than `synced`,
//! so a later pass can retry just the files that failed — partial
//! attachment failure never blocks the row's data from having synced.
//! Grounded on `odkx_server_file.py` / `odkx_manifest_cache.py` and the
//! `Content-Disposition: file;` upload convention in the Glossary.

use std::path::{Path, PathBuf};

use log::warn;
use md5::{Digest, Md5};
use rusqlite::Connection;

use crate::config::SyncConfig;
use crate::definition::TableDefinition;
use crate::error::{Result, SyncError};
use crate::ident::quote_ident;
use crate::provisioner::TableNames;
use crate::pull::AttachmentSyncer;
use crate::remote::RemoteMeta;
use crate::types::{RowState, ServerFile};

/// Where attachment bytes are read from and written to on this device.
pub trait AttachmentStore {
    fn read(&self, table_id: &str, row_id: &str, filename: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, table_id: &str, row_id: &str, filename: &str, bytes: &[u8]) -> Result<()>;
    fn exists(&self, table_id: &str, row_id: &str, filename: &str) -> Result<bool>;
    /// The local file's MD5 digest (lowercase hex), or `None` if it isn't
    /// present locally. Used to decide whether a file actually needs
    /// downloading or uploading, rather than just whether it exists.
    fn md5(&self, table_id: &str, row_id: &str, filename: &str) -> Result<Option<String>>;
}

/// Stores each row's attachments under `root/table_id/row_id/filename`.
/// `windows_compatible_paths` mirrors the app-level setting that swaps
/// `:`/`?`/other reserved characters out of filenames on Windows clients.
pub struct FilesystemAttachmentStore {
    root: PathBuf,
    windows_compatible_paths: bool,
}

impl FilesystemAttachmentStore {
    pub fn new(config: &SyncConfig) -> Self {
        FilesystemAttachmentStore {
            root: config.file_storage_root.clone(),
            windows_compatible_paths: config.use_windows_compatible_paths,
        }
    }

    fn sanitize(&self, filename: &str) -> Result<String> {
        if filename.is_empty() || filename.contains("..") || filename.contains('/') || filename.contains('\\') {
            return Err(SyncError::State("attachment filename escapes its row directory"));
        }
        if self.windows_compatible_paths {
            Ok(filename
                .chars()
                .map(|c| if "<>:\"|?*".contains(c) { '_' } else { c })
                .collect())
        } else {
            Ok(filename.to_string())
        }
    }

    fn path(&self, table_id: &str, row_id: &str, filename: &str) -> Result<PathBuf> {
        let safe = self.sanitize(filename)?;
        Ok(self.root.join(table_id).join(row_id).join(safe))
    }
}

impl AttachmentStore for FilesystemAttachmentStore {
    fn read(&self, table_id: &str, row_id: &str, filename: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(table_id, row_id, filename)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    fn write(&self, table_id: &str, row_id: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(table_id, row_id, filename)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn exists(&self, table_id: &str, row_id: &str, filename: &str) -> Result<bool> {
        Ok(self.path(table_id, row_id, filename)?.exists())
    }

    fn md5(&self, table_id: &str, row_id: &str, filename: &str) -> Result<Option<String>> {
        match self.read(table_id, row_id, filename)? {
            Some(bytes) => {
                let mut hasher = Md5::new();
                hasher.update(&bytes);
                Ok(Some(hex::encode(hasher.finalize())))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentReport {
    pub rows_fully_synced: usize,
    pub rows_partial: usize,
    pub files_downloaded: usize,
    pub files_uploaded: usize,
}

pub struct AttachmentSubSync<'c, M> {
    conn: &'c Connection,
    remote: &'c M,
    store: &'c dyn AttachmentStore,
}

impl<'c, M: RemoteMeta> AttachmentSubSync<'c, M> {
    pub fn new(conn: &'c Connection, remote: &'c M, store: &'c dyn AttachmentStore) -> Self {
        AttachmentSubSync { conn, remote, store }
    }

    pub fn sync_table(&self, definition: &TableDefinition, names: &TableNames) -> Result<AttachmentReport> {
        let attachment_cols = definition.attachment_columns();
        let mut report = AttachmentReport::default();
        if attachment_cols.is_empty() {
            return Ok(report);
        }

        let (_etag, manifest) = self.remote.table_manifest(&definition.table_id)?;
        let manifest_by_name: std::collections::BTreeMap<&str, &ServerFile> = manifest
            .iter()
            .map(|f| (f.filename.as_str(), f))
            .collect();

        let col_list = attachment_cols
            .iter()
            .map(|c| quote_ident(&c.element_key))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, {cols} FROM {t} WHERE state = ?1",
            cols = col_list,
            t = quote_ident(&names.master)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<(String, Vec<Option<String>>)> = stmt
            .query_map([RowState::SyncAttachments.as_str()], |r| {
                let id: String = r.get(0)?;
                let mut values = Vec::with_capacity(attachment_cols.len());
                for i in 0..attachment_cols.len() {
                    values.push(r.get(1 + i)?);
                }
                Ok((id, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for (row_id, values) in rows {
            let mut missing = 0usize;
            for value in values.into_iter().flatten() {
                let filename = Path::new(&value)
                    .file_name()
                    .and_then(|f| f.to_str())
                    .unwrap_or(&value)
                    .to_string();
                let local_md5 = self.store.md5(&definition.table_id, &row_id, &filename)?;
                match manifest_by_name.get(filename.as_str()) {
                    Some(entry) if entry.md5hash.is_some() && entry.md5hash == local_md5 => continue,
                    Some(entry) => match &entry.download_url {
                        Some(url) => {
                            let bytes = self.remote.download(url)?;
                            self.store.write(&definition.table_id, &row_id, &filename, &bytes)?;
                            report.files_downloaded += 1;
                        }
                        None => {
                            warn!("attachment {filename} for row {row_id} has no download url");
                            missing += 1;
                        }
                    },
                    None => {
                        warn!("attachment {filename} for row {row_id} missing from server manifest");
                        missing += 1;
                    }
                }
            }
            let new_state = if missing == 0 {
                report.rows_fully_synced += 1;
                RowState::Synced
            } else {
                report.rows_partial += 1;
                RowState::SyncAttachments
            };
            self.conn.execute(
                &format!("UPDATE {} SET state = ?1 WHERE id = ?2", quote_ident(&names.master)),
                rusqlite::params![new_state.as_str(), row_id],
            )?;
        }

        report.files_uploaded += self.upload_pending(definition, names, &attachment_cols, &manifest_by_name)?;
        Ok(report)
    }

    fn upload_pending(
        &self,
        definition: &TableDefinition,
        names: &TableNames,
        attachment_cols: &[&crate::definition::ColumnDef],
        manifest_by_name: &std::collections::BTreeMap<&str, &ServerFile>,
    ) -> Result<usize> {
        let col_list = attachment_cols
            .iter()
            .map(|c| quote_ident(&c.element_key))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, {cols} FROM {t} WHERE state IN (?1, ?2)",
            cols = col_list,
            t = quote_ident(&names.master)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<(String, Vec<Option<String>>)> = stmt
            .query_map([RowState::New.as_str(), RowState::Modified.as_str()], |r| {
                let id: String = r.get(0)?;
                let mut values = Vec::with_capacity(attachment_cols.len());
                for i in 0..attachment_cols.len() {
                    values.push(r.get(1 + i)?);
                }
                Ok((id, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut uploaded = 0;
        for (row_id, values) in rows {
            for value in values.into_iter().flatten() {
                let filename = Path::new(&value)
                    .file_name()
                    .and_then(|f| f.to_str())
                    .unwrap_or(&value)
                    .to_string();
                let local_md5 = match self.store.md5(&definition.table_id, &row_id, &filename)? {
                    Some(md5) => md5,
                    None => continue,
                };
                if manifest_by_name
                    .get(filename.as_str())
                    .and_then(|entry| entry.md5hash.as_deref())
                    == Some(local_md5.as_str())
                {
                    continue;
                }
                if let Some(bytes) = self.store.read(&definition.table_id, &row_id, &filename)? {
                    self.remote.upload(&definition.table_id, &row_id, &filename, &bytes)?;
                    uploaded += 1;
                }
            }
        }
        Ok(uploaded)
    }
}

impl<'c, M: RemoteMeta> AttachmentSyncer for AttachmentSubSync<'c, M> {
    fn sync_attachments_for_table(&self, definition: &TableDefinition, names: &TableNames) -> Result<()> {
        self.sync_table(definition, names)?;
        Ok(())
    }
}
