//! Manifest cache (§4.7).
//!
//! Form and table-level file manifests (the lists of `ServerFile` entries
//! backing attachment sub-sync, §4.8) are fetched by etag and cached
//! locally so unchanged manifests don't need to be re-downloaded on every
//! sync cycle. A form manifest's entries aren't all opaque attachment
//! bytes, though: two filenames carry metadata the sync layer consults
//! directly rather than just storing for later rendering —
//! `formDef.json` (the form's structural definition: `xlsx`,
//! `specification`, `form_id`, `instance_name`) and any file ending in
//! `properties.csv` (a `survey_formId` the form declares for itself).
//! Those get decomposed and cached by the file's `md5hash` rather than
//! re-parsed on every sync where the hash hasn't moved. Grounded on
//! `odkx_manifest_cache.py`'s keyed manifest store and
//! `odkx_server_file.py`'s recognition of `formDef.json`/`*properties.csv`
//! among a form's manifest entries.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ident::{quote_ident, validate_ident_component};
use crate::types::ServerFile;

/// Which manifest this cache entry holds: a whole-table file listing, or
/// the file listing scoped to one form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManifestKind {
    Table,
    Form(String),
}

impl ManifestKind {
    fn key_suffix(&self) -> String {
        match self {
            ManifestKind::Table => "table".to_string(),
            ManifestKind::Form(form_id) => format!("form:{form_id}"),
        }
    }
}

/// The form's structural definition, decomposed out of `formDef.json`
/// (§4.7). Fields the file doesn't carry are left `None` rather than
/// failing the whole decomposition — servers have shipped `formDef.json`
/// variants missing one or another of these over the protocol's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDef {
    pub xlsx: Option<String>,
    pub specification: Option<String>,
    pub form_id: Option<String>,
    pub instance_name: Option<String>,
}

/// Metadata decomposed from one of the two recognized manifest filenames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecognizedFile {
    FormDef(FormDef),
    /// `*properties.csv`: `survey_formId` is the one field the sync layer
    /// actually needs out of it; the rest of the file is left alone (full
    /// rendering of form properties is out of scope here).
    Properties { survey_form_id: Option<String> },
}

/// Whether `filename` is one of the two recognized shapes (§4.7). Returns
/// `None` for anything else — an ordinary attachment file, handled solely
/// through MD5 comparison.
pub fn recognize_filename(filename: &str) -> Option<RecognizedFileKind> {
    if filename == "formDef.json" {
        Some(RecognizedFileKind::FormDef)
    } else if filename.ends_with("properties.csv") {
        Some(RecognizedFileKind::Properties)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizedFileKind {
    FormDef,
    Properties,
}

/// Decompose a recognized file's bytes per its kind (§4.7). The caller is
/// expected to have already matched `filename` via [`recognize_filename`].
pub fn decompose(kind: RecognizedFileKind, bytes: &[u8]) -> Result<RecognizedFile> {
    match kind {
        RecognizedFileKind::FormDef => Ok(RecognizedFile::FormDef(decompose_form_def(bytes)?)),
        RecognizedFileKind::Properties => Ok(RecognizedFile::Properties {
            survey_form_id: decompose_properties_csv(bytes),
        }),
    }
}

fn decompose_form_def(bytes: &[u8]) -> Result<FormDef> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let field = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| value.get(k))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    Ok(FormDef {
        xlsx: field(&["xlsx"]),
        specification: field(&["specification"]),
        form_id: field(&["form_id", "formId"]),
        instance_name: field(&["instance_name", "instanceName"]),
    })
}

/// `properties.csv` is a plain two-row CSV (header, then one data row) in
/// every server build observed; a full CSV parser is unwarranted for
/// extracting the single column this layer cares about.
fn decompose_properties_csv(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    let header = lines.next()?;
    let data = lines.next()?;
    let headers: Vec<&str> = header.split(',').map(str::trim).collect();
    let values: Vec<&str> = data.split(',').map(str::trim).collect();
    headers
        .iter()
        .position(|h| *h == "survey_formId")
        .and_then(|idx| values.get(idx))
        .map(|s| s.to_string())
}

pub struct ManifestCache<'c> {
    conn: &'c Connection,
    table: String,
    recognized_table: String,
}

impl<'c> ManifestCache<'c> {
    pub fn new(conn: &'c Connection, schema: &str) -> Result<Self> {
        validate_ident_component(schema)?;
        let table = format!("{schema}_odkxpy_cached_manifest");
        let recognized_table = format!("{schema}_odkxpy_cached_form_metadata");
        let cache = ManifestCache { conn, table, recognized_table };
        cache.ensure_table()?;
        cache.ensure_recognized_table()?;
        Ok(cache)
    }

    fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (cache_key TEXT NOT NULL, etag TEXT NOT NULL, manifest TEXT NOT NULL, PRIMARY KEY (cache_key))",
            quote_ident(&self.table)
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn ensure_recognized_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (cache_key TEXT NOT NULL, md5hash TEXT NOT NULL, metadata TEXT NOT NULL, PRIMARY KEY (cache_key))",
            quote_ident(&self.recognized_table)
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn cache_key(table_id: &str, kind: &ManifestKind) -> String {
        format!("{table_id}:{}", kind.key_suffix())
    }

    /// Returns the cached manifest only if `etag` still matches what the
    /// server last reported; a mismatch means the caller must refetch.
    pub fn get(
        &self,
        table_id: &str,
        kind: &ManifestKind,
        etag: &str,
    ) -> Result<Option<Vec<ServerFile>>> {
        let key = Self::cache_key(table_id, kind);
        let sql = format!(
            "SELECT etag, manifest FROM {} WHERE cache_key = ?1",
            quote_ident(&self.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let row: Option<(String, String)> = stmt
            .query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        match row {
            Some((cached_etag, json)) if cached_etag == etag => {
                Ok(Some(serde_json::from_str(&json)?))
            }
            _ => Ok(None),
        }
    }

    pub fn put(
        &self,
        table_id: &str,
        kind: &ManifestKind,
        etag: &str,
        files: &[ServerFile],
    ) -> Result<()> {
        let key = Self::cache_key(table_id, kind);
        let json = serde_json::to_string(files)?;
        let sql = format!(
            "INSERT INTO {t} (cache_key, etag, manifest) VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET etag = excluded.etag, manifest = excluded.manifest",
            t = quote_ident(&self.table)
        );
        self.conn.execute(&sql, params![key, etag, json])?;
        Ok(())
    }

    pub fn invalidate(&self, table_id: &str, kind: &ManifestKind) -> Result<()> {
        let key = Self::cache_key(table_id, kind);
        let sql = format!("DELETE FROM {} WHERE cache_key = ?1", quote_ident(&self.table));
        self.conn.execute(&sql, params![key])?;
        Ok(())
    }

    /// The cached decomposition of `filename` (a `formDef.json` or
    /// `*properties.csv` entry from `table_id`'s manifest), refetched and
    /// redecomposed only when `md5hash` doesn't match what's cached.
    /// Returns `None` for a filename [`recognize_filename`] doesn't know.
    pub fn recognized_file(
        &self,
        table_id: &str,
        filename: &str,
        md5hash: &str,
        fetch: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<Option<RecognizedFile>> {
        let kind = match recognize_filename(filename) {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let key = format!("{table_id}:{filename}");
        let sql = format!(
            "SELECT md5hash, metadata FROM {} WHERE cache_key = ?1",
            quote_ident(&self.recognized_table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let cached: Option<(String, String)> = stmt
            .query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        drop(stmt);

        if let Some((cached_md5, json)) = &cached {
            if cached_md5 == md5hash {
                return Ok(Some(serde_json::from_str(json)?));
            }
        }

        let bytes = fetch()?;
        let recognized = decompose(kind, &bytes)?;
        let json = serde_json::to_string(&recognized)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {t} (cache_key, md5hash, metadata) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cache_key) DO UPDATE SET md5hash = excluded.md5hash, metadata = excluded.metadata",
                t = quote_ident(&self.recognized_table)
            ),
            params![key, md5hash, json],
        )?;
        Ok(Some(recognized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> ServerFile {
        ServerFile {
            filename: name.to_string(),
            content_length: Some(10),
            content_type: Some("image/png".to_string()),
            md5hash: Some("abc".to_string()),
            download_url: Some("https://example.test/f".to_string()),
        }
    }

    #[test]
    fn table_and_form_manifests_are_independent() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = ManifestCache::new(&conn, "main").unwrap();
        cache
            .put("trips", &ManifestKind::Table, "e1", &[file("a.png")])
            .unwrap();
        cache
            .put("trips", &ManifestKind::Form("f1".into()), "e2", &[file("b.png")])
            .unwrap();

        let table_manifest = cache.get("trips", &ManifestKind::Table, "e1").unwrap().unwrap();
        assert_eq!(table_manifest[0].filename, "a.png");

        let form_manifest = cache
            .get("trips", &ManifestKind::Form("f1".into()), "e2")
            .unwrap()
            .unwrap();
        assert_eq!(form_manifest[0].filename, "b.png");
    }

    #[test]
    fn etag_mismatch_misses() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = ManifestCache::new(&conn, "main").unwrap();
        cache
            .put("trips", &ManifestKind::Table, "e1", &[file("a.png")])
            .unwrap();
        assert!(cache.get("trips", &ManifestKind::Table, "e2").unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_only_named_entry() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = ManifestCache::new(&conn, "main").unwrap();
        cache
            .put("trips", &ManifestKind::Table, "e1", &[file("a.png")])
            .unwrap();
        cache
            .put("trips", &ManifestKind::Form("f1".into()), "e2", &[file("b.png")])
            .unwrap();
        cache.invalidate("trips", &ManifestKind::Table).unwrap();
        assert!(cache.get("trips", &ManifestKind::Table, "e1").unwrap().is_none());
        assert!(cache
            .get("trips", &ManifestKind::Form("f1".into()), "e2")
            .unwrap()
            .is_some());
    }

    #[test]
    fn recognizes_form_def_and_properties_csv_only() {
        assert_eq!(recognize_filename("formDef.json"), Some(RecognizedFileKind::FormDef));
        assert_eq!(recognize_filename("survey_properties.csv"), Some(RecognizedFileKind::Properties));
        assert_eq!(recognize_filename("properties.csv"), Some(RecognizedFileKind::Properties));
        assert_eq!(recognize_filename("photo.png"), None);
    }

    #[test]
    fn decomposes_form_def_json() {
        let bytes = br#"{"xlsx": "survey.xlsx", "specification": "1.0", "form_id": "survey", "instance_name": "concat(${a})"}"#;
        let decomposed = decompose(RecognizedFileKind::FormDef, bytes).unwrap();
        assert_eq!(
            decomposed,
            RecognizedFile::FormDef(FormDef {
                xlsx: Some("survey.xlsx".to_string()),
                specification: Some("1.0".to_string()),
                form_id: Some("survey".to_string()),
                instance_name: Some("concat(${a})".to_string()),
            })
        );
    }

    #[test]
    fn decomposes_properties_csv() {
        let bytes = b"survey_formId,other_col\nsurvey1,x\n";
        let decomposed = decompose(RecognizedFileKind::Properties, bytes).unwrap();
        assert_eq!(decomposed, RecognizedFile::Properties { survey_form_id: Some("survey1".to_string()) });
    }

    #[test]
    fn recognized_file_is_cached_by_md5_and_not_refetched_when_unchanged() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = ManifestCache::new(&conn, "main").unwrap();
        let mut fetch_calls = 0;

        let bytes = b"survey_formId,other_col\nsurvey1,x\n".to_vec();
        let result = cache
            .recognized_file("trips", "properties.csv", "md5-a", || {
                fetch_calls += 1;
                Ok(bytes.clone())
            })
            .unwrap();
        assert_eq!(result, Some(RecognizedFile::Properties { survey_form_id: Some("survey1".to_string()) }));
        assert_eq!(fetch_calls, 1);

        let result = cache
            .recognized_file("trips", "properties.csv", "md5-a", || {
                fetch_calls += 1;
                Ok(bytes.clone())
            })
            .unwrap();
        assert_eq!(result, Some(RecognizedFile::Properties { survey_form_id: Some("survey1".to_string()) }));
        assert_eq!(fetch_calls, 1, "matching md5hash must skip refetching and redecomposing");
    }

    #[test]
    fn recognized_file_refetches_when_md5_changes() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = ManifestCache::new(&conn, "main").unwrap();
        cache
            .recognized_file("trips", "properties.csv", "md5-a", || Ok(b"survey_formId\nsurvey1\n".to_vec()))
            .unwrap();
        let result = cache
            .recognized_file("trips", "properties.csv", "md5-b", || Ok(b"survey_formId\nsurvey2\n".to_vec()))
            .unwrap();
        assert_eq!(result, Some(RecognizedFile::Properties { survey_form_id: Some("survey2".to_string()) }));
    }

    #[test]
    fn unrecognized_filename_returns_none_without_fetching() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = ManifestCache::new(&conn, "main").unwrap();
        let result = cache
            .recognized_file("trips", "photo.png", "md5-a", || panic!("must not fetch an unrecognized filename"))
            .unwrap();
        assert_eq!(result, None);
    }
}
