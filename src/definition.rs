//! Table column definitions.
//!
//! A server table's columns form a tree (nested `array`/`group` structural
//! columns have children). Rather than represent that tree with shared heap
//! cells (`Rc<RefCell<_>>`), we use an arena: columns are nodes addressed by
//! integer id, with `parent`/`children` as plain id lists. This mirrors the
//! Python original's `OdkxServerColumnDefinition` linked via object
//! references, but serializes cleanly as `{elementKey, parentKey, childKeys}`.
//!
//! Grounded on `odkx_server_table.py::OdkxServerColumnDefinition` /
//! `OdkxServerTableDefinition`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// The element's physical category, as declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    String,
    Number,
    Integer,
    MimeType,
    Rowpath,
    Array,
    /// Anything else the server sends (e.g. a structural `group`).
    Other,
}

impl ElementType {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "string" => ElementType::String,
            "number" => ElementType::Number,
            "integer" => ElementType::Integer,
            "mimeType" => ElementType::MimeType,
            "rowpath" => ElementType::Rowpath,
            "array" => ElementType::Array,
            _ => ElementType::Other,
        }
    }

    /// The SQLite column affinity this type maps to (§4.1).
    pub fn sql_type(self) -> &'static str {
        match self {
            ElementType::String => "TEXT",
            ElementType::Number => "REAL",
            ElementType::Integer => "INTEGER",
            ElementType::MimeType => "TEXT",
            ElementType::Rowpath => "TEXT",
            ElementType::Array => "TEXT", // JSON document, stored as text
            ElementType::Other => "TEXT",
        }
    }
}

pub type ColumnId = usize;

/// A single column node in the definition arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub element_key: String,
    pub element_name: String,
    pub element_type: ElementType,
    pub parent: Option<ColumnId>,
    pub children: Vec<ColumnId>,
    pub properties: BTreeMap<String, String>,
}

impl ColumnDef {
    /// A column is materialized (i.e. becomes a physical attribute) when it
    /// has no parent-of-type-array, and either has no children or is itself
    /// of type `array` (§3).
    pub fn is_materialized(&self, arena: &ColumnArena) -> bool {
        if let Some(parent_id) = self.parent {
            if arena.get(parent_id).element_type == ElementType::Array {
                return false;
            }
        }
        if !self.children.is_empty() {
            return self.element_type == ElementType::Array;
        }
        true
    }
}

/// A full table definition: ordered columns forming an arena-backed tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_id: String,
    pub schema_etag: String,
    pub columns: ColumnArena,
    /// The order columns appear in the server's `orderedColumns` list,
    /// referenced by element key (stable across arena rebuilds).
    pub ordered_keys: Vec<String>,
}

/// Arena of [`ColumnDef`] nodes, addressed by integer id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnArena {
    nodes: Vec<ColumnDef>,
    by_key: BTreeMap<String, ColumnId>,
}

impl ColumnArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ColumnId) -> &ColumnDef {
        &self.nodes[id]
    }

    pub fn get_by_key(&self, key: &str) -> Option<&ColumnDef> {
        self.by_key.get(key).map(|&id| &self.nodes[id])
    }

    pub fn insert(&mut self, col: ColumnDef) -> ColumnId {
        let id = self.nodes.len();
        self.by_key.insert(col.element_key.clone(), id);
        self.nodes.push(col);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnDef> {
        self.nodes.iter()
    }
}

impl TableDefinition {
    /// Materialized columns, in `ordered_keys` order.
    pub fn materialized_columns(&self) -> Vec<&ColumnDef> {
        self.ordered_keys
            .iter()
            .filter_map(|k| self.columns.get_by_key(k))
            .filter(|c| c.is_materialized(&self.columns))
            .collect()
    }

    /// Materialized columns whose `elementType` is `rowpath`, i.e. file
    /// reference attachment columns (§4.8).
    pub fn attachment_columns(&self) -> Vec<&ColumnDef> {
        self.materialized_columns()
            .into_iter()
            .filter(|c| c.element_type == ElementType::Rowpath)
            .collect()
    }

    pub fn column_keys(&self) -> Vec<String> {
        self.materialized_columns()
            .into_iter()
            .map(|c| c.element_key.clone())
            .collect()
    }

    /// Fails with `UnknownColumn` if `wanted` contains a key this definition
    /// does not materialize (§4.1, external-source provisioning).
    pub fn validate_subset(&self, wanted: &[String]) -> Result<()> {
        let known: BTreeMap<&str, ()> = self
            .materialized_columns()
            .into_iter()
            .map(|c| (c.element_key.as_str(), ()))
            .collect();
        for col in wanted {
            if !known.contains_key(col.as_str()) {
                return Err(SyncError::UnknownColumn(col.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_definition() -> TableDefinition {
        let mut arena = ColumnArena::new();
        let a = arena.insert(ColumnDef {
            element_key: "name".into(),
            element_name: "name".into(),
            element_type: ElementType::String,
            parent: None,
            children: vec![],
            properties: BTreeMap::new(),
        });
        let _ = a;
        TableDefinition {
            table_id: "trips".into(),
            schema_etag: "e1".into(),
            columns: arena,
            ordered_keys: vec!["name".into()],
        }
    }

    #[test]
    fn materialized_leaf_column() {
        let def = simple_definition();
        let cols = def.materialized_columns();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].element_key, "name");
    }

    #[test]
    fn array_parent_hides_children() {
        let mut arena = ColumnArena::new();
        let parent_id = arena.insert(ColumnDef {
            element_key: "tags".into(),
            element_name: "tags".into(),
            element_type: ElementType::Array,
            parent: None,
            children: vec![1],
            properties: BTreeMap::new(),
        });
        arena.insert(ColumnDef {
            element_key: "tags_item".into(),
            element_name: "item".into(),
            element_type: ElementType::String,
            parent: Some(parent_id),
            children: vec![],
            properties: BTreeMap::new(),
        });
        let def = TableDefinition {
            table_id: "t".into(),
            schema_etag: "e".into(),
            columns: arena,
            ordered_keys: vec!["tags".into(), "tags_item".into()],
        };
        let keys: Vec<_> = def
            .materialized_columns()
            .into_iter()
            .map(|c| c.element_key.clone())
            .collect();
        assert_eq!(keys, vec!["tags"]);
    }

    #[test]
    fn group_with_children_not_materialized() {
        let mut arena = ColumnArena::new();
        let parent_id = arena.insert(ColumnDef {
            element_key: "geo".into(),
            element_name: "geo".into(),
            element_type: ElementType::Other,
            parent: None,
            children: vec![1],
            properties: BTreeMap::new(),
        });
        arena.insert(ColumnDef {
            element_key: "geo_lat".into(),
            element_name: "lat".into(),
            element_type: ElementType::Number,
            parent: Some(parent_id),
            children: vec![],
            properties: BTreeMap::new(),
        });
        let def = TableDefinition {
            table_id: "t".into(),
            schema_etag: "e".into(),
            columns: arena,
            ordered_keys: vec!["geo".into(), "geo_lat".into()],
        };
        let keys: Vec<_> = def
            .materialized_columns()
            .into_iter()
            .map(|c| c.element_key.clone())
            .collect();
        assert_eq!(keys, vec!["geo_lat"]);
    }

    #[test]
    fn unknown_column_rejected() {
        let def = simple_definition();
        assert!(def.validate_subset(&["name".to_string()]).is_ok());
        assert!(matches!(
            def.validate_subset(&["bogus".to_string()]),
            Err(SyncError::UnknownColumn(_))
        ));
    }
}
