//! Deterministic row hashing for the external-source reconciler (§4.3).
//!
//! A row's hash is computed over its materialized columns in a fixed
//! order (`element_key` ascending) so the same logical row always hashes
//! identically regardless of the order its fields were read from the
//! external source. Grounded on `odkx_local_table.py`'s row-hash helper
//! used to tell new/modified/unchanged external rows apart.

use md5::{Digest, Md5};

/// Hash a row's materialized column values. `columns` must already be
/// sorted by key (callers pass `TableDefinition::materialized_columns`,
/// which is in `orderedColumns` order — for stable hashing this function
/// sorts a local copy by `element_key` regardless of input order).
pub fn hash_row<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut pairs: Vec<(&str, Option<&str>)> = fields.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Md5::new();
    for (key, value) in pairs {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.unwrap_or("").as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_independent_of_input_order() {
        let a = hash_row(vec![("name", Some("Alice")), ("age", Some("30"))]);
        let b = hash_row(vec![("age", Some("30")), ("name", Some("Alice"))]);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_and_empty_value_hash_identically() {
        let a = hash_row(vec![("name", Some(""))]);
        let b = hash_row(vec![("name", None)]);
        assert_eq!(a, b, "empty string and absent value hash identically by design");
    }

    #[test]
    fn hash_changes_with_value() {
        let a = hash_row(vec![("name", Some("Alice"))]);
        let b = hash_row(vec![("name", Some("Bob"))]);
        assert_ne!(a, b);
    }
}
