//! Keyed last-write-wins reduction used to turn property lists into maps.
//!
//! This is not a grouping: when two records share a normalized key, only the
//! one seen last survives and every earlier record is dropped.

use std::collections::BTreeMap;

pub fn normalize_key(key: &str) -> String {
    key.chars().filter(|c| *c != '.').collect()
}

pub fn collapse_last_by_key<T, I, F, E>(records: I, key_of: F) -> Result<BTreeMap<String, T>, E>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> Result<&str, E>,
{
    let mut collapsed = BTreeMap::new();
    for record in records {
        let key = normalize_key(key_of(&record)?);
        collapsed.insert(key, record);
    }
    Ok(collapsed)
}
