//! Utility module for serde of types.
//!
//! CSV records cannot hold nested lists, so lists are flattened into a single `;`-separated cell.

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serializer};

/// Serialize a list of strings into a single `;`-separated string.
pub fn serialize_list<S>(list: &[String], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&list.iter().join(";"))
}

/// Deserialize a `;`-separated string into a list of strings. The empty string is the empty list.
pub fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Ok(Vec::new());
    }
    Ok(s.split(';').map(str::to_string).collect())
}
