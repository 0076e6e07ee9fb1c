//! Ordered, case-insensitively keyed parameter bags.
//!
//! Zones carry two of these (source-element and host-element attributes),
//! persisted as JSON text. Key comparison is case-insensitive and
//! last-write-wins; insertion order is preserved because snapshot
//! aggregation of size-like keys depends on per-zone ordering.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClashError, ClashResult};

/// An ordered string-to-string mapping with case-insensitive keys.
///
/// The first spelling of a key wins for display; later writes under any
/// casing replace the value in place without reordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamBag {
    entries: Vec<(String, String)>,
}

impl ParamBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a value. Returns the previous value if the key
    /// (compared case-insensitively) was already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        for (existing_key, existing_value) in &mut self.entries {
            if existing_key.eq_ignore_ascii_case(&key) {
                return Some(std::mem::replace(existing_value, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    /// Insert only if the key is absent. Used when refreshing a bag from
    /// the authoritative row: present keys are never overwritten.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge every entry of `other` that is absent from `self`.
    pub fn merge_absent(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.insert_if_absent(key, value);
        }
    }

    /// Serialize to a JSON object string, preserving entry order.
    pub fn to_json(&self) -> ClashResult<String> {
        let mut map = Map::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        serde_json::to_string(&Value::Object(map)).map_err(ClashError::storage)
    }

    /// Parse from a JSON object string. `null` and the empty string parse
    /// as an empty bag; non-string values are rendered with `to_string`.
    pub fn from_json(text: &str) -> ClashResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::new());
        }
        let value: Value = serde_json::from_str(trimmed).map_err(ClashError::storage)?;
        let Value::Object(map) = value else {
            return Err(ClashError::validation(
                "param_bag",
                "expected a JSON object of string values",
            ));
        };
        let mut bag = Self::new();
        for (key, value) in map {
            let rendered = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            bag.insert(key, rendered);
        }
        Ok(bag)
    }
}

impl FromIterator<(String, String)> for ParamBag {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut bag = Self::new();
        for (key, value) in iter {
            bag.insert(key, value);
        }
        bag
    }
}
