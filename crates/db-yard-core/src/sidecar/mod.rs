//! Per-file sidecar configuration.
//!
//! A database may carry a `.db-yard` key/value table of heterogeneous
//! scalar and JSON values that override driver selection and spawn
//! parameters. Values are represented as a tagged variant with typed
//! accessors that fall back to defaults on mismatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One sidecar value. Scalars parse eagerly; anything that looks like JSON
/// but fails to parse stays raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SidecarValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Plain string (also the fallback for malformed JSON).
    Text(String),
    /// Structured JSON blob.
    Json(serde_json::Value),
}

impl SidecarValue {
    /// Parse a raw stored string into the closest variant.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        if let Ok(b) = trimmed.parse::<bool>() {
            return Self::Bool(b);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Self::Float(f);
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                return Self::Json(value);
            }
        }
        Self::Text(raw.to_string())
    }

    /// String view; `Text` only.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view with default on mismatch.
    #[must_use]
    pub fn as_bool_or(&self, default: bool) -> bool {
        match self {
            Self::Bool(b) => *b,
            _ => default,
        }
    }

    /// Integer view with default on mismatch.
    #[must_use]
    pub fn as_int_or(&self, default: i64) -> i64 {
        match self {
            Self::Int(i) => *i,
            _ => default,
        }
    }

    /// JSON view; `Json` only.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// The parsed `.db-yard` table of one database file.
///
/// A missing table is an empty config. Keys are dotted
/// (`driver`, `instance.id`, `sqlpage.bin`, `ctx.<name>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Key/value entries in stable order.
    #[serde(flatten)]
    pub entries: BTreeMap<String, SidecarValue>,
}

impl SidecarConfig {
    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SidecarValue> {
        self.entries.get(key)
    }

    /// String value of a key, if present and textual.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(SidecarValue::as_str)
    }

    /// True when no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry, parsing the raw stored value.
    pub fn insert_raw(&mut self, key: impl Into<String>, raw: &str) {
        self.entries.insert(key.into(), SidecarValue::parse(raw));
    }

    /// The driver override, when one is named.
    #[must_use]
    pub fn driver_override(&self) -> Option<&str> {
        self.get_str("driver")
    }

    /// The instance id override, when one is named.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.get_str("instance.id")
    }

    /// Context snapshot queries: every `ctx.<name>` key whose value is SQL
    /// text, in stable key order.
    #[must_use]
    pub fn ctx_queries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix("ctx.")?;
                let sql = value.as_str()?;
                Some((name.to_string(), sql.to_string()))
            })
            .collect()
    }
}
