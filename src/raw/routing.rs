//! Routing specifications.
//!
//! A routing spec tells the builder where each stream identity ends up. It is usually
//! written as JSON, keyed by identity:
//!
//! ```json
//! {
//!   "0-3":    {"destination": "out/geds.raw", "group": "geds", "capacity": 4096},
//!   "7":      {"destination": "out/spms.raw", "group": "spm_{key}"},
//!   "status": {"destination": "out/aux.raw"},
//!   "*":      {"discard": true}
//! }
//! ```
//!
//! Keys are an integer identity, an inclusive integer range `lo-hi`, a named identity or
//! `*` for everything not listed. All entry fields are optional.

use crate::error::{RawError, RawResult};
use crate::raw::key::StreamKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Which identities a routing entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// A single identity.
    Key(StreamKey),
    /// Inclusive range of integer identities.
    Range(i64, i64),
    /// Every identity without an explicit entry.
    Any,
}

impl KeySelector {
    /// Parses `*`, an inclusive range `lo-hi`, or a single identity.
    pub fn parse(s: &str) -> RawResult<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(KeySelector::Any);
        }
        if let Some((lo, hi)) = s.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<i64>(), hi.trim().parse::<i64>()) {
                if lo > hi {
                    return Err(RawError::Configuration(format!(
                        "routing key '{s}' is an empty range"
                    )));
                }
                return Ok(KeySelector::Range(lo, hi));
            }
        }
        if s.is_empty() {
            return Err(RawError::Configuration("empty routing key".into()));
        }
        Ok(KeySelector::Key(StreamKey::parse(s)))
    }

    /// Whether `key` is selected.
    pub fn matches(&self, key: &StreamKey) -> bool {
        match (self, key) {
            (KeySelector::Any, _) => true,
            (KeySelector::Key(k), key) => k == key,
            (KeySelector::Range(lo, hi), StreamKey::Int(n)) => lo <= n && n <= hi,
            (KeySelector::Range(..), StreamKey::Name(_)) => false,
        }
    }

    /// True when some identity would be claimed by both selectors.
    pub fn overlaps(&self, other: &KeySelector) -> bool {
        use KeySelector::*;
        match (self, other) {
            (Any, Any) => true,
            (Any, _) | (_, Any) => false,
            (Key(a), b) | (b, Key(a)) => b.matches(a),
            (Range(a0, a1), Range(b0, b1)) => a0 <= b1 && b0 <= a1,
        }
    }
}

impl fmt::Display for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySelector::Key(k) => write!(f, "{k}"),
            KeySelector::Range(lo, hi) => write!(f, "{lo}-{hi}"),
            KeySelector::Any => f.write_str("*"),
        }
    }
}

/// Destination settings for one routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    /// Output store. Defaults to the run's default output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    /// Group name; `{key}` expands to the identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Buffer capacity in rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// Decode but do not write.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discard: bool,
}

/// Parsed routing specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSpec {
    entries: Vec<(KeySelector, RouteEntry)>,
}

impl RoutingSpec {
    /// Empty spec: every identity goes to the default output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Overlaps are reported when the library is built.
    pub fn route(mut self, selector: KeySelector, entry: RouteEntry) -> Self {
        self.entries.push((selector, entry));
        self
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[(KeySelector, RouteEntry)] {
        &self.entries
    }

    /// Whether the spec has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the JSON shorthand `{"<key>": {destination, group, capacity, discard}}`.
    pub fn from_json_value(value: &serde_json::Value) -> RawResult<Self> {
        let map: BTreeMap<String, RouteEntry> = serde_json::from_value(value.clone())?;
        let mut spec = RoutingSpec::new();
        for (key, entry) in map {
            spec.entries.push((KeySelector::parse(&key)?, entry));
        }
        Ok(spec)
    }

    /// Parses the JSON shorthand from text.
    ///
    /// # Examples
    ///
    /// ```
    /// use daq_raw::raw::RoutingSpec;
    ///
    /// let spec = RoutingSpec::from_json_str(r#"{"0-3": {"group": "geds"}, "*": {"discard": true}}"#)?;
    /// assert_eq!(spec.entries().len(), 2);
    /// # Ok::<(), daq_raw::RawError>(())
    /// ```
    pub fn from_json_str(text: &str) -> RawResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_json_value(&value)
    }

    /// Reads a JSON routing spec from `path`.
    pub fn from_file(path: &Path) -> RawResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RawError::Configuration(format!(
                "cannot read routing spec {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&text)
    }

    /// Serializes back to the JSON shorthand.
    pub fn to_json_value(&self) -> RawResult<serde_json::Value> {
        let map: BTreeMap<String, &RouteEntry> = self
            .entries
            .iter()
            .map(|(sel, entry)| (sel.to_string(), entry))
            .collect();
        Ok(serde_json::to_value(map)?)
    }
}
