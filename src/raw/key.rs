//! Stream identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical sub-stream within a physical input.
///
/// Hardware channels are integers; decoder-level streams (status words, header
/// blocks) are named.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamKey {
    /// Numeric identity, usually a hardware channel.
    Int(i64),
    /// Named identity, usually a decoder stream.
    Name(String),
}

impl StreamKey {
    /// Parses a routing key. Strings that read as integers become [`StreamKey::Int`].
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(n) => StreamKey::Int(n),
            Err(_) => StreamKey::Name(s.trim().to_string()),
        }
    }

    /// Group name used when a route does not name one.
    pub fn default_group(&self) -> String {
        match self {
            StreamKey::Int(n) => format!("ch{n}"),
            StreamKey::Name(s) => s.clone(),
        }
    }

    /// Expands `{key}` in a group template.
    pub fn expand(&self, template: &str) -> String {
        template.replace("{key}", &self.to_string())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::Int(n) => write!(f, "{n}"),
            StreamKey::Name(s) => f.write_str(s),
        }
    }
}

impl From<i64> for StreamKey {
    fn from(value: i64) -> Self {
        StreamKey::Int(value)
    }
}

impl From<u16> for StreamKey {
    fn from(value: u16) -> Self {
        StreamKey::Int(i64::from(value))
    }
}

impl From<&str> for StreamKey {
    fn from(value: &str) -> Self {
        StreamKey::Name(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_named_keys() {
        assert_eq!(StreamKey::parse("12"), StreamKey::Int(12));
        assert_eq!(StreamKey::parse(" 3 "), StreamKey::Int(3));
        assert_eq!(StreamKey::parse("status"), StreamKey::Name("status".into()));
    }

    #[test]
    fn default_groups() {
        assert_eq!(StreamKey::Int(7).default_group(), "ch7");
        assert_eq!(StreamKey::from("status").default_group(), "status");
    }

    #[test]
    fn expands_group_template() {
        assert_eq!(StreamKey::Int(4).expand("spm_{key}"), "spm_4");
        assert_eq!(StreamKey::Int(4).expand("geds"), "geds");
    }
}
