//! Validated router identifiers.
//!
//! Queue names and mangle-rule comments travel verbatim into REST query
//! strings and SSH command templates. The charset whitelist here is the only
//! escaping layer — anything that passes it is safe to embed in a quoted
//! command argument, so backends never hand-escape.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {0:?} contains a character outside [A-Za-z0-9_.- ]")]
    ForbiddenCharacter(String),
}

/// Whether `s` matches `^[A-Za-z0-9_.\- ]+$`.
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' '))
}

fn validate(s: String) -> Result<String, NameError> {
    if s.is_empty() {
        Err(NameError::Empty)
    } else if !is_valid_identifier(&s) {
        Err(NameError::ForbiddenCharacter(s))
    } else {
        Ok(s)
    }
}

/// A shaper queue name, as known to the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Result<Self, NameError> {
        validate(s.into()).map(QueueName)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, NameError> {
        QueueName::new(s)
    }
}

impl From<QueueName> for String {
    fn from(q: QueueName) -> String {
        q.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The comment identifying a mangle-style routing rule on the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleComment(String);

impl RuleComment {
    pub fn new(s: impl Into<String>) -> Result<Self, NameError> {
        validate(s.into()).map(RuleComment)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RuleComment {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, NameError> {
        RuleComment::new(s)
    }
}

impl From<RuleComment> for String {
    fn from(c: RuleComment) -> String {
        c.0
    }
}

impl fmt::Display for RuleComment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Charset ────────────────────────────────────────────────────────

    #[test]
    fn accepts_typical_names() {
        assert!(is_valid_identifier("wan1-download"));
        assert!(is_valid_identifier("voip steer v2"));
        assert!(is_valid_identifier("cake.ingress_0"));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in ["a;b", "a\"b", "a'b", "a$(x)", "a|b", "a\nb", "a/b"] {
            assert!(!is_valid_identifier(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(QueueName::new(""), Err(NameError::Empty));
    }

    #[test]
    fn forbidden_character_error_carries_input() {
        let err = RuleComment::new("steer;drop").unwrap_err();
        assert_eq!(err, NameError::ForbiddenCharacter("steer;drop".into()));
    }

    // ─── Serde ──────────────────────────────────────────────────────────

    #[test]
    fn deserialization_validates() {
        let ok: Result<QueueName, _> = serde_json::from_str("\"wan1-down\"");
        assert!(ok.is_ok());
        let bad: Result<QueueName, _> = serde_json::from_str("\"wan1;down\"");
        assert!(bad.is_err());
    }

    #[test]
    fn round_trips_as_plain_string() {
        let q = QueueName::new("wan1-down").unwrap();
        let json = serde_json::to_string(&q).unwrap();
        assert_eq!(json, "\"wan1-down\"");
    }
}
