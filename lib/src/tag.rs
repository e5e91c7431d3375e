//! Typed unit identifiers: `(kind, id)` pairs formatted as `kind:id`, or bare
//! `id` when `kind` is the standard/default kind.
//!
//! Grounded in `examples/original_source/utils.go`'s `ParseTag`/`MakeTag`
//! pair, generalized from stringly-typed `(string, string)` into an enum.

use std::fmt;
use std::str::FromStr;

/// The three unit kinds a [`Tag`] can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// A standard (cross-compiled distribution) target. Renders with no prefix.
    Standard,
    /// A host-side build tool.
    Host,
    /// A fetchable source unit.
    Source,
}

impl TagKind {
    fn prefix(self) -> Option<&'static str> {
        match self {
            TagKind::Standard => None,
            TagKind::Host => Some("host"),
            TagKind::Source => Some("source"),
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "host" => Some(TagKind::Host),
            "source" => Some(TagKind::Source),
            _ => None,
        }
    }
}

/// A typed identifier naming a unit: a source, host target, or standard
/// target. Equality and hashing are by the `(kind, id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub kind: TagKind,
    pub id: String,
}

/// `id` must match this grammar (spec.md §3.1 / §6).
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
}

#[derive(Debug, thiserror::Error)]
pub enum TagParseError {
    #[error("tag id {0:?} does not match ^[a-z-0-9]+$")]
    InvalidId(String),
}

impl Tag {
    pub fn standard(id: impl Into<String>) -> Self {
        Self {
            kind: TagKind::Standard,
            id: id.into(),
        }
    }

    pub fn host(id: impl Into<String>) -> Self {
        Self {
            kind: TagKind::Host,
            id: id.into(),
        }
    }

    pub fn source(id: impl Into<String>) -> Self {
        Self {
            kind: TagKind::Source,
            id: id.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.prefix() {
            Some(prefix) => write!(f, "{prefix}:{}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for Tag {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = match s.split_once(':') {
            Some((prefix, id)) => (
                TagKind::from_prefix(prefix).unwrap_or(TagKind::Standard),
                id,
            ),
            None => (TagKind::Standard, s),
        };
        if !is_valid_id(id) {
            return Err(TagParseError::InvalidId(id.to_string()));
        }
        Ok(Tag {
            kind,
            id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for s in ["hello", "host:cmake", "source:app-src", "my-pkg-2"] {
            let tag: Tag = s.parse().unwrap();
            assert_eq!(tag.to_string(), s);
        }
    }

    #[test]
    fn test_rejects_bad_ids() {
        for s in ["Hello", "host:UP", "under_score", "", "host:"] {
            assert!(s.parse::<Tag>().is_err(), "expected {s:?} to be rejected");
        }
    }

    #[test]
    fn test_equality_by_pair() {
        assert_eq!(Tag::standard("a"), Tag::standard("a"));
        assert_ne!(Tag::standard("a"), Tag::host("a"));
    }
}
