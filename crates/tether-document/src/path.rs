//! Field paths for addressing values inside a document
//!
//! A [`FieldPath`] is either a concrete location (`models.fallbacks[1]`) or a
//! pattern containing `*` wildcards (`channels.*.token`). Patterns are
//! expanded against a concrete value with [`FieldPath::resolve`].

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde_json::Value;

/// One step in a [`FieldPath`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    /// Object member
    Key(String),
    /// Array element
    Index(usize),
    /// Any object member or array element (patterns only)
    Wildcard,
}

/// Path from the document root to a value
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    /// Root path
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path from segments
    #[inline]
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// Segments from root to leaf
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the root path
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an object key
    #[inline]
    #[must_use]
    pub fn key(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.0.push(Segment::Key(key.into()));
        next
    }

    /// Append an array index
    #[inline]
    #[must_use]
    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.0.push(Segment::Index(index));
        next
    }

    /// Last object key on the path, skipping trailing indices
    ///
    /// `models.fallbacks[2]` → `fallbacks`
    #[must_use]
    pub fn last_key(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|s| match s {
            Segment::Key(k) => Some(k.as_str()),
            _ => None,
        })
    }

    /// First object key (the top-level section)
    #[must_use]
    pub fn first_key(&self) -> Option<&str> {
        match self.0.first() {
            Some(Segment::Key(k)) => Some(k.as_str()),
            _ => None,
        }
    }

    /// True if the path contains wildcards
    #[inline]
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.0.iter().any(|s| matches!(s, Segment::Wildcard))
    }

    /// Check whether a concrete path matches this pattern
    #[must_use]
    pub fn matches(&self, concrete: &FieldPath) -> bool {
        self.0.len() == concrete.0.len()
            && self
                .0
                .iter()
                .zip(&concrete.0)
                .all(|(p, c)| matches!(p, Segment::Wildcard) || p == c)
    }

    /// Look up a concrete path
    #[must_use]
    pub fn lookup<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.0 {
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Expand this pattern against a value, returning every concrete
    /// location it addresses that exists in `root`
    #[must_use]
    pub fn resolve<'v>(&self, root: &'v Value) -> Vec<(FieldPath, &'v Value)> {
        let mut out = Vec::new();
        resolve_into(&self.0, FieldPath::root(), root, &mut out);
        out
    }
}

fn resolve_into<'v>(
    rest: &[Segment],
    at: FieldPath,
    value: &'v Value,
    out: &mut Vec<(FieldPath, &'v Value)>,
) {
    let Some((head, tail)) = rest.split_first() else {
        out.push((at, value));
        return;
    };
    match (head, value) {
        (Segment::Key(k), Value::Object(map)) => {
            if let Some(child) = map.get(k) {
                resolve_into(tail, at.key(k.clone()), child, out);
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(child) = items.get(*i) {
                resolve_into(tail, at.index(*i), child, out);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for (k, child) in map {
                resolve_into(tail, at.key(k.clone()), child, out);
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for (i, child) in items.iter().enumerate() {
                resolve_into(tail, at.index(i), child, out);
            }
        }
        _ => {}
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("$");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Key(k) if i == 0 => write!(f, "{k}")?,
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(idx) => write!(f, "[{idx}]")?,
                Segment::Wildcard if i == 0 => f.write_str("*")?,
                Segment::Wildcard => f.write_str(".*")?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    /// Parse `a.b[0].*` style paths
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "$" {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for part in s.split('.') {
            let (name, mut indices) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            match name {
                "" if indices.is_empty() => return Err(PathError::EmptySegment(s.to_string())),
                "" => {}
                "*" => segments.push(Segment::Wildcard),
                key => segments.push(Segment::Key(key.to_string())),
            }
            while !indices.is_empty() {
                let close = indices
                    .find(']')
                    .ok_or_else(|| PathError::UnclosedIndex(s.to_string()))?;
                let raw = &indices[1..close];
                let segment = if raw == "*" {
                    Segment::Wildcard
                } else {
                    Segment::Index(
                        raw.parse()
                            .map_err(|_| PathError::InvalidIndex(raw.to_string()))?,
                    )
                };
                segments.push(segment);
                indices = &indices[close + 1..];
                if !indices.is_empty() && !indices.starts_with('[') {
                    return Err(PathError::UnclosedIndex(s.to_string()));
                }
            }
        }
        Ok(Self(segments))
    }
}

impl serde::Serialize for FieldPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Path parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// `a..b`
    #[error("empty segment in path '{0}'")]
    EmptySegment(String),

    /// `a[1`
    #[error("unclosed index in path '{0}'")]
    UnclosedIndex(String),

    /// `a[x]`
    #[error("invalid array index '{0}'")]
    InvalidIndex(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> FieldPath {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(p("models.fallbacks[1]").to_string(), "models.fallbacks[1]");
        assert_eq!(p("channels.*.token").to_string(), "channels.*.token");
        assert_eq!(p("security.deny[*]").to_string(), "security.deny.*");
        assert_eq!(FieldPath::root().to_string(), "$");
    }

    #[test]
    fn parse_errors() {
        assert!(matches!("a..b".parse::<FieldPath>(), Err(PathError::EmptySegment(_))));
        assert!(matches!("a[1".parse::<FieldPath>(), Err(PathError::UnclosedIndex(_))));
        assert!(matches!("a[x]".parse::<FieldPath>(), Err(PathError::InvalidIndex(_))));
    }

    #[test]
    fn lookup_concrete() {
        let doc = json!({"models": {"fallbacks": ["a", "b"]}});
        assert_eq!(p("models.fallbacks[1]").lookup(&doc), Some(&json!("b")));
        assert_eq!(p("models.missing").lookup(&doc), None);
    }

    #[test]
    fn resolve_wildcards() {
        let doc = json!({
            "channels": {
                "telegram": {"token": "t1"},
                "slack": {"token": "t2"},
                "irc": {"nick": "bot"}
            }
        });
        let hits = p("channels.*.token").resolve(&doc);
        let paths: Vec<_> = hits.iter().map(|(path, _)| path.to_string()).collect();
        assert_eq!(paths, vec!["channels.telegram.token", "channels.slack.token"]);
    }

    #[test]
    fn pattern_matching() {
        assert!(p("channels.*.token").matches(&p("channels.slack.token")));
        assert!(!p("channels.*.token").matches(&p("channels.slack.nick")));
        assert!(!p("channels.*").matches(&p("channels.slack.token")));
    }

    #[test]
    fn last_key_skips_indices() {
        assert_eq!(p("models.fallbacks[2]").last_key(), Some("fallbacks"));
        assert_eq!(p("models").first_key(), Some("models"));
    }
}
