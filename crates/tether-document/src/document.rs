//! Typed configuration document
//!
//! The host's runtime configuration is a JSON object whose top-level keys
//! belong to a closed set ([`TopLevelKey`]). Parsing never rejects unknown
//! keys: they are kept so the validator can report them, and so a document
//! with an invented field can still be snapshotted and restored verbatim.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::hash::ContentHash;
use crate::path::FieldPath;

/// Permitted top-level sections of the host configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopLevelKey {
    /// Per-agent settings and defaults
    Agents,
    /// Provider credentials and auth profiles
    Auth,
    /// Messaging channel integrations
    Channels,
    /// Slash/command configuration
    Commands,
    /// Environment overrides passed to the host
    Env,
    /// HTTP gateway (health endpoint, bind address)
    Gateway,
    /// Lifecycle hooks
    Hooks,
    /// Host logging
    Logging,
    /// Message routing and formatting
    Messages,
    /// Document metadata (version stamps, last writer)
    Meta,
    /// Model identifiers and fallbacks
    Models,
    /// Operator notification channel
    Notifications,
    /// Plugin loading
    Plugins,
    /// Named persona profiles
    Profiles,
    /// Deny-lists and sandbox policy
    Security,
    /// Session persistence
    Session,
    /// Skill registry
    Skills,
    /// Tool permissions
    Tools,
    /// UI preferences
    Ui,
}

impl TopLevelKey {
    /// Every permitted key, in schema order
    pub const ALL: [TopLevelKey; 19] = [
        Self::Agents,
        Self::Auth,
        Self::Channels,
        Self::Commands,
        Self::Env,
        Self::Gateway,
        Self::Hooks,
        Self::Logging,
        Self::Messages,
        Self::Meta,
        Self::Models,
        Self::Notifications,
        Self::Plugins,
        Self::Profiles,
        Self::Security,
        Self::Session,
        Self::Skills,
        Self::Tools,
        Self::Ui,
    ];

    /// Key as it appears in the document
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agents => "agents",
            Self::Auth => "auth",
            Self::Channels => "channels",
            Self::Commands => "commands",
            Self::Env => "env",
            Self::Gateway => "gateway",
            Self::Hooks => "hooks",
            Self::Logging => "logging",
            Self::Messages => "messages",
            Self::Meta => "meta",
            Self::Models => "models",
            Self::Notifications => "notifications",
            Self::Plugins => "plugins",
            Self::Profiles => "profiles",
            Self::Security => "security",
            Self::Session => "session",
            Self::Skills => "skills",
            Self::Tools => "tools",
            Self::Ui => "ui",
        }
    }
}

impl Display for TopLevelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopLevelKey {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DocumentError::UnknownKey(s.to_string()))
    }
}

/// A parsed host configuration document
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    root: Map<String, Value>,
}

impl ConfigDocument {
    /// Parse document text
    ///
    /// # Errors
    /// - `DocumentError::Syntax` if the text is not well-formed JSON
    /// - `DocumentError::NotAnObject` if the root is not an object
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(text).map_err(DocumentError::syntax)?;
        Self::from_value(value)
    }

    /// Wrap an already-parsed value
    ///
    /// # Errors
    /// Returns `DocumentError::NotAnObject` unless `value` is an object
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            other => Err(DocumentError::NotAnObject(json_kind(&other))),
        }
    }

    /// Empty document
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self { root: Map::new() }
    }

    /// Root object
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Root as a JSON value (clones)
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Consume into a JSON value
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }

    /// Section for a known top-level key
    #[inline]
    #[must_use]
    pub fn section(&self, key: TopLevelKey) -> Option<&Value> {
        self.root.get(key.as_str())
    }

    /// Known sections present in the document
    pub fn known_sections(&self) -> impl Iterator<Item = (TopLevelKey, &Value)> {
        self.root
            .iter()
            .filter_map(|(k, v)| k.parse::<TopLevelKey>().ok().map(|key| (key, v)))
    }

    /// Top-level keys outside the permitted set
    ///
    /// This is a set difference against [`TopLevelKey::ALL`].
    #[must_use]
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.root
            .keys()
            .filter(|k| k.parse::<TopLevelKey>().is_err())
            .map(String::as_str)
            .collect()
    }

    /// Value at a concrete path
    #[must_use]
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let mut segments = path.segments().iter();
        let first = match segments.next() {
            None => return None,
            Some(crate::path::Segment::Key(k)) => self.root.get(k)?,
            Some(_) => return None,
        };
        FieldPath::new(segments.cloned().collect()).lookup(first)
    }

    /// Expand a path pattern against this document
    #[must_use]
    pub fn resolve(&self, pattern: &FieldPath) -> Vec<(FieldPath, Value)> {
        let root = self.to_value();
        pattern
            .resolve(&root)
            .into_iter()
            .map(|(p, v)| (p, v.clone()))
            .collect()
    }

    /// Visit every string leaf with its path
    pub fn for_each_string(&self, mut f: impl FnMut(&FieldPath, &str)) {
        for (k, v) in &self.root {
            walk_strings(&FieldPath::root().key(k.clone()), v, &mut f);
        }
    }

    /// Pretty JSON with a trailing newline, as written to disk
    #[must_use]
    pub fn to_pretty_json(&self) -> String {
        // Map<String, Value> serialization is infallible
        let mut out = serde_json::to_string_pretty(&self.root).unwrap_or_default();
        out.push('\n');
        out
    }

    /// Order-independent content hash
    #[must_use]
    pub fn canonical_hash(&self) -> ContentHash {
        let mut canonical = String::new();
        write_canonical(&Value::Object(self.root.clone()), &mut canonical);
        ContentHash::compute(canonical.as_bytes())
    }

    pub(crate) fn root_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.root
    }
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromStr for ConfigDocument {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn walk_strings(at: &FieldPath, value: &Value, f: &mut impl FnMut(&FieldPath, &str)) {
    match value {
        Value::String(s) => f(at, s),
        Value::Object(map) => {
            for (k, v) in map {
                walk_strings(&at.key(k.clone()), v, f);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk_strings(&at.index(i), v, f);
            }
        }
        _ => {}
    }
}

/// Canonical JSON (sorted keys, no whitespace)
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Document errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// Text is not well-formed JSON
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// Parser message
        message: String,
    },

    /// Root (or patch) is not an object
    #[error("expected a JSON object at the root, found {0}")]
    NotAnObject(&'static str),

    /// Key outside [`TopLevelKey::ALL`]
    #[error("unknown top-level key: '{0}'")]
    UnknownKey(String),
}

impl DocumentError {
    fn syntax(err: serde_json::Error) -> Self {
        Self::Syntax {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_valid_document() {
        let doc = ConfigDocument::parse(r#"{"models": {"default": "a-1"}, "ui": {}}"#).unwrap();
        assert_eq!(doc.section(TopLevelKey::Models), Some(&json!({"default": "a-1"})));
        assert!(doc.unknown_keys().is_empty());
    }

    #[test]
    fn incomplete_json_is_syntax_error() {
        let err = ConfigDocument::parse(r#"{"models": {"default": "a-1""#).unwrap_err();
        assert!(matches!(err, DocumentError::Syntax { line: 1, .. }));
    }

    #[test]
    fn non_object_root_rejected() {
        let err = ConfigDocument::parse("[1, 2]").unwrap_err();
        assert_eq!(err, DocumentError::NotAnObject("array"));
    }

    #[test]
    fn unknown_keys_are_kept_and_reported() {
        let doc = ConfigDocument::parse(r#"{"models": {}, "turbo_mode": true}"#).unwrap();
        assert_eq!(doc.unknown_keys(), vec!["turbo_mode"]);
        assert_eq!(doc.known_sections().count(), 1);
        assert!(doc.to_pretty_json().contains("turbo_mode"));
    }

    #[test]
    fn top_level_key_roundtrip() {
        for key in TopLevelKey::ALL {
            assert_eq!(key.as_str().parse::<TopLevelKey>().unwrap(), key);
        }
        assert!("bogus".parse::<TopLevelKey>().is_err());
    }

    #[test]
    fn canonical_hash_ignores_key_order() {
        let a = ConfigDocument::parse(r#"{"ui": {"b": 1, "a": 2}, "meta": {}}"#).unwrap();
        let b = ConfigDocument::parse(r#"{"meta": {}, "ui": {"a": 2, "b": 1}}"#).unwrap();
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn pretty_json_preserves_key_order() {
        let doc = ConfigDocument::parse(r#"{"ui": {}, "agents": {}, "meta": {}}"#).unwrap();
        let text = doc.to_pretty_json();
        let ui = text.find("\"ui\"").unwrap();
        let agents = text.find("\"agents\"").unwrap();
        assert!(ui < agents);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn get_and_strings() {
        let doc = ConfigDocument::parse(r#"{"models": {"fallbacks": ["x", "y"]}}"#).unwrap();
        let path: FieldPath = "models.fallbacks[1]".parse().unwrap();
        assert_eq!(doc.get(&path), Some(&json!("y")));

        let mut seen = Vec::new();
        doc.for_each_string(|p, s| seen.push(format!("{p}={s}")));
        assert_eq!(seen, vec!["models.fallbacks[0]=x", "models.fallbacks[1]=y"]);
    }
}
