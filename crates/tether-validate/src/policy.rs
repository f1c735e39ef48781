//! Validation policy
//!
//! Declares which paths carry model identifiers, which entries need a
//! formatted field, what a secret placeholder looks like, and which fields
//! are critical. Loaded from the `[validation]` section of the guard config.

use serde::{Deserialize, Serialize};
use tether_document::FieldPath;

/// Declared format for a required field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "pattern")]
pub enum FieldFormat {
    /// `#rrggbb`
    HexColor,
    /// Any non-empty string
    NonEmpty,
    /// Custom regular expression (anchored by the caller)
    Regex(String),
}

impl FieldFormat {
    /// Regex source for this format
    #[must_use]
    pub fn pattern(&self) -> &str {
        match self {
            Self::HexColor => r"^#[0-9A-Fa-f]{6}$",
            Self::NonEmpty => r"\S",
            Self::Regex(p) => p,
        }
    }

    /// Short description for messages
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::HexColor => "a hex color like #1e90ff".to_string(),
            Self::NonEmpty => "a non-empty string".to_string(),
            Self::Regex(p) => format!("a string matching /{p}/"),
        }
    }
}

/// "Every entry matched by `entries` must carry `field` in `format`"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredField {
    /// Pattern selecting the entries, e.g. `profiles.*`
    pub entries: FieldPath,
    /// Member that must be present in each entry
    pub field: String,
    /// Format the member must satisfy
    pub format: FieldFormat,
}

/// Validator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Paths whose string values are model/version identifiers
    pub identifier_fields: Vec<FieldPath>,
    /// Entries that must carry a formatted field
    pub required_fields: Vec<RequiredField>,
    /// Regex matched against key names to decide whether a path holds a secret
    pub secret_key_pattern: String,
    /// Regexes recognising unresolved template values
    pub placeholder_patterns: Vec<String>,
    /// Fields whose removal or emptying degrades security or connectivity
    pub critical_fields: Vec<FieldPath>,
    /// Promote critical-field regressions from warnings to errors
    pub block_on_regression: bool,
}

impl ValidationPolicy {
    /// Default policy
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With regressions promoted to errors
    #[inline]
    #[must_use]
    pub fn blocking_regressions(mut self, block: bool) -> Self {
        self.block_on_regression = block;
        self
    }

    /// With an extra critical field
    #[inline]
    #[must_use]
    pub fn with_critical_field(mut self, path: FieldPath) -> Self {
        self.critical_fields.push(path);
        self
    }
}

fn paths(raw: &[&str]) -> Vec<FieldPath> {
    raw.iter().filter_map(|p| p.parse().ok()).collect()
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            identifier_fields: paths(&[
                "models.default",
                "models.primary",
                "models.fallbacks.*",
                "models.aliases.*",
                "agents.*.model",
                "agents.*.model.primary",
                "agents.*.model.fallbacks.*",
            ]),
            required_fields: paths(&["profiles.*"])
                .into_iter()
                .map(|entries| RequiredField {
                    entries,
                    field: "color".to_string(),
                    format: FieldFormat::HexColor,
                })
                .collect(),
            secret_key_pattern: r"(?i)(token|secret|password|passwd|keys?)$".to_string(),
            placeholder_patterns: vec![
                r"^<[^<>]+>$".to_string(),
                r"^\{\{[^{}]*\}\}$".to_string(),
                r"(?i)^your[_\- ]?[a-z0-9_\- ]*$".to_string(),
                r"(?i)^(changeme|change[_-]me|replace[_-]?me|todo|tbd|placeholder|dummy|example|x{3,}|\.{3}|\*{3,})$"
                    .to_string(),
            ],
            critical_fields: paths(&[
                "notifications.token",
                "notifications.chatId",
                "channels.*.token",
                "channels.*.botToken",
                "models.default",
                "security.deny",
                "tools.deny",
                "gateway.auth.token",
            ]),
            block_on_regression: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_parses_all_paths() {
        let policy = ValidationPolicy::default();
        assert_eq!(policy.identifier_fields.len(), 7);
        assert_eq!(policy.critical_fields.len(), 8);
        assert_eq!(policy.required_fields[0].entries.to_string(), "profiles.*");
    }

    #[test]
    fn policy_from_partial_toml_like_json() {
        let policy: ValidationPolicy =
            serde_json::from_str(r#"{"block_on_regression": true, "critical_fields": ["a.b"]}"#)
                .unwrap();
        assert!(policy.block_on_regression);
        assert_eq!(policy.critical_fields.len(), 1);
        // untouched sections keep their defaults
        assert_eq!(policy.identifier_fields.len(), 7);
    }

    #[test]
    fn field_format_serde() {
        let fmt: FieldFormat = serde_json::from_str(r#"{"kind": "regex", "pattern": "^v\\d+$"}"#).unwrap();
        assert_eq!(fmt, FieldFormat::Regex(r"^v\d+$".to_string()));
        let hex: FieldFormat = serde_json::from_str(r#"{"kind": "hex_color"}"#).unwrap();
        assert_eq!(hex, FieldFormat::HexColor);
    }
}
