//! Semantic validator
//!
//! Pure: a candidate document (and optionally the last snapshot) in, a
//! [`ValidationReport`] out. Checks run in a fixed order:
//!
//! 1. Syntax (text entry point only, short-circuits)
//! 2. Unknown top-level keys
//! 3. Identifier separator convention
//! 4. Required fields
//! 5. Placeholder secrets
//! 6. Critical-field regression against the baseline

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tether_document::{ConfigDocument, FieldPath, Segment};

use crate::finding::{Finding, Rule, Severity, ValidationReport};
use crate::policy::{RequiredField, ValidationPolicy};

/// Canonical identifier: alphanumeric runs joined by `-`, `_`, `/`, `:` or `@`
static CANONICAL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]+(?:[-_/:@][A-Za-z0-9]+)*$").expect("identifier regex is valid")
});

/// A dotted version inside an identifier, e.g. `4.5`
static DOTTED_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d)\.(\d)").expect("version regex is valid"));

/// Policy regex that failed to compile
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A configured pattern is not a valid regular expression
    #[error("invalid {what} pattern '{pattern}': {source}")]
    InvalidPattern {
        /// Which policy entry
        what: &'static str,
        /// Offending source
        pattern: String,
        /// Regex error
        #[source]
        source: regex::Error,
    },
}

fn compile(what: &'static str, pattern: &str) -> Result<Regex, PolicyError> {
    Regex::new(pattern).map_err(|source| PolicyError::InvalidPattern {
        what,
        pattern: pattern.to_string(),
        source,
    })
}

struct CompiledRequirement {
    spec: RequiredField,
    format: Regex,
}

/// Validator with a compiled policy
pub struct SemanticValidator {
    policy: ValidationPolicy,
    secret_key: Regex,
    placeholders: Vec<Regex>,
    requirements: Vec<CompiledRequirement>,
}

impl std::fmt::Debug for SemanticValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticValidator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SemanticValidator {
    /// Compile a policy
    ///
    /// # Errors
    /// Returns `PolicyError::InvalidPattern` if any policy regex is invalid
    pub fn new(policy: ValidationPolicy) -> Result<Self, PolicyError> {
        let secret_key = compile("secret key", &policy.secret_key_pattern)?;
        let placeholders = policy
            .placeholder_patterns
            .iter()
            .map(|p| compile("placeholder", p))
            .collect::<Result<Vec<_>, _>>()?;
        let requirements = policy
            .required_fields
            .iter()
            .map(|spec| {
                Ok(CompiledRequirement {
                    format: compile("required field format", spec.format.pattern())?,
                    spec: spec.clone(),
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        Ok(Self {
            policy,
            secret_key,
            placeholders,
            requirements,
        })
    }

    /// Policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate raw document text
    ///
    /// A document that does not parse, or whose root is not an object,
    /// yields exactly one syntax error and nothing else.
    #[must_use]
    pub fn validate_text(&self, text: &str, baseline: Option<&ConfigDocument>) -> ValidationReport {
        match ConfigDocument::parse(text) {
            Ok(candidate) => self.validate(&candidate, baseline),
            Err(err) => ValidationReport::new(vec![Finding::error(Rule::Syntax, err.to_string())]),
        }
    }

    /// Validate a parsed candidate
    ///
    /// `baseline` is the last snapshot; without one the regression check is
    /// skipped.
    #[must_use]
    pub fn validate(
        &self,
        candidate: &ConfigDocument,
        baseline: Option<&ConfigDocument>,
    ) -> ValidationReport {
        let mut findings = Vec::new();
        check_unknown_keys(candidate, &mut findings);
        self.check_identifiers(candidate, &mut findings);
        self.check_required_fields(candidate, &mut findings);
        self.check_placeholders(candidate, &mut findings);
        if let Some(baseline) = baseline {
            self.check_regressions(candidate, baseline, &mut findings);
        }
        ValidationReport::new(findings)
    }

    fn check_identifiers(&self, candidate: &ConfigDocument, out: &mut Vec<Finding>) {
        for pattern in &self.policy.identifier_fields {
            for (path, value) in candidate.resolve(pattern) {
                let Value::String(id) = value else { continue };
                if CANONICAL_IDENTIFIER.is_match(&id) {
                    continue;
                }
                let message = if DOTTED_VERSION.is_match(&id) {
                    let suggestion = DOTTED_VERSION.replace_all(&id, "$1-$2");
                    format!(
                        "identifier '{id}' uses '.' as a separator; use '-' instead (e.g. '{suggestion}')"
                    )
                } else {
                    format!("identifier '{id}' does not match the canonical token format")
                };
                out.push(Finding::error(Rule::IdentifierFormat, message).at(path));
            }
        }
    }

    fn check_required_fields(&self, candidate: &ConfigDocument, out: &mut Vec<Finding>) {
        for req in &self.requirements {
            let field = &req.spec.field;
            for (entry_path, entry) in candidate.resolve(&req.spec.entries) {
                let field_path = entry_path.key(field.clone());
                let Value::Object(entry) = entry else {
                    out.push(
                        Finding::error(
                            Rule::RequiredField,
                            format!("entry must be an object carrying '{field}'"),
                        )
                        .at(entry_path),
                    );
                    continue;
                };
                match entry.get(field) {
                    None => out.push(
                        Finding::error(
                            Rule::RequiredField,
                            format!("missing required field '{field}'"),
                        )
                        .at(field_path),
                    ),
                    Some(Value::String(s)) if req.format.is_match(s) => {}
                    Some(other) => out.push(
                        Finding::error(
                            Rule::RequiredField,
                            format!("{other} is not {}", req.spec.format.describe()),
                        )
                        .at(field_path),
                    ),
                }
            }
        }
    }

    fn is_secret_path(&self, path: &FieldPath) -> bool {
        path.segments().iter().any(|s| match s {
            Segment::Key(k) => self.secret_key.is_match(k),
            _ => false,
        })
    }

    fn check_placeholders(&self, candidate: &ConfigDocument, out: &mut Vec<Finding>) {
        candidate.for_each_string(|path, value| {
            if !self.is_secret_path(path) {
                return;
            }
            let trimmed = value.trim();
            if self.placeholders.iter().any(|re| re.is_match(trimmed)) {
                out.push(
                    Finding::error(
                        Rule::PlaceholderSecret,
                        format!("secret still holds placeholder value '{trimmed}'"),
                    )
                    .at(path.clone()),
                );
            }
        });
    }

    fn check_regressions(
        &self,
        candidate: &ConfigDocument,
        baseline: &ConfigDocument,
        out: &mut Vec<Finding>,
    ) {
        let severity = if self.policy.block_on_regression {
            Severity::Error
        } else {
            Severity::Warning
        };
        for pattern in &self.policy.critical_fields {
            for (path, old) in baseline.resolve(pattern) {
                if is_empty(&old) {
                    continue;
                }
                let message = match candidate.get(&path) {
                    None => "critical field was removed".to_string(),
                    Some(new) if is_empty(new) => "critical field was emptied".to_string(),
                    Some(Value::Array(new)) => match &old {
                        Value::Array(old) => {
                            let lost: Vec<String> = old
                                .iter()
                                .filter(|item| !new.contains(item))
                                .map(ToString::to_string)
                                .collect();
                            if lost.is_empty() {
                                continue;
                            }
                            format!("critical list lost entries: {}", lost.join(", "))
                        }
                        _ => continue,
                    },
                    Some(_) => continue,
                };
                out.push(Finding {
                    severity,
                    rule: Rule::CriticalRegression,
                    message,
                    path: Some(path),
                });
            }
        }
    }
}

fn check_unknown_keys(candidate: &ConfigDocument, out: &mut Vec<Finding>) {
    for key in candidate.unknown_keys() {
        out.push(
            Finding::error(Rule::UnknownKey, format!("'{key}' is not a permitted top-level key"))
                .at(FieldPath::root().key(key)),
        );
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SemanticValidator {
        SemanticValidator::new(ValidationPolicy::default()).unwrap()
    }

    fn doc(v: Value) -> ConfigDocument {
        ConfigDocument::from_value(v).unwrap()
    }

    #[test]
    fn syntax_error_short_circuits() {
        let report = validator().validate_text("{\"models\": {\"default\": ", None);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].rule, Rule::Syntax);
        assert!(report.has_errors());
    }

    #[test]
    fn non_object_root_is_syntax_error() {
        let report = validator().validate_text("[1, 2]", None);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].rule, Rule::Syntax);
    }

    #[test]
    fn unknown_top_level_key() {
        let report = validator().validate(&doc(json!({"ui": {}, "turbo_mode": true})), None);
        let unknown: Vec<_> = report.by_rule(Rule::UnknownKey).collect();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].path.as_ref().unwrap().to_string(), "turbo_mode");
    }

    #[test]
    fn dotted_identifier_suggests_hyphen() {
        let report =
            validator().validate(&doc(json!({"models": {"default": "agent-sonnet-4.5"}})), None);
        let found: Vec<_> = report.by_rule(Rule::IdentifierFormat).collect();
        assert_eq!(found.len(), 1);
        assert!(found[0].message.contains("agent-sonnet-4-5"));
        assert_eq!(found[0].path.as_ref().unwrap().to_string(), "models.default");
    }

    #[test]
    fn identifiers_inside_agent_entries() {
        let report = validator().validate(
            &doc(json!({"agents": {
                "coder": {"model": {"primary": "vendor/model-3", "fallbacks": ["ok-1", "bad 2"]}},
                "writer": {"model": "writer-1"}
            }})),
            None,
        );
        let found: Vec<_> = report.by_rule(Rule::IdentifierFormat).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].path.as_ref().unwrap().to_string(),
            "agents.coder.model.fallbacks[1]"
        );
    }

    #[test]
    fn profile_color_required_and_formatted() {
        let report = validator().validate(
            &doc(json!({"profiles": {
                "ok": {"color": "#1e90ff"},
                "missing": {},
                "bad": {"color": "blue"},
                "scalar": 3
            }})),
            None,
        );
        let paths: Vec<String> = report
            .by_rule(Rule::RequiredField)
            .map(|f| f.path.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(
            paths,
            vec!["profiles.missing.color", "profiles.bad.color", "profiles.scalar"]
        );
    }

    #[test]
    fn placeholder_secrets_rejected() {
        let report = validator().validate(
            &doc(json!({
                "notifications": {"token": "<your-bot-token>", "chatId": "12345"},
                "channels": {"chat": {"botToken": "YOUR_TOKEN_HERE"}},
                "auth": {"apiKey": "changeme"},
                "env": {"OPENAI_KEY": "${OPENAI_KEY}"},
                "ui": {"title": "<b>"}
            })),
            None,
        );
        let paths: Vec<String> = report
            .by_rule(Rule::PlaceholderSecret)
            .map(|f| f.path.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(
            paths,
            vec!["notifications.token", "channels.chat.botToken", "auth.apiKey"]
        );
    }

    #[test]
    fn removed_token_is_warning() {
        let baseline = doc(json!({"notifications": {"token": "abc123", "chatId": "42"}}));
        let candidate = doc(json!({"notifications": {"chatId": "42"}}));
        let report = validator().validate(&candidate, Some(&baseline));
        assert!(!report.has_errors());
        let warnings: Vec<_> = report.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].rule, Rule::CriticalRegression);
        assert_eq!(
            warnings[0].path.as_ref().unwrap().to_string(),
            "notifications.token"
        );
    }

    #[test]
    fn emptied_and_shrunk_fields_are_reported() {
        let baseline = doc(json!({
            "models": {"default": "a-1"},
            "security": {"deny": ["rm -rf", "curl"]}
        }));
        let candidate = doc(json!({
            "models": {"default": ""},
            "security": {"deny": ["rm -rf", "wget"]}
        }));
        let report = validator().validate(&candidate, Some(&baseline));
        let messages: Vec<_> = report
            .by_rule(Rule::CriticalRegression)
            .map(|f| f.message.clone())
            .collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("emptied"));
        assert!(messages[1].contains("\"curl\""));
    }

    #[test]
    fn regression_blocks_when_configured() {
        let strict = SemanticValidator::new(ValidationPolicy::default().blocking_regressions(true))
            .unwrap();
        let baseline = doc(json!({"tools": {"deny": ["exec"]}}));
        let report = strict.validate(&doc(json!({"tools": {}})), Some(&baseline));
        assert!(report.has_errors());
    }

    #[test]
    fn findings_are_collected_not_short_circuited() {
        let report = validator().validate(
            &doc(json!({
                "bogus": 1,
                "models": {"default": "x.1"},
                "notifications": {"token": "TODO"}
            })),
            None,
        );
        assert_eq!(report.errors().count(), 3);
    }

    #[test]
    fn invalid_policy_pattern() {
        let mut policy = ValidationPolicy::default();
        policy.placeholder_patterns.push("(".to_string());
        assert!(matches!(
            SemanticValidator::new(policy),
            Err(PolicyError::InvalidPattern { what: "placeholder", .. })
        ));
    }
}
