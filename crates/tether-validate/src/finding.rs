//! Validation findings
//!
//! Findings are derived data: recomputed on every pass, never persisted as
//! authoritative state. Errors block a mutation, warnings are surfaced only.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use tether_document::FieldPath;

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Reported, does not block
    Warning,
    /// Blocks the mutation
    Error,
}

/// Which check produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Document is not well-formed
    Syntax,
    /// Top-level key outside the schema
    UnknownKey,
    /// Model/version identifier uses a non-canonical separator
    IdentifierFormat,
    /// Required field missing or malformed
    RequiredField,
    /// Secret-like field still holds a template placeholder
    PlaceholderSecret,
    /// Critical field removed, emptied or shrunk relative to the last snapshot
    CriticalRegression,
    /// Written file does not match the expected manifest
    Integrity,
    /// Plugin entry point or dependency cannot be resolved
    UnresolvedDependency,
}

impl Rule {
    /// Stable rule name used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::UnknownKey => "unknown-key",
            Self::IdentifierFormat => "identifier-format",
            Self::RequiredField => "required-field",
            Self::PlaceholderSecret => "placeholder-secret",
            Self::CriticalRegression => "critical-regression",
            Self::Integrity => "integrity",
            Self::UnresolvedDependency => "unresolved-dependency",
        }
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Error or warning
    pub severity: Severity,
    /// Producing check
    pub rule: Rule,
    /// Human-readable explanation
    pub message: String,
    /// Location, when the finding concerns one field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<FieldPath>,
}

impl Finding {
    /// Blocking finding
    #[inline]
    #[must_use]
    pub fn error(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            rule,
            message: message.into(),
            path: None,
        }
    }

    /// Non-blocking finding
    #[inline]
    #[must_use]
    pub fn warning(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            rule,
            message: message.into(),
            path: None,
        }
    }

    /// Attach a field path
    #[inline]
    #[must_use]
    pub fn at(mut self, path: FieldPath) -> Self {
        self.path = Some(path);
        self
    }

    /// True for blocking findings
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl Display for Finding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.path {
            Some(path) => write!(f, "{level}[{}] {path}: {}", self.rule, self.message),
            None => write!(f, "{level}[{}] {}", self.rule, self.message),
        }
    }
}

/// All findings from one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Findings in check order
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// Report from findings
    #[inline]
    #[must_use]
    pub fn new(findings: Vec<Finding>) -> Self {
        Self { findings }
    }

    /// True if any finding blocks the mutation
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(Finding::is_error)
    }

    /// Blocking findings
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_error())
    }

    /// Non-blocking findings
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_error())
    }

    /// Findings produced by one rule
    pub fn by_rule(&self, rule: Rule) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.rule == rule)
    }

    /// True if nothing was found
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let errors = self.errors().count();
        let warnings = self.findings.len() - errors;
        for finding in &self.findings {
            writeln!(f, "{finding}")?;
        }
        write!(f, "{errors} error(s), {warnings} warning(s)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_display_with_path() {
        let finding = Finding::error(Rule::IdentifierFormat, "bad separator")
            .at("models.default".parse().unwrap());
        assert_eq!(
            finding.to_string(),
            "error[identifier-format] models.default: bad separator"
        );
    }

    #[test]
    fn report_partitions_by_severity() {
        let report = ValidationReport::new(vec![
            Finding::warning(Rule::CriticalRegression, "token removed"),
            Finding::error(Rule::UnknownKey, "turbo"),
        ]);
        assert!(report.has_errors());
        assert_eq!(report.errors().count(), 1);
        assert_eq!(report.warnings().count(), 1);
        assert!(report.to_string().ends_with("1 error(s), 1 warning(s)"));
    }

    #[test]
    fn warnings_only_do_not_block() {
        let report = ValidationReport::new(vec![Finding::warning(Rule::CriticalRegression, "x")]);
        assert!(!report.has_errors());
        assert!(!report.is_clean());
    }
}
