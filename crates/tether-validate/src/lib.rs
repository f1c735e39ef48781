//! Tether Semantic Validator
//!
//! Pure checks over a candidate configuration document:
//! - Syntax and root shape
//! - Closed top-level schema
//! - Identifier separator convention
//! - Required, formatted fields
//! - Unresolved placeholder secrets
//! - Critical-field regression against the last snapshot
//!
//! # Example
//!
//! ```
//! use tether_validate::{Rule, SemanticValidator, ValidationPolicy};
//!
//! let validator = SemanticValidator::new(ValidationPolicy::default()).unwrap();
//! let report = validator.validate_text(r#"{"models": {"default": "agent-sonnet-4.5"}}"#, None);
//! assert!(report.has_errors());
//! assert_eq!(report.findings[0].rule, Rule::IdentifierFormat);
//! ```

#![warn(unreachable_pub)]

mod finding;
mod policy;
mod validator;

pub use finding::{Finding, Rule, Severity, ValidationReport};
pub use policy::{FieldFormat, RequiredField, ValidationPolicy};
pub use validator::{PolicyError, SemanticValidator};
