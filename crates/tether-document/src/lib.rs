//! Tether Document Model
//!
//! Typed view of the host's mutable configuration document.
//!
//! # Core Concepts
//!
//! - [`ConfigDocument`]: parsed document with a closed set of top-level keys
//! - [`TopLevelKey`]: the permitted sections
//! - [`FieldPath`]: concrete paths and `*` patterns into a document
//! - [`Patch`] + [`simulate`]: merge a partial document without writing it
//! - [`diff`]: structural changes between two documents
//! - [`ContentHash`]: Blake3 digest for documents and tracked files
//!
//! # Example
//!
//! ```
//! use tether_document::{simulate, ConfigDocument, Patch};
//!
//! let current = ConfigDocument::parse(r#"{"models": {"default": "a-1", "fallbacks": []}}"#).unwrap();
//! let patch = Patch::parse(r#"{"models": {"default": "a-2"}}"#).unwrap();
//! let candidate = simulate(&current, &patch);
//!
//! assert_eq!(candidate.to_value()["models"]["default"], "a-2");
//! assert!(candidate.to_value()["models"]["fallbacks"].is_array());
//! ```

#![warn(unreachable_pub)]

mod diff;
mod document;
mod hash;
mod merge;
mod path;

pub use diff::{diff, Change, ChangeKind};
pub use document::{ConfigDocument, DocumentError, TopLevelKey};
pub use hash::{ContentHash, HashError};
pub use merge::{deep_merge, simulate, Patch};
pub use path::{FieldPath, PathError, Segment};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
