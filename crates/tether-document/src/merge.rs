//! Merge-and-simulate
//!
//! Produces the exact document that would exist after an apply without
//! touching live state. Objects present on both sides merge recursively;
//! every other combination is replaced outright by the patch value. Arrays
//! are never concatenated or merged element-wise, and `null` is stored as a
//! value rather than treated as a deletion.

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::document::{json_kind, ConfigDocument, DocumentError};

/// A partial document proposed by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    body: Map<String, Value>,
}

impl Patch {
    /// Parse patch text
    ///
    /// # Errors
    /// - `DocumentError::Syntax` for malformed JSON
    /// - `DocumentError::NotAnObject` if the patch is not an object
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(text).map_err(|e| DocumentError::Syntax {
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Wrap a parsed value
    ///
    /// # Errors
    /// Returns `DocumentError::NotAnObject` unless `value` is an object
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(body) => Ok(Self { body }),
            other => Err(DocumentError::NotAnObject(json_kind(&other))),
        }
    }

    /// Patch body
    #[inline]
    #[must_use]
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Patch as a JSON value (clones)
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    /// True if the patch changes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

impl FromStr for Patch {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Deep-merge `patch` into `target` in place
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            merge_maps(target_map, patch_map);
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn merge_maps(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, patch_value) in patch {
        match target.get_mut(key) {
            Some(existing) => deep_merge(existing, patch_value),
            None => {
                target.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Build the candidate document for `patch` applied to `current`
///
/// Pure: neither argument is modified and nothing is written.
#[must_use]
pub fn simulate(current: &ConfigDocument, patch: &Patch) -> ConfigDocument {
    let mut candidate = current.clone();
    merge_maps(candidate.root_mut(), patch.body());
    candidate
}
