//! Structural diff between two documents
//!
//! Objects are compared member by member; arrays and scalars are compared
//! as whole values, mirroring the merge rules.

use serde::Serialize;
use serde_json::Value;

use crate::document::ConfigDocument;
use crate::path::FieldPath;

/// What happened at a path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Present only in the newer document
    Added {
        /// New value
        value: Value,
    },
    /// Present only in the older document
    Removed {
        /// Old value
        value: Value,
    },
    /// Present in both with different values
    Changed {
        /// Old value
        from: Value,
        /// New value
        to: Value,
    },
}

/// One difference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    /// Location of the change
    pub path: FieldPath,
    /// Kind and values
    #[serde(flatten)]
    pub kind: ChangeKind,
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ChangeKind::Added { value } => write!(f, "+ {} = {}", self.path, value),
            ChangeKind::Removed { value } => write!(f, "- {} = {}", self.path, value),
            ChangeKind::Changed { from, to } => write!(f, "~ {}: {} -> {}", self.path, from, to),
        }
    }
}

/// Diff `before` against `after`
#[must_use]
pub fn diff(before: &ConfigDocument, after: &ConfigDocument) -> Vec<Change> {
    let mut out = Vec::new();
    diff_values(
        &FieldPath::root(),
        &before.to_value(),
        &after.to_value(),
        &mut out,
    );
    out
}

fn diff_values(at: &FieldPath, before: &Value, after: &Value, out: &mut Vec<Change>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let path = at.key(key.clone());
                match b.get(key) {
                    Some(new) => diff_values(&path, old, new, out),
                    None => out.push(Change {
                        path,
                        kind: ChangeKind::Removed { value: old.clone() },
                    }),
                }
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    out.push(Change {
                        path: at.key(key.clone()),
                        kind: ChangeKind::Added { value: new.clone() },
                    });
                }
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(Change {
            path: at.clone(),
            kind: ChangeKind::Changed {
                from: a.clone(),
                to: b.clone(),
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_documents_have_no_changes() {
        let d = ConfigDocument::from_value(json!({"ui": {"a": [1, 2]}})).unwrap();
        assert!(diff(&d, &d).is_empty());
    }

    #[test]
    fn reports_added_removed_changed() {
        let before = ConfigDocument::from_value(json!({
            "models": {"default": "a-1"},
            "notifications": {"token": "t"}
        }))
        .unwrap();
        let after = ConfigDocument::from_value(json!({
            "models": {"default": "a-2"},
            "notifications": {},
            "ui": {"theme": "dark"}
        }))
        .unwrap();

        let rendered: Vec<String> = diff(&before, &after).iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "~ models.default: \"a-1\" -> \"a-2\"",
                "- notifications.token = \"t\"",
                "+ ui = {\"theme\":\"dark\"}",
            ]
        );
    }

    #[test]
    fn arrays_compare_whole() {
        let before = ConfigDocument::from_value(json!({"security": {"deny": ["a", "b"]}})).unwrap();
        let after = ConfigDocument::from_value(json!({"security": {"deny": ["a"]}})).unwrap();
        let changes = diff(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path.to_string(), "security.deny");
    }
}
