//! Metadata snapshots and watched-field diffing.
//!
//! A viewer keeps the last [`DocumentMeta`] snapshot of the document
//! it has open. When a change notification for that document arrives,
//! a fresh snapshot is fetched and compared; only the watched fields
//! {status, approval, priority, name} can produce a notification.

use serde::{Deserialize, Serialize};

/// The watched metadata fields of a document. Unknown fields in the
/// source JSON (free-text description, dependency tables, ...) are
/// dropped at deserialization, so they can never show up in a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub approval: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One changed field: name plus old and new values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Result of comparing two snapshots of the same document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDiff {
    pub changes: Vec<FieldChange>,
}

impl FieldDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Compare two snapshots field by field over the fixed watch list.
pub fn diff_meta(old: &DocumentMeta, new: &DocumentMeta) -> FieldDiff {
    let mut changes = Vec::new();
    let fields: [(&'static str, &Option<String>, &Option<String>); 4] = [
        ("status", &old.status, &new.status),
        ("approval", &old.approval, &new.approval),
        ("priority", &old.priority, &new.priority),
        ("name", &old.name, &new.name),
    ];
    for (field, before, after) in fields {
        if before != after {
            changes.push(FieldChange {
                field,
                old: before.clone(),
                new: after.clone(),
            });
        }
    }
    FieldDiff { changes }
}
