//! Event and wire types shared across the sync pipeline.
//!
//! Filesystem observations enter as [`RawChangeEvent`]s, leave the
//! coalescer as [`CoalescedChange`]s, and reach viewer sessions as
//! [`ServerMessage`] JSON frames.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a watched document file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}

/// An unprocessed filesystem notification. Ephemeral: produced by the
/// OS-level watcher (or injected synthetically), consumed immediately
/// by the coalescer, never stored.
#[derive(Debug, Clone)]
pub struct RawChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

impl RawChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }
}

/// The unit broadcast to sessions: at most one per path per quiet
/// window, carrying the last observed kind for that path.
#[derive(Debug, Clone)]
pub struct CoalescedChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Monotonically increasing across all paths, for ordering and debugging.
    pub sequence: u64,
    /// When the coalescing window for this change closed.
    pub window_closed_at: DateTime<Utc>,
}

/// Server → viewer wire message. `fileChanged` is the only message
/// type this subsystem defines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    FileChanged { path: String, kind: ChangeKind },
}

impl From<&CoalescedChange> for ServerMessage {
    fn from(change: &CoalescedChange) -> Self {
        ServerMessage::FileChanged {
            path: change.path.display().to_string(),
            kind: change.kind,
        }
    }
}
