//! Error taxonomy for the sync subsystem.
//!
//! The governing principle is isolation: errors processing one path or
//! one session never propagate to other paths or sessions. Only
//! configuration-level errors are fatal.

use std::path::PathBuf;

use uuid::Uuid;

/// Errors raised by the sync pipeline.
#[derive(Debug)]
pub enum SyncError {
    /// An OS-level watch failed to establish (permissions, missing
    /// path). The root stays in the registry as desired-but-unwatched.
    WatchSubscription { root: PathBuf, reason: String },

    /// A write to one session's connection failed. The session is
    /// unregistered; the broadcast continues for the rest.
    BroadcastDelivery { session: Uuid },

    /// Client-side: reconnect attempts exceeded the cap. The viewer
    /// shows a persistent offline indicator; no further automatic
    /// retries.
    ReconnectExhausted { attempts: u32 },

    /// One or more sessions failed to close within the teardown
    /// timeout. Logged; the process exits regardless.
    ShutdownTimeout { open_sessions: usize },

    /// Subsystem-fatal configuration problem, e.g. no valid watch
    /// roots at startup.
    Config(String),
}

impl SyncError {
    /// Whether the whole subsystem must stop because of this error.
    /// Everything except configuration problems is recovered locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Config(_))
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::WatchSubscription { root, reason } => {
                write!(f, "failed to watch {}: {}", root.display(), reason)
            }
            SyncError::BroadcastDelivery { session } => {
                write!(f, "failed to deliver to session {}", session)
            }
            SyncError::ReconnectExhausted { attempts } => {
                write!(f, "gave up reconnecting after {} attempts", attempts)
            }
            SyncError::ShutdownTimeout { open_sessions } => {
                write!(
                    f,
                    "{} session(s) still open when the shutdown timeout elapsed",
                    open_sessions
                )
            }
            SyncError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(SyncError::Config("no roots".into()).is_fatal());
        assert!(!SyncError::ReconnectExhausted { attempts: 5 }.is_fatal());
        assert!(!SyncError::ShutdownTimeout { open_sessions: 2 }.is_fatal());
        assert!(!SyncError::BroadcastDelivery { session: Uuid::new_v4() }.is_fatal());
    }

    #[test]
    fn display_names_the_root() {
        let err = SyncError::WatchSubscription {
            root: PathBuf::from("/docs"),
            reason: "permission denied".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/docs"));
        assert!(text.contains("permission denied"));
    }
}
