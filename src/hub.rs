//! Session registry and broadcast hub.
//!
//! The hub is the sole owner of the live-session set. Each session has
//! its own bounded outbound queue, so delivery to one session never
//! blocks or corrupts delivery to another; the socket write itself
//! happens in the session's own task. A failed enqueue marks the
//! session dead and unregisters it without aborting the broadcast
//! loop.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{CoalescedChange, ServerMessage};

/// Frames queued for one session's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialized [`ServerMessage`].
    Text(String),
    /// Graceful close request; the socket task sends a close frame and
    /// stops.
    Close,
}

struct Session {
    tx: mpsc::Sender<OutboundFrame>,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
}

/// One live session as reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStat {
    pub id: Uuid,
    pub connected_secs: i64,
    pub idle_secs: i64,
}

/// Tracks live sessions and fans every coalesced change out to all of
/// them, in the order the coalescer emitted them.
pub struct BroadcastHub {
    sessions: DashMap<Uuid, Session>,
    queue_depth: usize,
}

impl BroadcastHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_depth,
        }
    }

    /// Register a new session after a successful handshake. Returns
    /// the session id and the receiving end of its outbound queue.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<OutboundFrame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let now = Utc::now();
        self.sessions.insert(
            id,
            Session {
                tx,
                connected_at: now,
                last_activity: Mutex::new(now),
            },
        );
        info!("session {} registered ({} live)", id, self.sessions.len());
        (id, rx)
    }

    /// Remove a session. Safe to call twice; the second call is a
    /// no-op.
    pub fn unregister(&self, id: Uuid) {
        if self.sessions.remove(&id).is_some() {
            info!("session {} unregistered ({} live)", id, self.sessions.len());
        }
    }

    /// Record activity on a session (any inbound frame).
    pub fn touch(&self, id: Uuid) {
        if let Some(session) = self.sessions.get(&id) {
            *session.last_activity.lock() = Utc::now();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Point-in-time view of every live session, surfaced by the
    /// health endpoint.
    pub fn session_stats(&self) -> Vec<SessionStat> {
        let now = Utc::now();
        self.sessions
            .iter()
            .map(|entry| SessionStat {
                id: *entry.key(),
                connected_secs: (now - entry.value().connected_at).num_seconds(),
                idle_secs: (now - *entry.value().last_activity.lock()).num_seconds(),
            })
            .collect()
    }

    /// Deliver one change to every currently registered session.
    ///
    /// The recipient set is snapshotted up front: a session that
    /// registers after this call begins does not receive the change.
    /// A full or closed queue counts as a failed write; that session
    /// is pruned and the loop continues.
    pub fn broadcast(&self, change: &CoalescedChange) {
        let message = ServerMessage::from(change);
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to serialize change {}: {}", change.sequence, err);
                return;
            }
        };

        let recipients: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        debug!(
            "broadcasting seq {} ({} {}) to {} session(s)",
            change.sequence,
            change.kind,
            change.path.display(),
            recipients.len()
        );

        for id in recipients {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };
            if session.tx.try_send(OutboundFrame::Text(text.clone())).is_err() {
                drop(session);
                let err = SyncError::BroadcastDelivery { session: id };
                warn!("{}, pruning session", err);
                self.unregister(id);
            }
        }
    }

    /// Ask every live session to close gracefully. Sessions report
    /// closed by unregistering themselves when their socket task ends.
    pub fn close_all(&self) {
        let recipients: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        info!("closing {} session(s)", recipients.len());
        for id in recipients {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };
            if session.tx.try_send(OutboundFrame::Close).is_err() {
                drop(session);
                self.unregister(id);
            }
        }
    }
}
