//! Client sync agent.
//!
//! Per-viewer logic: maintain one WebSocket connection to the sync
//! server, reconnect with a fixed backoff interval on loss (capped at
//! a hard maximum of consecutive failures), and raise a diff
//! notification when the currently viewed document's watched metadata
//! fields change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::diff::{diff_meta, DocumentMeta, FieldDiff};
use crate::error::SyncError;
use crate::protocol::ServerMessage;

/// Source of document metadata snapshots. The agent never parses
/// documents itself; snapshots come from the document-storage side.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn get_metadata(&self, path: &Path) -> Result<DocumentMeta>;
}

/// Connection lifecycle states. `Offline` is terminal: it is only
/// entered when the reconnect cap is exhausted, and only a manual
/// reload leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
    Offline,
}

/// Notifications surfaced to the viewer UI.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Watched fields of the viewed document changed.
    Diff { path: PathBuf, diff: FieldDiff },
    StateChanged(AgentState),
    /// Reconnects exhausted; show a persistent offline indicator.
    Offline,
}

/// Fixed-interval reconnect policy. Deliberately not exponential: the
/// failure mode this tolerates is a brief server restart, which
/// resolves within a few intervals.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

enum SessionEnd {
    Dropped,
    Stopped,
}

/// One viewer's sync agent. Lives for the lifetime of the viewer tab.
pub struct SyncAgent<S: MetadataSource> {
    url: Url,
    source: S,
    policy: ReconnectPolicy,
    viewed: Option<PathBuf>,
    snapshot: Option<DocumentMeta>,
    state: AgentState,
    failures: u32,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl<S: MetadataSource> SyncAgent<S> {
    /// Create an agent for the given server URL. Returns the agent and
    /// the stream of notifications for the UI.
    pub fn new(
        url: Url,
        source: S,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                url,
                source,
                policy,
                viewed: None,
                snapshot: None,
                state: AgentState::Disconnected,
                failures: 0,
                events,
            },
            events_rx,
        )
    }

    /// Set the document this viewer has open. Clears the cached
    /// snapshot; it is re-fetched on the next connection or change.
    pub fn view(&mut self, path: PathBuf) {
        self.viewed = Some(path);
        self.snapshot = None;
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Drive the connection until `stop` fires (explicit app shutdown)
    /// or the reconnect cap is exhausted.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Result<(), SyncError> {
        loop {
            self.set_state(AgentState::Connecting);

            let attempt = tokio::select! {
                _ = &mut stop => {
                    self.set_state(AgentState::Disconnected);
                    return Ok(());
                }
                attempt = tokio_tungstenite::connect_async(self.url.as_str()) => attempt,
            };

            match attempt {
                Ok((ws, _)) => {
                    // A single success resets the consecutive-failure
                    // counter.
                    self.failures = 0;
                    self.set_state(AgentState::Connected);
                    info!("connected to {}", self.url);

                    // Close any gap missed while disconnected before
                    // resuming event-driven updates.
                    if let Some(path) = self.viewed.clone() {
                        if let Err(err) = self.refresh_snapshot(&path).await {
                            warn!("snapshot refresh failed: {}", err);
                        }
                    }

                    match self.session(ws, &mut stop).await {
                        SessionEnd::Stopped => {
                            self.set_state(AgentState::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Dropped => {
                            self.set_state(AgentState::Disconnected);
                            if self.register_failure() {
                                return Err(SyncError::ReconnectExhausted {
                                    attempts: self.failures,
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!("connect failed: {}", err);
                    if self.register_failure() {
                        return Err(SyncError::ReconnectExhausted {
                            attempts: self.failures,
                        });
                    }
                }
            }

            // Fixed backoff interval between attempts.
            tokio::select! {
                _ = &mut stop => {
                    self.set_state(AgentState::Disconnected);
                    return Ok(());
                }
                _ = sleep(self.policy.interval) => {}
            }
        }
    }

    /// Count one consecutive failure; returns true when the cap is
    /// reached and the agent must go terminally offline.
    fn register_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            warn!(
                "reconnect cap reached after {} attempts, going offline",
                self.failures
            );
            self.set_state(AgentState::Offline);
            let _ = self.events.send(AgentEvent::Offline);
            true
        } else {
            false
        }
    }

    async fn session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        stop: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (_write, mut read) = ws.split();
        loop {
            tokio::select! {
                _ = &mut *stop => return SessionEnd::Stopped,
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ServerMessage::FileChanged { path, kind }) =
                            serde_json::from_str::<ServerMessage>(&text)
                        {
                            debug!("fileChanged {} {}", kind, path);
                            self.on_file_changed(Path::new(&path)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("socket error: {}", err);
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }

    /// Compare a broadcast change against the viewed document and
    /// raise a diff notification when watched fields differ.
    async fn on_file_changed(&mut self, changed: &Path) {
        let Some(viewed) = self.viewed.clone() else {
            return;
        };
        if viewed != changed {
            return;
        }
        let new = match self.source.get_metadata(&viewed).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!("metadata fetch for {} failed: {}", viewed.display(), err);
                return;
            }
        };
        if let Some(old) = &self.snapshot {
            let diff = diff_meta(old, &new);
            if !diff.is_empty() {
                let _ = self.events.send(AgentEvent::Diff {
                    path: viewed.clone(),
                    diff,
                });
            }
        }
        // Always replace the cached snapshot, diff or not, so the next
        // comparison is against the latest truth.
        self.snapshot = Some(new);
    }

    async fn refresh_snapshot(&mut self, path: &Path) -> Result<()> {
        self.snapshot = Some(self.source.get_metadata(path).await?);
        Ok(())
    }

    fn set_state(&mut self, state: AgentState) {
        if self.state != state {
            self.state = state;
            let _ = self.events.send(AgentEvent::StateChanged(state));
        }
    }
}
