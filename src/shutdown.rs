//! Shutdown coordinator.
//!
//! Drives ordered, bounded-time teardown: (1) stop the OS-level watch
//! subscriptions so no new raw events are generated, (2) drain the
//! coalescer so pending-but-not-yet-fired changes are flushed instead
//! of silently dropped, (3) close every live session gracefully, then
//! (4) return once all sessions report closed or the timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::coalescer::CoalescerCommand;
use crate::error::SyncError;
use crate::hub::BroadcastHub;
use crate::protocol::RawChangeEvent;
use crate::registry::WatchRegistry;

/// Per-step budget for the flush and drain phases. Deliberately short;
/// the session-close phase gets the configured timeout.
const STEP_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ShutdownCoordinator {
    session_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(session_timeout: Duration) -> Self {
        Self { session_timeout }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        registry: Arc<WatchRegistry>,
        raw_tx: mpsc::Sender<RawChangeEvent>,
        coalescer_tx: mpsc::Sender<CoalescerCommand>,
        coalescer_task: JoinHandle<()>,
        forward_task: JoinHandle<()>,
        pump_task: JoinHandle<()>,
        hub: Arc<BroadcastHub>,
    ) -> Result<(), SyncError> {
        // Step 1: no new raw events.
        registry.stop();

        // Step 2: flush pending changes immediately rather than
        // waiting out their quiet windows.
        let (ack_tx, ack_rx) = oneshot::channel();
        if coalescer_tx
            .send(CoalescerCommand::Flush(ack_tx))
            .await
            .is_ok()
        {
            match timeout(STEP_TIMEOUT, ack_rx).await {
                Ok(Ok(flushed)) if flushed > 0 => {
                    info!("flushed {} pending change(s) at shutdown", flushed)
                }
                Ok(_) => {}
                Err(_) => warn!("coalescer flush timed out"),
            }
        }

        // Close the pipeline upstream-first so the pump drains the
        // flushed changes to sessions before we close them.
        drop(raw_tx);
        let _ = timeout(STEP_TIMEOUT, forward_task).await;
        drop(coalescer_tx);
        let _ = timeout(STEP_TIMEOUT, coalescer_task).await;
        let _ = timeout(STEP_TIMEOUT, pump_task).await;

        // Step 3: graceful close of every live session.
        hub.close_all();

        // Step 4: wait for the sessions to report closed, bounded by
        // the configured timeout. Outstanding sockets are forcibly
        // closed by process termination anyway.
        let deadline = tokio::time::Instant::now() + self.session_timeout;
        while hub.session_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                let err = SyncError::ShutdownTimeout {
                    open_sessions: hub.session_count(),
                };
                warn!("{}", err);
                return Err(err);
            }
            sleep(Duration::from_millis(25)).await;
        }

        info!("shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::SyncEngine;
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> SyncConfig {
        SyncConfig {
            roots: vec![root.path().to_path_buf()],
            quiet_window_ms: 100,
            shutdown_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_with_no_sessions_completes() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::start(test_config(&dir)).unwrap();
        assert_eq!(engine.config().quiet_window_ms, 100);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_flushes_pending_changes_to_sessions() {
        use crate::hub::OutboundFrame;
        use crate::protocol::{ChangeKind, RawChangeEvent};

        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::start(test_config(&dir)).unwrap();
        let hub = engine.hub();
        let (_id, mut rx) = hub.register();

        // Pending in the coalescer, quiet window not yet elapsed.
        engine
            .raw_events()
            .send(RawChangeEvent::new("/docs/CAP-9.md", ChangeKind::Modified))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The registered receiver never closes its socket, so the
        // coordinator times out on it; the flush must still have gone
        // out before the close frame.
        let result = engine.shutdown().await;
        assert!(matches!(
            result,
            Err(SyncError::ShutdownTimeout { open_sessions: 1 })
        ));

        let first = rx.recv().await.unwrap();
        match first {
            OutboundFrame::Text(text) => assert!(text.contains("CAP-9.md")),
            other => panic!("expected flushed change before close, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Close);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_stops_before_sessions_close() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::start(test_config(&dir)).unwrap();
        let registry = engine.registry();

        engine.shutdown().await.unwrap();
        assert!(registry.roots().iter().all(|r| !r.watched));
    }
}
