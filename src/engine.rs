//! The sync engine: one owned instance wiring the whole pipeline.
//!
//! Filesystem events flow registry → coalescer → hub; each stage is a
//! task reading from its inbound channel, so the pipeline can be
//! driven by synthetic events in tests (or by embedders) without a
//! real filesystem or socket.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coalescer::{Coalescer, CoalescerCommand};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::hub::BroadcastHub;
use crate::protocol::RawChangeEvent;
use crate::registry::{DocumentFilter, WatchRegistry};
use crate::shutdown::ShutdownCoordinator;

/// Capacity of the raw-event channel between the watcher callback
/// thread and the async pipeline.
const RAW_QUEUE_CAPACITY: usize = 10_000;

/// Owns the watch registry, coalescer and broadcast hub, with
/// construction and teardown tied to process lifecycle.
pub struct SyncEngine {
    config: SyncConfig,
    registry: Arc<WatchRegistry>,
    hub: Arc<BroadcastHub>,
    raw_tx: mpsc::Sender<RawChangeEvent>,
    coalescer_tx: mpsc::Sender<CoalescerCommand>,
    coalescer_task: JoinHandle<()>,
    forward_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl SyncEngine {
    /// Validate the configuration, wire the pipeline and activate the
    /// configured roots. Roots that fail to subscribe are kept as
    /// desired-but-unwatched and logged; only having no usable roots
    /// at all is fatal.
    pub fn start(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;

        let hub = Arc::new(BroadcastHub::new(config.session_queue_depth));

        let (raw_tx, mut raw_rx) = mpsc::channel::<RawChangeEvent>(RAW_QUEUE_CAPACITY);
        let (coalesced_tx, mut coalesced_rx) = mpsc::channel(1024);
        let (coalescer_tx, coalescer_task) =
            Coalescer::spawn(config.quiet_window(), coalesced_tx);

        // Raw events into the coalescer.
        let forward_task = tokio::spawn({
            let coalescer_tx = coalescer_tx.clone();
            async move {
                while let Some(event) = raw_rx.recv().await {
                    if coalescer_tx
                        .send(CoalescerCommand::Event(event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        // Coalesced changes out to every session. This pump is the
        // single consumer of the coalescer's output, which preserves
        // emission order end to end.
        let pump_task = tokio::spawn({
            let hub = hub.clone();
            async move {
                while let Some(change) = coalesced_rx.recv().await {
                    hub.broadcast(&change);
                }
            }
        });

        let filter = DocumentFilter::new(config.include_extensions.clone());
        let registry = Arc::new(
            WatchRegistry::new(filter, raw_tx.clone())
                .map_err(|err| SyncError::Config(format!("failed to create watcher: {err}")))?,
        );

        for root in &config.roots {
            if let Err(err) = registry.activate(root) {
                warn!("{} (will stay desired-but-unwatched)", err);
            }
        }

        info!(
            "sync engine started: {} root(s), quiet window {}ms",
            config.roots.len(),
            config.quiet_window_ms
        );

        Ok(Self {
            config,
            registry,
            hub,
            raw_tx,
            coalescer_tx,
            coalescer_task,
            forward_task,
            pump_task,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    pub fn registry(&self) -> Arc<WatchRegistry> {
        self.registry.clone()
    }

    /// Sender for injecting synthetic raw events into the pipeline,
    /// bypassing the filesystem watcher.
    pub fn raw_events(&self) -> mpsc::Sender<RawChangeEvent> {
        self.raw_tx.clone()
    }

    /// Ordered teardown: stop watcher subscriptions, drain the
    /// coalescer, close every session, then stop the pipeline tasks.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        let coordinator = ShutdownCoordinator::new(self.config.shutdown_timeout());
        coordinator
            .run(
                self.registry,
                self.raw_tx,
                self.coalescer_tx,
                self.coalescer_task,
                self.forward_task,
                self.pump_task,
                self.hub,
            )
            .await
    }
}
