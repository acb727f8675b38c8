//! Change event coalescer.
//!
//! Absorbs bursty raw filesystem events and emits a stable trickle of
//! coalesced changes: per distinct path, one pending slot and one
//! quiet-window timer. Every new event for a path re-arms its timer
//! and overwrites the pending kind (last write wins within the
//! window). Removals short-circuit the window and emit immediately.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::protocol::{ChangeKind, CoalescedChange, RawChangeEvent};

/// Default quiet window, matching the system's detection-latency budget.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(1000);

/// Inbound commands for the coalescer task.
#[derive(Debug)]
pub enum CoalescerCommand {
    /// A raw filesystem event to absorb.
    Event(RawChangeEvent),
    /// Flush every pending slot immediately (shutdown drain). Replies
    /// with the number of changes emitted.
    Flush(oneshot::Sender<usize>),
}

#[derive(Debug)]
struct PendingSlot {
    kind: ChangeKind,
    deadline: Instant,
}

/// Per-path debouncing state machine, driven by a command channel.
pub struct Coalescer {
    window: Duration,
    pending: HashMap<PathBuf, PendingSlot>,
    sequence: u64,
    out: mpsc::Sender<CoalescedChange>,
}

impl Coalescer {
    /// Spawn the coalescer task. Returns the command sender and the
    /// task handle; dropping the sender flushes pending slots and
    /// stops the task.
    pub fn spawn(
        window: Duration,
        out: mpsc::Sender<CoalescedChange>,
    ) -> (mpsc::Sender<CoalescerCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let coalescer = Self {
            window,
            pending: HashMap::new(),
            sequence: 0,
            out,
        };
        let task = tokio::spawn(coalescer.run(rx));
        (tx, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CoalescerCommand>) {
        loop {
            let next_deadline = self.pending.values().map(|slot| slot.deadline).min();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(CoalescerCommand::Event(event)) => self.absorb(event).await,
                    Some(CoalescerCommand::Flush(ack)) => {
                        let emitted = self.flush_all().await;
                        let _ = ack.send(emitted);
                    }
                    None => {
                        // Channel closed: final drain so late edits are
                        // not silently dropped.
                        self.flush_all().await;
                        break;
                    }
                },
                _ = async { sleep_until(next_deadline.unwrap()).await }, if next_deadline.is_some() => {
                    self.flush_due(Instant::now()).await;
                }
            }
        }
        debug!("coalescer stopped after {} emitted changes", self.sequence);
    }

    async fn absorb(&mut self, event: RawChangeEvent) {
        if event.kind == ChangeKind::Removed {
            // No value in waiting to coalesce a deletion: the removal
            // replaces any pending slot and fires without waiting.
            self.pending.remove(&event.path);
            self.emit(event.path, ChangeKind::Removed).await;
            return;
        }

        let deadline = Instant::now() + self.window;
        self.pending
            .entry(event.path)
            .and_modify(|slot| {
                slot.kind = event.kind;
                slot.deadline = deadline;
            })
            .or_insert(PendingSlot {
                kind: event.kind,
                deadline,
            });
    }

    async fn flush_due(&mut self, now: Instant) {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            if let Some(slot) = self.pending.remove(&path) {
                self.emit(path, slot.kind).await;
            }
        }
    }

    async fn flush_all(&mut self) -> usize {
        let pending: Vec<(PathBuf, PendingSlot)> = self.pending.drain().collect();
        let count = pending.len();
        for (path, slot) in pending {
            self.emit(path, slot.kind).await;
        }
        count
    }

    async fn emit(&mut self, path: PathBuf, kind: ChangeKind) {
        self.sequence += 1;
        let change = CoalescedChange {
            path,
            kind,
            sequence: self.sequence,
            window_closed_at: Utc::now(),
        };
        // A failed send affects only this change; other paths keep
        // their independent pending state.
        if let Err(err) = self.out.send(change).await {
            warn!("dropping coalesced change, downstream closed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const WINDOW: Duration = Duration::from_millis(1000);

    fn event(path: &str, kind: ChangeKind) -> CoalescerCommand {
        CoalescerCommand::Event(RawChangeEvent::new(path, kind))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_modifies_emits_once() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, _task) = Coalescer::spawn(WINDOW, out_tx);

        for _ in 0..10 {
            tx.send(event("/docs/CAP-1.md", ChangeKind::Modified)).await.unwrap();
            advance(Duration::from_millis(50)).await;
        }

        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.path, PathBuf::from("/docs/CAP-1.md"));
        assert_eq!(change.kind, ChangeKind::Modified);

        // Nothing else pending.
        advance(Duration::from_secs(5)).await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn last_kind_in_window_wins() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, _task) = Coalescer::spawn(WINDOW, out_tx);

        tx.send(event("/docs/EN-2.md", ChangeKind::Created)).await.unwrap();
        advance(Duration::from_millis(100)).await;
        tx.send(event("/docs/EN-2.md", ChangeKind::Modified)).await.unwrap();

        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Modified);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_short_circuits_pending_window() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, _task) = Coalescer::spawn(WINDOW, out_tx);

        tx.send(event("/docs/CAP-1.md", ChangeKind::Modified)).await.unwrap();
        advance(Duration::from_millis(10)).await;
        tx.send(event("/docs/CAP-1.md", ChangeKind::Removed)).await.unwrap();

        // The removal is emitted well before the quiet window elapses,
        // and the pending modify slot is replaced, not emitted.
        let change = timeout(Duration::from_millis(100), out_rx.recv())
            .await
            .expect("removal delayed by quiet window")
            .unwrap();
        assert_eq!(change.kind, ChangeKind::Removed);

        advance(Duration::from_secs(5)).await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn paths_coalesce_independently() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, _task) = Coalescer::spawn(WINDOW, out_tx);

        tx.send(event("/docs/a.md", ChangeKind::Modified)).await.unwrap();
        advance(Duration::from_millis(400)).await;
        tx.send(event("/docs/b.md", ChangeKind::Created)).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.path, PathBuf::from("/docs/a.md"));
        assert_eq!(second.path, PathBuf::from("/docs/b.md"));
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_drains_pending_immediately() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, _task) = Coalescer::spawn(WINDOW, out_tx);

        tx.send(event("/docs/a.md", ChangeKind::Modified)).await.unwrap();
        tx.send(event("/docs/b.md", ChangeKind::Modified)).await.unwrap();

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(CoalescerCommand::Flush(ack_tx)).await.unwrap();
        assert_eq!(ack_rx.await.unwrap(), 2);

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        let mut paths = vec![first.path, second.path];
        paths.sort();
        assert_eq!(paths, vec![PathBuf::from("/docs/a.md"), PathBuf::from("/docs/b.md")]);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_channel_drains_pending() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, task) = Coalescer::spawn(WINDOW, out_tx);

        tx.send(event("/docs/late-edit.md", ChangeKind::Modified)).await.unwrap();
        drop(tx);

        task.await.unwrap();
        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.path, PathBuf::from("/docs/late-edit.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_numbers_increase_monotonically() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tx, _task) = Coalescer::spawn(WINDOW, out_tx);

        for i in 0..5 {
            tx.send(event(&format!("/docs/{i}.md"), ChangeKind::Removed)).await.unwrap();
        }

        let mut last = 0;
        for _ in 0..5 {
            let change = out_rx.recv().await.unwrap();
            assert!(change.sequence > last);
            last = change.sequence;
        }
    }
}
