//! Path watch registry.
//!
//! Owns the set of watched document roots and keeps the OS-level
//! watcher's subscriptions in sync with it. A root whose subscription
//! fails (permissions, missing path) stays registered as
//! desired-but-unwatched until a retry succeeds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::protocol::{ChangeKind, RawChangeEvent};

/// Short pre-debounce absorbing OS event jitter (editors firing
/// several notifications per save). The real quiet-window coalescing
/// happens downstream in the coalescer.
const OS_DEBOUNCE: Duration = Duration::from_millis(50);

/// A directory tree under observation.
#[derive(Debug, Clone)]
pub struct WatchedRoot {
    pub path: PathBuf,
    /// False while the root is desired but its OS subscription could
    /// not be established.
    pub watched: bool,
}

/// Decides which paths count as managed document files.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    extensions: Vec<String>,
}

impl DocumentFilter {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    /// Skip hidden files, editor backups and temp files, and anything
    /// outside the managed extension list.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.contains('~') || name.ends_with(".tmp") {
            return false;
        }
        match path.extension() {
            Some(ext) => {
                let ext = ext.to_string_lossy();
                self.extensions.iter().any(|allowed| allowed.as_str() == ext)
            }
            None => false,
        }
    }
}

/// Registry of watched roots, feeding raw change events into the
/// pipeline through a bounded channel.
pub struct WatchRegistry {
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher, RecommendedCache>>>,
    roots: Mutex<Vec<WatchedRoot>>,
}

impl WatchRegistry {
    /// Create the registry with an OS watcher whose events are
    /// filtered and forwarded into `raw_tx`. Events are dropped (with
    /// a warning) rather than blocking the watcher thread when the
    /// channel is full.
    pub fn new(filter: DocumentFilter, raw_tx: mpsc::Sender<RawChangeEvent>) -> Result<Self> {
        let debouncer = new_debouncer(OS_DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for debounced in events {
                        let Some(kind) = map_kind(&debounced.event.kind) else {
                            continue;
                        };
                        for path in &debounced.event.paths {
                            if !filter.matches(path) {
                                continue;
                            }
                            let raw = RawChangeEvent::new(path.clone(), kind);
                            if raw_tx.try_send(raw).is_err() {
                                warn!(
                                    "dropped filesystem event for {}: pipeline backlog full",
                                    path.display()
                                );
                            }
                        }
                    }
                }
                Err(errors) => {
                    for err in errors {
                        warn!("watcher error: {}", err);
                    }
                }
            }
        })?;

        Ok(Self {
            debouncer: Mutex::new(Some(debouncer)),
            roots: Mutex::new(Vec::new()),
        })
    }

    /// Add a root and establish its OS subscription. Idempotent if the
    /// root is already watched; retries the subscription if the root
    /// is registered but unwatched. On failure the root stays in the
    /// registry as desired-but-unwatched.
    pub fn activate(&self, root: &Path) -> Result<(), SyncError> {
        if self
            .roots
            .lock()
            .iter()
            .any(|r| r.path == root && r.watched)
        {
            return Ok(());
        }

        let result = self.try_watch(root);
        let watched = result.is_ok();

        let mut roots = self.roots.lock();
        match roots.iter_mut().find(|r| r.path == root) {
            Some(existing) => existing.watched = watched,
            None => roots.push(WatchedRoot {
                path: root.to_path_buf(),
                watched,
            }),
        }
        drop(roots);

        match &result {
            Ok(()) => debug!("watching {}", root.display()),
            Err(err) => warn!("{}", err),
        }
        result
    }

    /// Remove a root and stop its OS subscription. No-op for roots
    /// that were never activated.
    pub fn deactivate(&self, root: &Path) {
        let entry = {
            let mut roots = self.roots.lock();
            match roots.iter().position(|r| r.path == root) {
                Some(pos) => roots.remove(pos),
                None => return,
            }
        };
        if entry.watched {
            if let Some(debouncer) = self.debouncer.lock().as_mut() {
                let _ = debouncer.unwatch(&entry.path);
            }
            debug!("unwatched {}", entry.path.display());
        }
    }

    /// Atomic swap for workspace changes: new subscriptions are
    /// established before old ones are torn down, so a non-empty new
    /// set never leaves a window with zero watched roots.
    pub fn replace_all(&self, new_roots: Vec<PathBuf>) -> Vec<SyncError> {
        let previous: Vec<PathBuf> = self.roots.lock().iter().map(|r| r.path.clone()).collect();

        let mut errors = Vec::new();
        for root in &new_roots {
            if let Err(err) = self.activate(root) {
                errors.push(err);
            }
        }
        for old in previous {
            if !new_roots.contains(&old) {
                self.deactivate(&old);
            }
        }
        errors
    }

    /// Stop every OS subscription. The logical root set is kept (all
    /// marked unwatched); no further raw events will be produced.
    pub fn stop(&self) {
        self.debouncer.lock().take();
        for root in self.roots.lock().iter_mut() {
            root.watched = false;
        }
        debug!("watch registry stopped");
    }

    /// Snapshot of the current root set.
    pub fn roots(&self) -> Vec<WatchedRoot> {
        self.roots.lock().clone()
    }

    fn try_watch(&self, path: &Path) -> Result<(), SyncError> {
        let mut guard = self.debouncer.lock();
        match guard.as_mut() {
            Some(debouncer) => debouncer
                .watch(path, RecursiveMode::Recursive)
                .map_err(|err| SyncError::WatchSubscription {
                    root: path.to_path_buf(),
                    reason: err.to_string(),
                }),
            None => Err(SyncError::WatchSubscription {
                root: path.to_path_buf(),
                reason: "watcher stopped".into(),
            }),
        }
    }
}

fn map_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn md_filter() -> DocumentFilter {
        DocumentFilter::new(vec!["md".to_string()])
    }

    fn new_registry() -> (WatchRegistry, mpsc::Receiver<RawChangeEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (WatchRegistry::new(md_filter(), tx).unwrap(), rx)
    }

    #[test]
    fn filter_accepts_only_managed_documents() {
        let filter = md_filter();
        assert!(filter.matches(Path::new("/docs/CAP-1.md")));
        assert!(!filter.matches(Path::new("/docs/notes.txt")));
        assert!(!filter.matches(Path::new("/docs/.CAP-1.md")));
        assert!(!filter.matches(Path::new("/docs/CAP-1.md~")));
        assert!(!filter.matches(Path::new("/docs/CAP-1.tmp")));
        assert!(!filter.matches(Path::new("/docs/README")));
    }

    #[tokio::test]
    async fn activate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (registry, _rx) = new_registry();

        registry.activate(dir.path()).unwrap();
        registry.activate(dir.path()).unwrap();

        let roots = registry.roots();
        assert_eq!(roots.len(), 1);
        assert!(roots[0].watched);
    }

    #[tokio::test]
    async fn failed_subscription_keeps_root_desired() {
        let (registry, _rx) = new_registry();

        let missing = Path::new("/docsync/does/not/exist");
        let err = registry.activate(missing).unwrap_err();
        assert!(!err.is_fatal());

        let roots = registry.roots();
        assert_eq!(roots.len(), 1);
        assert!(!roots[0].watched);
    }

    #[tokio::test]
    async fn deactivate_unknown_root_is_noop() {
        let (registry, _rx) = new_registry();
        registry.deactivate(Path::new("/never/activated"));
        assert!(registry.roots().is_empty());
    }

    #[tokio::test]
    async fn replace_all_swaps_the_root_set() {
        let old_dir = TempDir::new().unwrap();
        let new_dir = TempDir::new().unwrap();
        let (registry, _rx) = new_registry();

        registry.activate(old_dir.path()).unwrap();
        let errors = registry.replace_all(vec![new_dir.path().to_path_buf()]);
        assert!(errors.is_empty());

        let roots = registry.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].path, new_dir.path());
    }

    #[tokio::test]
    async fn stop_marks_all_roots_unwatched() {
        let dir = TempDir::new().unwrap();
        let (registry, _rx) = new_registry();

        registry.activate(dir.path()).unwrap();
        registry.stop();

        assert!(registry.roots().iter().all(|r| !r.watched));
        // Further activations cannot subscribe once stopped.
        assert!(registry.activate(dir.path()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emits_raw_events_for_document_writes() {
        let dir = TempDir::new().unwrap();
        let (registry, mut rx) = new_registry();
        registry.activate(dir.path()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::fs::write(dir.path().join("CAP-1.md"), "status: draft")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Filesystem notification timing varies by platform; only
        // assert on the event if one arrived.
        if let Ok(event) = rx.try_recv() {
            assert!(matches!(
                event.kind,
                ChangeKind::Created | ChangeKind::Modified
            ));
            assert_eq!(event.path.extension().unwrap(), "md");
        }
    }
}
