//! # Docsync - Real-Time Document Synchronization Engine
//!
//! Watches document roots for changes, coalesces bursty filesystem
//! events into one change per file per quiet window, and fans the
//! result out to every connected viewer session over WebSocket. Each
//! viewer runs a sync agent that detects disconnection, reconnects
//! with bounded backoff, and raises a field-level diff notification
//! when the document it has open changes.
//!
//! ## Pipeline
//!
//! ```text
//! filesystem → WatchRegistry → Coalescer → BroadcastHub → sessions
//!                                                            ↓
//!                                              SyncAgent → FieldDiff → UI
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docsync::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig {
//!         roots: vec!["./docs".into()],
//!         ..Default::default()
//!     };
//!     let engine = SyncEngine::start(config)?;
//!     // ... serve, then:
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod coalescer;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;

// Re-export main types for library consumers
pub use client::{AgentEvent, AgentState, MetadataSource, ReconnectPolicy, SyncAgent};
pub use config::SyncConfig;
pub use diff::{diff_meta, DocumentMeta, FieldDiff};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use hub::BroadcastHub;
pub use protocol::{ChangeKind, CoalescedChange, RawChangeEvent, ServerMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
