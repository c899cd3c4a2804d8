//! # Mirror Engine
//!
//! Continuous one-way replication of a transaction-log database into a second,
//! independently-identified database of the same model.
//!
//! ## Architecture
//!
//! Entity ids are local to a store, so nothing can be copied verbatim. Every
//! source transaction is re-expressed in terms of identities both sides agree
//! on (global names, or a synthetic attribute carrying the source id) and
//! committed to the destination as a single upsert batch:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          ReplicationController                            │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────────────┐    ┌─────────────────────┐   │
//! │  │ LogTailer   │───►│ TransactionTranslator│───►│ destination.commit  │   │
//! │  │ (range poll)│    │  IdentityResolver    │    │ (one batch per t)   │   │
//! │  └─────────────┘    │  rewrite_value       │    └─────────────────────┘   │
//! │         ▲           └──────────────────────┘               │              │
//! │         │                                                  ▼              │
//! │  ┌─────────────┐                                 ┌─────────────────────┐  │
//! │  │ source log  │                                 │ ResumeStore         │  │
//! │  │             │                                 │ (SQLite, optional)  │  │
//! │  └─────────────┘                                 └─────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transactions are applied strictly in source order, one at a time. The first
//! one is preceded by an [`InitHook`](init::InitHook) that installs the
//! synthetic identity attribute. Any translation or commit failure halts the
//! loop at that transaction; nothing after it is applied.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_engine::{MemoryStore, MirrorConfig, ReplicationController};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = Arc::new(MemoryStore::new());
//!     let destination = Arc::new(MemoryStore::new());
//!     let config = MirrorConfig {
//!         source_id: "prod".into(),
//!         destination_id: "dr".into(),
//!         ..Default::default()
//!     };
//!
//!     let mut controller = ReplicationController::with_default_hooks(config, source, destination);
//!     controller.start().await.expect("Failed to start");
//!
//!     // Mirrors until stopped
//!     controller.stop().await.expect("Replication halted");
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod identity;
pub mod init;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod resilience;
pub mod rewrite;
pub mod store;
pub mod tailer;
pub mod translate;

// Re-exports for convenience
pub use config::{IdentityConfig, InitConfig, MirrorConfig, ReadRetryConfig, ResumeStoreConfig};
pub use coordinator::{ControllerState, HaltReport, MirrorHooks, ReplicationController, ReplicationStatus};
pub use cursor::ResumeStore;
pub use error::{MirrorError, Result};
pub use identity::{default_identity, IdentityFn, IdentityResolver};
pub use init::{InitHook, NoInit, SyntheticAttributeInit};
pub use memory::MemoryStore;
pub use model::{EntityId, Fact, LookupKey, Transaction, TxId, Value};
pub use store::{DestinationStore, SourceStore, StoreError, TransactionLog};
pub use tailer::LogTailer;
pub use translate::{SkipPredicate, TransactionTranslator};
