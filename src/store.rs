// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store integration traits.
//!
//! The engine never opens connections itself. The host hands it one value
//! implementing [`SourceStore`] and one implementing [`DestinationStore`];
//! everything the engine needs from them is listed here.
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_engine::model::{CommitBatch, CommitReceipt, Transaction, TxId};
//! use mirror_engine::store::{BoxFuture, TransactionLog};
//!
//! struct HttpLog { /* ... */ }
//!
//! impl TransactionLog for HttpLog {
//!     fn range(&self, _from: TxId, _to: Option<TxId>) -> BoxFuture<'_, Vec<Transaction>> {
//!         Box::pin(async move { Ok(Vec::new()) })
//!     }
//! }
//! ```

use crate::model::{
    AttributeInfo, CommitBatch, CommitReceipt, EntityId, LookupKey, Partition, Transaction, TxId,
};
use std::future::Future;
use std::pin::Pin;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for store operations.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// Ordered access to a source transaction log.
pub trait TransactionLog: Send + Sync + 'static {
    /// Transactions with `from <= t` (and `t < to` when bounded), in `t` order.
    ///
    /// Must not block waiting for new transactions: an empty vector means
    /// nothing is ready yet.
    fn range(&self, from: TxId, to: Option<TxId>) -> BoxFuture<'_, Vec<Transaction>>;
}

/// Read-only view of the source as of some `t`.
pub trait SourceSnapshot: Send + Sync {
    /// Global name of an entity, if it has one.
    fn ident(&self, entity: EntityId) -> Option<String>;

    /// Attribute definition for an attribute entity.
    fn attribute(&self, attribute: EntityId) -> Option<AttributeInfo>;

    /// Partition the entity was allocated in.
    fn partition_of(&self, entity: EntityId) -> Partition;
}

/// What we need from the source store.
pub trait SourceStore: Send + Sync + 'static {
    type Log: TransactionLog;
    type Snapshot: SourceSnapshot + 'static;

    /// Open the transaction log for tailing.
    fn open_log(&self) -> BoxFuture<'_, Self::Log>;

    /// Snapshot including every transaction up to and including `t`.
    fn snapshot_at(&self, t: TxId) -> BoxFuture<'_, Self::Snapshot>;
}

/// Read-only view of the destination.
pub trait DestinationSnapshot: Send + Sync {
    /// Resolve a lookup key to an existing entity.
    fn lookup(&self, key: &LookupKey) -> Option<EntityId>;

    /// Attribute definition by global name.
    fn attribute_by_ident(&self, ident: &str) -> Option<AttributeInfo>;
}

/// What we need from the destination store.
///
/// The engine is the only writer through this handle, and it commits one
/// batch at a time, so implementations need no locking on our behalf.
pub trait DestinationStore: Send + Sync + 'static {
    type Snapshot: DestinationSnapshot + 'static;

    /// Current snapshot (reflects every commit that has returned).
    fn snapshot(&self) -> BoxFuture<'_, Self::Snapshot>;

    /// Commit a batch atomically, resolving placeholders.
    ///
    /// On error nothing from the batch may be visible.
    fn commit(&self, batch: CommitBatch) -> BoxFuture<'_, CommitReceipt>;
}
