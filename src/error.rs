// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! Errors are categorized by the stage that produced them and carry the
//! source transaction (`t`) whenever one is involved, so an operator can see
//! exactly where replication halted.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `SourceRead` | Yes | Log range or snapshot read failed (tailer keeps polling) |
//! | `Translation` | No | A fact could not be mapped to the destination |
//! | `DestinationCommit` | No | Constraint violation or connectivity failure on commit |
//! | `Init` | No | Destination bootstrap failed |
//! | `ResumeStore` | No | Local SQLite errors (needs operator attention) |
//! | `PositionPersist` | No | Commit succeeded but the position could not be recorded |
//! | `LeaseUnavailable` | No | Another replicator holds the pair |
//! | `LeaseLost` | No | Our lease expired or was taken over |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Controller state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Halting
//!
//! Every non-retryable error raised by the consumption loop halts it. Nothing
//! after the failing transaction is applied, so resuming from the last
//! recorded position is always safe.

use crate::model::TxId;
use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while mirroring.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Reading from the source failed.
    ///
    /// Transient. The tailer backs off and retries the same position.
    #[error("Source read error ({operation}): {message}")]
    SourceRead { operation: String, message: String },

    /// A fact in transaction `t` cannot be mapped.
    ///
    /// Fatal for that transaction. Facts are never silently skipped.
    #[error("Translation error at t={t}: {message}")]
    Translation { t: TxId, message: String },

    /// The destination rejected or failed the batch for transaction `t`.
    ///
    /// Not retried automatically.
    #[error("Destination commit error at t={t}: {message}")]
    DestinationCommit { t: TxId, message: String },

    /// Destination bootstrap failed.
    #[error("Init error: {0}")]
    Init(String),

    /// SQLite error in the resume store.
    #[error("Resume store error: {0}")]
    ResumeStore(#[from] sqlx::Error),

    /// Transaction `t` committed but its position could not be recorded.
    #[error("Failed to persist resume position t={t}: {message}")]
    PositionPersist { t: TxId, message: String },

    /// Another replicator holds the lease for this source/destination pair.
    #[error("Lease for {pair} is held by another replicator")]
    LeaseUnavailable { pair: String },

    /// Our lease could not be renewed.
    #[error("Lease for {pair} was lost")]
    LeaseLost { pair: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong controller state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Create a source read error.
    pub fn source_read(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::SourceRead {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a translation error for transaction `t`.
    pub fn translation(t: TxId, message: impl Into<String>) -> Self {
        Self::Translation {
            t,
            message: message.into(),
        }
    }

    /// Create a commit error for transaction `t`.
    pub fn commit(t: TxId, message: impl ToString) -> Self {
        Self::DestinationCommit {
            t,
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceRead { .. } => true,
            Self::Translation { .. } => false,
            Self::DestinationCommit { .. } => false,
            Self::Init(_) => false,
            Self::ResumeStore(_) => false,
            Self::PositionPersist { .. } => false,
            Self::LeaseUnavailable { .. } => false,
            Self::LeaseLost { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// The source transaction the error is attributed to, if any.
    pub fn failed_transaction(&self) -> Option<TxId> {
        match self {
            Self::Translation { t, .. }
            | Self::DestinationCommit { t, .. }
            | Self::PositionPersist { t, .. } => Some(*t),
            _ => None,
        }
    }
}
