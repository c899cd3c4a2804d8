// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Controller state types.
//!
//! Defines the state machine for the controller lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!            start()                    stop()
//! Created ───────────► Running ──────────────────► Stopped
//!    │                    │                           ▲
//!    │ stop() (no-op)     │ fatal error               │
//!    ▼                    ▼                    stop() │
//! Created              Failed ────────────────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationController::new()`. Nothing spawned.
//! - **Running**: Tailer and consumption loop are live.
//! - **Failed**: The loop halted on a fatal error. See [`HaltReport`]. Call `stop()`
//!   to release resources and collect the error.
//! - **Stopped**: Terminal. Resources released. A new controller is needed to resume.

use crate::config::MirrorConfig;
use crate::identity::{default_identity, IdentityFn};
use crate::init::{InitHook, NoInit, SyntheticAttributeInit};
use crate::model::TxId;
use crate::store::DestinationStore;
use crate::translate::{skip_nothing, SkipPredicate};
use std::sync::Arc;

/// State of the replication controller.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Controller created but not started.
    ///
    /// Call [`start()`](super::ReplicationController::start) to begin replication.
    Created,

    /// Running and replicating.
    Running,

    /// Stopped. Terminal.
    Stopped,

    /// The consumption loop halted on a fatal error.
    Failed,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Created => write!(f, "Created"),
            ControllerState::Running => write!(f, "Running"),
            ControllerState::Stopped => write!(f, "Stopped"),
            ControllerState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why and where replication halted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltReport {
    /// Source transaction that could not be applied, when one is involved.
    pub t: Option<TxId>,
    pub cause: String,
}

/// Point-in-time view of a controller, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub state: ControllerState,
    /// Last fully replicated source `t`.
    pub position: Option<TxId>,
    /// Transactions applied by this controller instance.
    pub applied: u64,
    pub halt: Option<HaltReport>,
}

/// Function-valued configuration, injected at construction.
pub struct MirrorHooks<D: DestinationStore> {
    pub identity: IdentityFn,
    pub init: Arc<dyn InitHook<D>>,
    pub skip_attribute: SkipPredicate,
}

impl<D: DestinationStore> MirrorHooks<D> {
    /// Default hooks for `config`: ident-or-synthetic identity, synthetic
    /// attribute bootstrap (unless disabled), skip nothing.
    pub fn from_config(config: &MirrorConfig) -> Self {
        let init: Arc<dyn InitHook<D>> = if config.init.enabled {
            Arc::new(SyntheticAttributeInit::new(
                config.identity.synthetic_attribute.clone(),
                config.init.lead_duration(),
            ))
        } else {
            Arc::new(NoInit)
        };
        Self {
            identity: default_identity(config.identity.synthetic_attribute.clone()),
            init,
            skip_attribute: skip_nothing(),
        }
    }

    pub fn with_identity(mut self, identity: IdentityFn) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_init(mut self, init: Arc<dyn InitHook<D>>) -> Self {
        self.init = init;
        self
    }

    pub fn with_skip_attribute(mut self, skip_attribute: SkipPredicate) -> Self {
        self.skip_attribute = skip_attribute;
        self
    }
}

impl<D: DestinationStore> Clone for MirrorHooks<D> {
    fn clone(&self) -> Self {
        Self {
            identity: Arc::clone(&self.identity),
            init: Arc::clone(&self.init),
            skip_attribute: Arc::clone(&self.skip_attribute),
        }
    }
}

impl<D: DestinationStore> Default for MirrorHooks<D> {
    fn default() -> Self {
        Self::from_config(&MirrorConfig::default())
    }
}
