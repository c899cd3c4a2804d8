// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication controller.
//!
//! The orchestrator that ties together:
//! - Log tailing via [`crate::tailer::LogTailer`]
//! - Translation via [`crate::translate::TransactionTranslator`]
//! - Destination bootstrap via [`crate::init::InitHook`]
//! - Position persistence and leasing via [`crate::cursor::ResumeStore`]
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────── tail task ────────────┐      ┌────────── consume task ───────────┐
//!  │ source.open_log()  (retried)      │      │ init (once)                       │
//!  │ LogTailer::run ──────────────────────────►│ translate → commit → position     │
//!  └───────────────────────────────────┘ mpsc └───────────────────────────────────┘
//!                      ▲                                     │ fatal error
//!                      │           shutdown (watch<bool>)     ▼
//!                      └──────────────── stop() / Shared::fail()
//!
//!  lease task (resume store only): renew every ttl/3 until the consumer drains, halt on loss
//! ```
//!
//! A fatal error anywhere moves the controller to `Failed` and trips the
//! shutdown flag, so the tailer stops reading too. `stop()` then releases the
//! lease, closes the resume store and hands the error back.
//!
//! # Draining
//!
//! `stop()` waits for the consume task without a deadline: a dequeued
//! transaction is committed and its position recorded before the lease is
//! released. The lease keeps renewing until then. Only the tail and lease
//! tasks are abandoned after [`DRAIN_TIMEOUT`].

mod consume;
mod types;

pub use types::{ControllerState, HaltReport, MirrorHooks, ReplicationStatus};

use crate::config::MirrorConfig;
use crate::cursor::{holder_id, ResumeStore};
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::model::{Transaction, TxId};
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::store::{DestinationStore, SourceStore};
use crate::tailer::LogTailer;
use crate::translate::TransactionTranslator;
use consume::Consumer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long `stop()` waits for the tail and lease tasks, and how often it
/// reports a consume task still committing.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between the controller and its tasks.
pub(crate) struct Shared {
    pair: String,
    state_tx: watch::Sender<ControllerState>,
    shutdown_tx: watch::Sender<bool>,
    position_tx: watch::Sender<Option<TxId>>,
    applied: AtomicU64,
    halt: RwLock<Option<HaltReport>>,
    /// First fatal error, returned from `stop()`.
    error: Mutex<Option<MirrorError>>,
}

impl Shared {
    fn set_state(&self, state: ControllerState) {
        self.state_tx.send_replace(state);
        metrics::set_controller_state(&self.pair, &state.to_string());
    }

    /// Halt replication. The first error wins.
    async fn fail(&self, err: MirrorError) {
        let report = HaltReport {
            t: err.failed_transaction(),
            cause: err.to_string(),
        };
        error!(t = ?report.t, error = %err, "Replication halted");

        {
            let mut slot = self.error.lock().await;
            if slot.is_none() {
                *self.halt.write().await = Some(report);
                *slot = Some(err);
            }
        }

        if *self.state_tx.borrow() == ControllerState::Running {
            self.set_state(ControllerState::Failed);
        }
        self.shutdown_tx.send_replace(true);
    }
}

/// Where the tailer starts: explicit config wins, then the stored position.
pub fn resolve_resume_point(explicit: Option<TxId>, stored: Option<TxId>) -> Option<TxId> {
    explicit.or_else(|| stored.map(TxId::next))
}

/// Mirrors one source store into one destination store.
///
/// The controller starts in `Created` state. Call [`start()`](Self::start)
/// to begin replication and [`stop()`](Self::stop) to end it.
pub struct ReplicationController<S: SourceStore, D: DestinationStore> {
    config: MirrorConfig,
    source: Arc<S>,
    destination: Arc<D>,
    hooks: MirrorHooks<D>,

    shared: Arc<Shared>,
    state_rx: watch::Receiver<ControllerState>,
    position_rx: watch::Receiver<Option<TxId>>,
    shutdown_rx: watch::Receiver<bool>,

    /// Open while running with `resume_store.enabled`
    resume_store: Arc<RwLock<Option<ResumeStore>>>,
    lease_holder: String,

    tailer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    /// Renewal task and its own stop flag, raised once the consumer is done.
    lease: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl<S: SourceStore, D: DestinationStore> ReplicationController<S, D> {
    /// Create a controller with hooks derived from `config`.
    pub fn with_default_hooks(config: MirrorConfig, source: Arc<S>, destination: Arc<D>) -> Self {
        let hooks = MirrorHooks::from_config(&config);
        Self::new(config, source, destination, hooks)
    }

    /// Create a controller.
    ///
    /// # Arguments
    /// * `config` - Pair names, resume position, polling and resume store settings
    /// * `source` - Store to tail
    /// * `destination` - Store to write; this controller must be its only writer
    /// * `hooks` - Identity function, init hook and attribute filter
    pub fn new(config: MirrorConfig, source: Arc<S>, destination: Arc<D>, hooks: MirrorHooks<D>) -> Self {
        let (state_tx, state_rx) = watch::channel(ControllerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (position_tx, position_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            pair: config.pair_key(),
            state_tx,
            shutdown_tx,
            position_tx,
            applied: AtomicU64::new(0),
            halt: RwLock::new(None),
            error: Mutex::new(None),
        });

        Self {
            config,
            source,
            destination,
            hooks,
            shared,
            state_rx,
            position_rx,
            shutdown_rx,
            resume_store: Arc::new(RwLock::new(None)),
            lease_holder: holder_id(),
            tailer: None,
            consumer: None,
            lease: None,
        }
    }

    /// Get current controller state.
    pub fn state(&self) -> ControllerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ControllerState> {
        self.state_rx.clone()
    }

    /// Check if the controller is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ControllerState::Running)
    }

    /// Last fully replicated source `t`.
    pub fn resume_position(&self) -> Option<TxId> {
        *self.position_rx.borrow()
    }

    /// Get a receiver to watch the position advance.
    pub fn position_receiver(&self) -> watch::Receiver<Option<TxId>> {
        self.position_rx.clone()
    }

    /// The `pair` key used for resume positions, leases and metric labels.
    pub fn pair(&self) -> &str {
        &self.shared.pair
    }

    /// Why replication halted, if it did.
    pub async fn halt_report(&self) -> Option<HaltReport> {
        self.shared.halt.read().await.clone()
    }

    pub async fn status(&self) -> ReplicationStatus {
        ReplicationStatus {
            state: self.state(),
            position: self.resume_position(),
            applied: self.shared.applied.load(Ordering::Relaxed),
            halt: self.halt_report().await,
        }
    }

    /// Wait until the controller is `Failed` or `Stopped`.
    pub async fn halted(&self) -> ControllerState {
        let mut rx = self.state_rx.clone();
        let _ = rx
            .wait_for(|s| matches!(s, ControllerState::Failed | ControllerState::Stopped))
            .await;
        self.state()
    }

    /// Start replication.
    ///
    /// 1. Validates config
    /// 2. Opens the resume store and takes the pair's lease (if enabled)
    /// 3. Spawns the tailer, the consumption loop and the lease renewer
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ControllerState::Created {
            return Err(MirrorError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }
        self.config.validate()?;

        let pair = self.shared.pair.clone();
        info!(pair = %pair, "Starting replication controller");

        let stored = if self.config.resume_store.enabled {
            self.open_resume_store(&pair).await?
        } else {
            None
        };
        let resume_from = resolve_resume_point(self.config.resume_from_t(), stored);
        if let Some(position) = stored.filter(|_| self.config.resume_from.is_none()) {
            self.shared.position_tx.send_replace(Some(position));
        }

        // Tasks may fail as soon as they are spawned.
        self.shared.set_state(ControllerState::Running);

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        self.tailer = Some(self.spawn_tail_task(sender, resume_from));
        self.consumer = Some(self.spawn_consume_task(receiver));
        if self.config.resume_store.enabled {
            self.lease = Some(self.spawn_lease_task());
        }

        info!(
            pair = %pair,
            resume_from = ?resume_from,
            stored = ?stored,
            "Replication controller running"
        );
        Ok(())
    }

    /// Open the resume store, take the lease and read the stored position.
    async fn open_resume_store(&self, pair: &str) -> Result<Option<TxId>> {
        let settings = &self.config.resume_store;
        let store = ResumeStore::new(&settings.sqlite_path).await?;

        if !store.acquire_lease(pair, &self.lease_holder, settings.lease_ttl()).await? {
            metrics::record_lease_event(pair, "refused");
            let holder = store.lease_holder(pair).await.ok().flatten();
            warn!(pair = %pair, holder = ?holder, "Lease held by another replicator");
            store.close().await;
            return Err(MirrorError::LeaseUnavailable { pair: pair.to_string() });
        }
        metrics::record_lease_event(pair, "acquired");

        let stored = store.get(pair).await;
        info!(path = %settings.sqlite_path, stored = ?stored, "Resume store initialized");
        *self.resume_store.write().await = Some(store);
        Ok(stored)
    }

    fn spawn_tail_task(&self, sender: mpsc::Sender<Transaction>, resume_from: Option<TxId>) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let shared = Arc::clone(&self.shared);
        let retry = self.config.read_retry.retry_config();
        let poll_interval = self.config.poll_interval();
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let Some(log) = open_log(source.as_ref(), &retry, &shared.pair, &mut shutdown).await else {
                return;
            };
            LogTailer::new(log, resume_from, poll_interval)
                .with_retry(retry)
                .with_pair(shared.pair.clone())
                .run(sender, shutdown)
                .await;
        })
    }

    fn spawn_consume_task(&self, receiver: mpsc::Receiver<Transaction>) -> JoinHandle<()> {
        let consumer = Consumer {
            source: Arc::clone(&self.source),
            destination: Arc::clone(&self.destination),
            translator: TransactionTranslator::new(
                Arc::clone(&self.hooks.identity),
                Arc::clone(&self.hooks.skip_attribute),
                self.config.identity.synthetic_attribute.clone(),
                self.config.identity.partition_map.clone(),
            ),
            init: Arc::clone(&self.hooks.init),
            resume_store: Arc::clone(&self.resume_store),
            retry: self.config.read_retry.retry_config(),
            shared: Arc::clone(&self.shared),
            source_id: self.config.source_id.clone(),
            destination_id: self.config.destination_id.clone(),
            initialized: false,
        };
        let shutdown = self.shutdown_rx.clone();

        tokio::spawn(consumer.run(receiver, shutdown))
    }

    fn spawn_lease_task(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let resume_store = Arc::clone(&self.resume_store);
        let shared = Arc::clone(&self.shared);
        let holder = self.lease_holder.clone();
        let ttl = self.config.resume_store.lease_ttl();
        let interval = self.config.resume_store.renew_interval();
        let (stop_tx, mut stop) = watch::channel(false);

        let span = info_span!("lease", pair = %shared.pair);
        let handle = tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // First tick completes immediately; the lease was just taken.
                timer.tick().await;

                loop {
                    tokio::select! {
                        biased;
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                        _ = timer.tick() => {
                            let renewed = match resume_store.read().await.as_ref() {
                                Some(store) => store.acquire_lease(&shared.pair, &holder, ttl).await,
                                None => break,
                            };
                            match renewed {
                                Ok(true) => {
                                    metrics::record_lease_event(&shared.pair, "renewed");
                                    debug!("Lease renewed");
                                }
                                Ok(false) => {
                                    metrics::record_lease_event(&shared.pair, "lost");
                                    shared.fail(MirrorError::LeaseLost { pair: shared.pair.clone() }).await;
                                    break;
                                }
                                Err(e) => {
                                    metrics::record_lease_event(&shared.pair, "lost");
                                    warn!(error = %e, "Lease renewal failed");
                                    shared.fail(MirrorError::LeaseLost { pair: shared.pair.clone() }).await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        (stop_tx, handle)
    }

    /// Stop replication.
    ///
    /// A transaction already taken off the channel finishes (commit and
    /// position) before the loop exits, however long the commit takes. One
    /// still retrying its source snapshot is dropped unwritten and read again
    /// on the next start. No-op from `Created` or `Stopped`.
    /// Returns the fatal error if the loop had halted.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            ControllerState::Created | ControllerState::Stopped => return Ok(()),
            ControllerState::Running | ControllerState::Failed => {}
        }

        info!(pair = %self.shared.pair, "Stopping replication controller");
        self.shared.shutdown_tx.send_replace(true);

        if let Some(mut consumer) = self.consumer.take() {
            loop {
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut consumer).await {
                    Ok(Ok(())) => {
                        debug!(task = "consume", "Task completed gracefully");
                        break;
                    }
                    Ok(Err(e)) => {
                        self.shared
                            .fail(MirrorError::Internal(format!("consumption loop panicked: {}", e)))
                            .await;
                        break;
                    }
                    Err(_) => {
                        warn!(
                            position = ?self.resume_position(),
                            "Still waiting for the in-flight transaction to commit"
                        );
                    }
                }
            }
        }

        if let Some(tailer) = self.tailer.take() {
            drain("tail", tailer).await;
        }
        if let Some((stop_tx, lease)) = self.lease.take() {
            stop_tx.send_replace(true);
            drain("lease", lease).await;
        }

        if let Some(store) = self.resume_store.write().await.take() {
            match store.release_lease(&self.shared.pair, &self.lease_holder).await {
                Ok(()) => metrics::record_lease_event(&self.shared.pair, "released"),
                Err(e) => warn!(error = %e, "Failed to release lease"),
            }
            store.close().await;
        }

        self.shared.set_state(ControllerState::Stopped);
        info!(
            pair = %self.shared.pair,
            position = ?self.resume_position(),
            applied = self.shared.applied.load(Ordering::Relaxed),
            "Replication controller stopped"
        );

        match self.shared.error.lock().await.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Wait up to [`DRAIN_TIMEOUT`] for an auxiliary task, then abandon it.
async fn drain(task: &'static str, handle: JoinHandle<()>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(())) => debug!(task, "Task completed gracefully"),
        Ok(Err(e)) => warn!(task, error = %e, "Task panicked during shutdown"),
        Err(_) => warn!(task, "Task timed out during shutdown"),
    }
}

/// Open the source log, retrying until it works or we are stopped.
async fn open_log<S: SourceStore>(
    source: &S,
    retry: &RetryConfig,
    pair: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<S::Log> {
    let mut attempt = 0usize;
    loop {
        match source.open_log().await {
            Ok(log) => return Some(log),
            Err(e) => {
                attempt += 1;
                let delay = retry.delay_for_attempt(attempt);
                metrics::record_source_read_error(pair, "open_log");
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Failed to open source log");
                if !sleep_or_shutdown(delay, shutdown).await {
                    return None;
                }
            }
        }
    }
}
