// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumption loop: translate and commit transactions in source order.
//!
//! ```text
//! mpsc::Receiver<Transaction>
//!      │
//!      ├─► InitHook (first transaction only)
//!      ├─► source.snapshot_at(t)      retried, abandoned on stop
//!      ├─► destination.snapshot()
//!      ├─► TransactionTranslator::translate
//!      ├─► destination.commit(batch)  fatal on error
//!      └─► position = t, ResumeStore::record(pair, t)
//! ```
//!
//! Exactly one transaction is in flight at a time. The shutdown flag is only
//! checked between transactions (and during snapshot retries, before anything
//! has been written), so a stop never leaves a commit without its position.

use super::Shared;
use crate::cursor::ResumeStore;
use crate::error::{MirrorError, Result};
use crate::init::InitHook;
use crate::metrics;
use crate::model::{Transaction, TxId};
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::store::{DestinationStore, SourceStore};
use crate::translate::TransactionTranslator;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything the loop needs, moved into its task.
pub(super) struct Consumer<S: SourceStore, D: DestinationStore> {
    pub source: Arc<S>,
    pub destination: Arc<D>,
    pub translator: TransactionTranslator,
    pub init: Arc<dyn InitHook<D>>,
    pub resume_store: Arc<RwLock<Option<ResumeStore>>>,
    pub retry: RetryConfig,
    pub shared: Arc<Shared>,
    pub source_id: String,
    pub destination_id: String,
    pub initialized: bool,
}

impl<S: SourceStore, D: DestinationStore> Consumer<S, D> {
    pub async fn run(mut self, mut rx: mpsc::Receiver<Transaction>, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("mirror", source = %self.source_id, destination = %self.destination_id);

        async move {
            info!("Starting consumption loop");

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let tx = tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    next = rx.recv() => match next {
                        Some(tx) => tx,
                        None => {
                            debug!("Tailer closed the channel");
                            break;
                        }
                    },
                };

                if let Err(e) = self.apply(&tx, &mut shutdown).await {
                    self.shared.fail(e).await;
                    break;
                }
            }

            info!(
                applied = self.shared.applied.load(Ordering::Relaxed),
                "Consumption loop stopped"
            );
        }
        .instrument(span)
        .await
    }

    /// Apply one transaction. Returns `Ok` without applying if stopped while
    /// waiting on the source.
    async fn apply(&mut self, tx: &Transaction, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let t = tx.t;
        let pair = self.shared.pair.clone();

        if !self.initialized {
            self.init
                .init(self.destination.as_ref(), tx)
                .await
                .map_err(|e| MirrorError::Init(e.to_string()))?;
            self.initialized = true;
            debug!(first = %t, "Destination initialized");
        }

        let Some(source_snapshot) = self.source_snapshot(t, shutdown).await else {
            debug!(t = %t, "Stop requested while reading source snapshot");
            return Ok(());
        };
        let destination_snapshot = self
            .destination
            .snapshot()
            .await
            .map_err(|e| MirrorError::commit(t, format!("destination snapshot: {}", e)))?;

        let started = Instant::now();
        let translation = self
            .translator
            .translate(tx, &source_snapshot, &destination_snapshot)
            .inspect_err(|_| metrics::record_translation_failure(&pair))?;
        metrics::record_translation(&pair, &translation.stats, started.elapsed());

        let stats = translation.stats;
        debug!(
            t = %t,
            facts = stats.facts,
            skipped = stats.skipped,
            upserts = stats.upserts,
            retracts = stats.retracts,
            placeholders = stats.placeholders,
            "Translated transaction"
        );

        let started = Instant::now();
        let receipt = self
            .destination
            .commit(translation.batch)
            .await
            .map_err(|e| {
                metrics::record_commit_failure(&pair);
                MirrorError::commit(t, e)
            })?;
        metrics::record_commit(&pair, started.elapsed());

        self.shared.position_tx.send_replace(Some(t));
        self.shared.applied.fetch_add(1, Ordering::Relaxed);
        metrics::set_resume_position(&pair, t.0);

        if let Some(store) = self.resume_store.read().await.as_ref() {
            let persisted = store.record(&pair, t).await;
            metrics::record_position_persist(&pair, persisted.is_ok());
            persisted.map_err(|e| MirrorError::PositionPersist {
                t,
                message: e.to_string(),
            })?;
        }

        debug!(t = %t, destination_t = %receipt.t, "Applied transaction");
        Ok(())
    }

    async fn source_snapshot(&self, t: TxId, shutdown: &mut watch::Receiver<bool>) -> Option<S::Snapshot> {
        let mut attempt = 0usize;
        loop {
            match self.source.snapshot_at(t).await {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    metrics::record_source_read_error(&self.shared.pair, "snapshot_at");
                    warn!(
                        t = %t,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Source snapshot failed, backing off"
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }
}
