// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source log tailing.
//!
//! [`LogTailer`] turns repeated `range(next, ∞)` reads into an endless,
//! strictly ordered sequence of transactions starting at `resume_from`:
//!
//! ```text
//!         ┌──────────── range(next, ∞) ◄────────────┐
//!         ▼                                         │
//!   empty? ── yes ──► sleep(poll_interval) ─────────┤
//!     │                                             │
//!     no                                            │
//!     ▼                                             │
//!   drop t < next (already emitted), buffer rest    │
//!     ▼                                             │
//!   emit one by one, next = last.t + 1 ─────────────┘
//! ```
//!
//! # Failure Handling
//!
//! A failed read is never terminal: the tailer backs off with
//! [`RetryConfig`] and retries the same position.
//!
//! # Stopping
//!
//! The stop flag is checked before every read and interrupts poll and
//! backoff sleeps. A read already in flight is allowed to finish; its
//! results are discarded rather than emitted.

use crate::error::MirrorError;
use crate::metrics;
use crate::model::{Transaction, TxId};
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::store::TransactionLog;
use futures::Stream;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// Pulls transactions from a source log in `t` order.
pub struct LogTailer<L: TransactionLog> {
    log: L,
    next: TxId,
    poll_interval: Duration,
    retry: RetryConfig,
    buffer: VecDeque<Transaction>,
    consecutive_errors: usize,
    pair: String,
}

impl<L: TransactionLog> LogTailer<L> {
    /// Tail `log` from `resume_from` (inclusive), or from the earliest history.
    pub fn new(log: L, resume_from: Option<TxId>, poll_interval: Duration) -> Self {
        Self {
            log,
            next: resume_from.unwrap_or(TxId(0)),
            poll_interval,
            retry: RetryConfig::default(),
            buffer: VecDeque::new(),
            consecutive_errors: 0,
            pair: String::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Label used for metrics and logs.
    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = pair.into();
        self
    }

    /// Next `t` the tailer will ask the log for.
    pub fn position(&self) -> TxId {
        self.next
    }

    /// Wait for the next transaction.
    ///
    /// Returns `None` once `shutdown` is raised.
    pub async fn next_transaction(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Transaction> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(tx) = self.buffer.pop_front() {
                return Some(tx);
            }

            let read_start = Instant::now();
            match self.log.range(self.next, None).await {
                Ok(batch) => {
                    metrics::record_read_latency(&self.pair, read_start.elapsed());
                    if self.consecutive_errors > 0 {
                        info!(
                            attempts = self.consecutive_errors,
                            next = %self.next,
                            "Source log readable again"
                        );
                        self.consecutive_errors = 0;
                    }
                    self.accept(batch);

                    if self.buffer.is_empty() {
                        metrics::record_idle_poll(&self.pair);
                        if !sleep_or_shutdown(self.poll_interval, shutdown).await {
                            return None;
                        }
                    }
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    let delay = self.retry.delay_for_attempt(self.consecutive_errors);
                    let error = MirrorError::source_read("log.range", e);
                    warn!(
                        error = %error,
                        next = %self.next,
                        attempt = self.consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Source read failed, backing off"
                    );
                    metrics::record_source_read_error(&self.pair, "log.range");
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Buffer the part of `batch` not yet emitted and advance `next`.
    fn accept(&mut self, batch: Vec<Transaction>) {
        let mut duplicates = 0usize;
        let mut accepted = 0usize;
        for tx in batch {
            if tx.t < self.next {
                duplicates += 1;
                continue;
            }
            self.next = tx.t.next();
            self.buffer.push_back(tx);
            accepted += 1;
        }
        if duplicates > 0 {
            warn!(
                duplicates,
                next = %self.next,
                "Log range returned already-emitted transactions, dropping them"
            );
            metrics::record_transactions_duplicate(&self.pair, duplicates);
        }
        if accepted > 0 {
            debug!(accepted, next = %self.next, "Read transactions from source log");
            metrics::record_transactions_read(&self.pair, accepted);
        }
    }

    /// The tail as a lazy stream that ends when `shutdown` is raised.
    pub fn into_stream(self, shutdown: watch::Receiver<bool>) -> impl Stream<Item = Transaction> {
        futures::stream::unfold((self, shutdown), |(mut tailer, mut shutdown)| async move {
            let tx = tailer.next_transaction(&mut shutdown).await?;
            Some((tx, (tailer, shutdown)))
        })
    }

    /// Forward the tail into `sender` until stopped or the receiver is gone.
    pub async fn run(mut self, sender: mpsc::Sender<Transaction>, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("tail", pair = %self.pair, from = %self.next);

        async move {
            info!("Starting log tailer");

            while let Some(tx) = self.next_transaction(&mut shutdown).await {
                let t = tx.t;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        debug!(t = %t, "Stop requested while handing off transaction");
                        break;
                    }
                    sent = sender.send(tx) => {
                        if sent.is_err() {
                            debug!(t = %t, "Consumer gone, stopping tailer");
                            break;
                        }
                    }
                }
            }

            info!(next = %self.next, "Log tailer stopped");
        }
        .instrument(span)
        .await
    }
}
