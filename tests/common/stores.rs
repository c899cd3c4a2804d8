//! Store wrappers that inject failures and record calls.
//!
//! Both wrap a [`MemoryStore`] and delegate everything else to it.

use mirror_engine::memory::{MemoryLog, MemorySnapshot, MemoryStore};
use mirror_engine::model::{CommitBatch, CommitReceipt, Transaction, TxId};
use mirror_engine::store::{BoxFuture, DestinationStore, SourceStore, StoreError, TransactionLog};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consume one injected failure, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// FlakySource
// =============================================================================

/// Source whose log reads, snapshots and log opens fail on demand.
///
/// # Example
/// ```rust,ignore
/// let source = FlakySource::new(store.clone());
/// source.fail_next_ranges(3);
/// // The tailer backs off three times, then reads normally.
/// ```
pub struct FlakySource {
    inner: MemoryStore,
    range_failures: Arc<AtomicUsize>,
    snapshot_failures: AtomicUsize,
    open_failures: AtomicUsize,
    snapshot_calls: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            range_failures: Arc::new(AtomicUsize::new(0)),
            snapshot_failures: AtomicUsize::new(0),
            open_failures: AtomicUsize::new(0),
            snapshot_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_ranges(&self, n: usize) {
        self.range_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_snapshots(&self, n: usize) {
        self.snapshot_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.open_failures.store(n, Ordering::SeqCst);
    }

    /// Injected failures not yet consumed, across all operations.
    pub fn pending_failures(&self) -> usize {
        self.range_failures.load(Ordering::SeqCst)
            + self.snapshot_failures.load(Ordering::SeqCst)
            + self.open_failures.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }
}

pub struct FlakyLog {
    inner: MemoryLog,
    failures: Arc<AtomicUsize>,
}

impl TransactionLog for FlakyLog {
    fn range(&self, from: TxId, to: Option<TxId>) -> BoxFuture<'_, Vec<Transaction>> {
        Box::pin(async move {
            if take_failure(&self.failures) {
                return Err(StoreError::new("injected range failure"));
            }
            self.inner.range(from, to).await
        })
    }
}

impl SourceStore for FlakySource {
    type Log = FlakyLog;
    type Snapshot = MemorySnapshot;

    fn open_log(&self) -> BoxFuture<'_, FlakyLog> {
        Box::pin(async move {
            if take_failure(&self.open_failures) {
                return Err(StoreError::new("injected open failure"));
            }
            Ok(FlakyLog {
                inner: SourceStore::open_log(&self.inner).await?,
                failures: Arc::clone(&self.range_failures),
            })
        })
    }

    fn snapshot_at(&self, t: TxId) -> BoxFuture<'_, MemorySnapshot> {
        Box::pin(async move {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.snapshot_failures) {
                return Err(StoreError::new("injected snapshot failure"));
            }
            self.inner.snapshot_at(t).await
        })
    }
}

// =============================================================================
// RecordingDestination
// =============================================================================

/// One observed commit boundary, keyed by source `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitEvent {
    Started(Option<TxId>),
    Finished(Option<TxId>),
    Failed(Option<TxId>),
}

/// Destination that records commit start/finish order.
pub struct RecordingDestination {
    inner: MemoryStore,
    events: Mutex<Vec<CommitEvent>>,
    fail_at: Mutex<Option<TxId>>,
    commit_delay: Duration,
}

impl RecordingDestination {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            events: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
            commit_delay: Duration::ZERO,
        }
    }

    /// Each commit sleeps `delay` before applying.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    /// Reject the batch translated from source transaction `t`.
    pub fn fail_at(&self, t: TxId) {
        *self.fail_at.lock().unwrap() = Some(t);
    }

    pub fn events(&self) -> Vec<CommitEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Source `t`s of successful commits, in commit order.
    pub fn committed(&self) -> Vec<TxId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CommitEvent::Finished(Some(t)) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn push(&self, event: CommitEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl DestinationStore for RecordingDestination {
    type Snapshot = MemorySnapshot;

    fn snapshot(&self) -> BoxFuture<'_, MemorySnapshot> {
        self.inner.snapshot()
    }

    fn commit(&self, batch: CommitBatch) -> BoxFuture<'_, CommitReceipt> {
        Box::pin(async move {
            let source_t = batch.source_t;
            self.push(CommitEvent::Started(source_t));
            if !self.commit_delay.is_zero() {
                tokio::time::sleep(self.commit_delay).await;
            }

            let injected = source_t.is_some() && *self.fail_at.lock().unwrap() == source_t;
            if injected {
                self.push(CommitEvent::Failed(source_t));
                return Err(StoreError::new("injected commit failure"));
            }

            let result = self.inner.commit(batch).await;
            self.push(match result {
                Ok(_) => CommitEvent::Finished(source_t),
                Err(_) => CommitEvent::Failed(source_t),
            });
            result
        })
    }
}
