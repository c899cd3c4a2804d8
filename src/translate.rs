// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transaction translation.
//!
//! Turns one source [`Transaction`] into one destination [`CommitBatch`]:
//!
//! ```text
//! Fact ──► attribute lookup ──► skip? ──► resolve target ──► rewrite value
//!                                                              │
//!                         ┌────────────────────────────────────┘
//!                         ▼
//!           added?  ── yes ──► Upsert (grouped per target, first-appearance order)
//!                   ── no  ──► Retract (one per fact)
//!
//! then: every new placeholder, the transaction entity, and any entity found
//!       only by its source id gets its LookupKey asserted (identity anchor)
//! ```
//!
//! A placeholder in `:db.part/tx` can only mean a transaction mirrored
//! without its anchor. The destination would read it as the transaction being
//! committed, so translation fails instead.
//!
//! Schema facts are not special: installing an attribute is an ordinary set
//! of facts on a schema entity, which the resolver names by its `:db/ident`.
//!
//! The source `:db/txInstant` is carried as the batch's instant rather than
//! as an assertion, so the destination transaction records the source time.

use crate::error::{MirrorError, Result};
use crate::identity::{IdentityFn, IdentityResolver, PartitionMap};
use crate::model::{
    AttributeInfo, CommitBatch, DestinationId, Partition, Transaction, TxOp, TxValue, Value,
    TX_INSTANT_ATTRIBUTE,
};
use crate::rewrite::rewrite_value;
use crate::store::{DestinationSnapshot, SourceSnapshot};
use std::collections::HashMap;
use std::sync::Arc;

/// Decides whether facts on an attribute are left out of the mirror.
pub type SkipPredicate = Arc<dyn Fn(&AttributeInfo) -> bool + Send + Sync>;

/// Mirror every attribute.
pub fn skip_nothing() -> SkipPredicate {
    Arc::new(|_| false)
}

/// Per-transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationStats {
    pub facts: usize,
    pub skipped: usize,
    pub upserts: usize,
    pub retracts: usize,
    pub placeholders: usize,
}

/// Result of translating one transaction.
#[derive(Debug, Clone)]
pub struct Translation {
    pub batch: CommitBatch,
    pub stats: TranslationStats,
}

/// Stateless translator; all per-transaction state lives in the resolver.
pub struct TransactionTranslator {
    identity: IdentityFn,
    skip_attribute: SkipPredicate,
    synthetic_attribute: String,
    partitions: PartitionMap,
}

impl TransactionTranslator {
    pub fn new(
        identity: IdentityFn,
        skip_attribute: SkipPredicate,
        synthetic_attribute: impl Into<String>,
        partitions: PartitionMap,
    ) -> Self {
        Self {
            identity,
            skip_attribute,
            synthetic_attribute: synthetic_attribute.into(),
            partitions,
        }
    }

    pub fn synthetic_attribute(&self) -> &str {
        &self.synthetic_attribute
    }

    /// Translate `tx` against the source as of `tx.t` and the current destination.
    pub fn translate(
        &self,
        tx: &Transaction,
        source: &dyn SourceSnapshot,
        destination: &dyn DestinationSnapshot,
    ) -> Result<Translation> {
        let t = tx.t;
        let mut resolver = IdentityResolver::new(
            tx,
            source,
            destination,
            &self.identity,
            &self.synthetic_attribute,
            &self.partitions,
        );
        let mut batch = CommitBatch::new(Some(t), Some(tx.timestamp));
        let mut stats = TranslationStats::default();
        let mut ops: Vec<TxOp> = Vec::new();
        let mut upsert_slot: HashMap<DestinationId, usize> = HashMap::new();

        for fact in &tx.facts {
            stats.facts += 1;

            let attribute = source.attribute(fact.attribute).ok_or_else(|| {
                MirrorError::translation(
                    t,
                    format!(
                        "unknown attribute {} on entity {}",
                        fact.attribute, fact.entity
                    ),
                )
            })?;

            if fact.entity == tx.entity && attribute.ident == TX_INSTANT_ATTRIBUTE {
                if let (true, Value::Instant(instant)) = (fact.added, &fact.value) {
                    batch.tx_instant = Some(*instant);
                }
                continue;
            }

            if (self.skip_attribute)(&attribute) {
                stats.skipped += 1;
                continue;
            }

            if attribute.ident == self.synthetic_attribute {
                return Err(MirrorError::translation(
                    t,
                    format!(
                        "source fact on reserved identity attribute {} (entity {})",
                        attribute.ident, fact.entity
                    ),
                ));
            }

            let target = resolver.resolve(fact.entity).target.clone();
            let value = rewrite_value(&mut resolver, &attribute, &fact.value)?;

            if fact.added {
                match upsert_slot.get(&target) {
                    Some(&slot) => {
                        if let TxOp::Upsert { assertions, .. } = &mut ops[slot] {
                            assertions.push((attribute.ident, value));
                        }
                    }
                    None => {
                        upsert_slot.insert(target.clone(), ops.len());
                        ops.push(TxOp::Upsert {
                            target,
                            assertions: vec![(attribute.ident, value)],
                        });
                    }
                }
            } else {
                let value_missing = matches!(&value, TxValue::Ref(id) if id.is_placeholder());
                if target.is_placeholder() || value_missing {
                    return Err(MirrorError::translation(
                        t,
                        format!(
                            "retraction of {} on entity {} refers to an entity absent from the destination",
                            attribute.ident, fact.entity
                        ),
                    ));
                }
                ops.push(TxOp::Retract {
                    target,
                    attribute: attribute.ident,
                    value,
                });
            }
        }

        // The destination transaction is anchored even when no fact touches it.
        resolver.resolve(tx.entity);

        // Anchor new and renamed entities on their key so later transactions find them.
        for (entity, resolution) in resolver.arena().anchors() {
            if let DestinationId::Placeholder(tmp) = &resolution.target {
                if tmp.partition.as_str() == Partition::TX {
                    return Err(MirrorError::translation(
                        t,
                        format!(
                            "transaction entity {} has no counterpart in the destination",
                            entity
                        ),
                    ));
                }
            }
            let key = &resolution.key;
            let anchor = (key.attribute.clone(), TxValue::Value(key.value.clone()));
            match upsert_slot.get(&resolution.target) {
                Some(&slot) => {
                    if let TxOp::Upsert { assertions, .. } = &mut ops[slot] {
                        if !assertions.contains(&anchor) {
                            assertions.push(anchor);
                        }
                    }
                }
                None => {
                    upsert_slot.insert(resolution.target.clone(), ops.len());
                    ops.push(TxOp::Upsert {
                        target: resolution.target.clone(),
                        assertions: vec![anchor],
                    });
                }
            }
        }

        stats.placeholders = resolver.arena().placeholders().count();
        for op in &ops {
            match op {
                TxOp::Upsert { .. } => stats.upserts += 1,
                TxOp::Retract { .. } => stats.retracts += 1,
            }
        }
        batch.ops = ops;

        Ok(Translation { batch, stats })
    }
}
