// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One-time destination bootstrap.
//!
//! Before the first replicated transaction is committed the destination must
//! know the synthetic identity attribute, otherwise new entities could not be
//! anchored. [`SyntheticAttributeInit`] installs it in its own transaction,
//! stamped slightly *before* the first replicated one so destination history
//! stays in source time order.
//!
//! The controller runs the hook once per instance. Re-running against an
//! already bootstrapped destination is a no-op because the hook checks for
//! the attribute first.

use crate::model::{
    Cardinality, CommitBatch, DestinationId, LookupKey, Partition, TempId, Transaction, TxOp,
    TxValue, Uniqueness, Value, ValueType, IDENT_ATTRIBUTE,
};
use crate::store::{BoxFuture, DestinationSnapshot, DestinationStore, StoreError, StoreResult};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default gap between the bootstrap commit and the first replicated transaction.
pub const DEFAULT_INIT_LEAD: Duration = Duration::from_millis(1);

/// Bootstrap run before the first translation.
pub trait InitHook<D: DestinationStore>: Send + Sync {
    fn init<'a>(&'a self, destination: &'a D, first: &'a Transaction) -> BoxFuture<'a, ()>;
}

/// Hook for destinations bootstrapped out of band.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInit;

impl<D: DestinationStore> InitHook<D> for NoInit {
    fn init<'a>(&'a self, _destination: &'a D, _first: &'a Transaction) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Definition of an attribute to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub ident: String,
    pub value_type: ValueType,
    pub cardinality: Cardinality,
    pub unique: Option<Uniqueness>,
    pub doc: Option<String>,
}

impl AttributeSpec {
    pub fn new(ident: impl Into<String>, value_type: ValueType, cardinality: Cardinality) -> Self {
        Self {
            ident: ident.into(),
            value_type,
            cardinality,
            unique: None,
            doc: None,
        }
    }

    pub fn unique(mut self, unique: Uniqueness) -> Self {
        self.unique = Some(unique);
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// The long, cardinality-one, unique-identity attribute holding source ids.
    pub fn synthetic_identity(ident: impl Into<String>) -> Self {
        Self::new(ident, ValueType::Long, Cardinality::One)
            .unique(Uniqueness::Identity)
            .doc("Entity id of the mirrored entity in the source store")
    }
}

fn existing(snapshot: &dyn DestinationSnapshot, ident: &str) -> StoreResult<DestinationId> {
    snapshot
        .lookup(&LookupKey::ident(ident))
        .map(DestinationId::Existing)
        .ok_or_else(|| StoreError(format!("destination has no {}", ident)))
}

/// Ops installing `spec` in `:db.part/db`, referencing the destination's own
/// type, cardinality and uniqueness entities.
pub fn install_attribute_ops(
    snapshot: &dyn DestinationSnapshot,
    spec: &AttributeSpec,
) -> StoreResult<Vec<TxOp>> {
    let attribute = DestinationId::Placeholder(TempId {
        partition: Partition::new(Partition::DB),
        index: -1,
    });

    let mut assertions = vec![
        (
            IDENT_ATTRIBUTE.to_string(),
            TxValue::Value(Value::Keyword(spec.ident.clone())),
        ),
        (
            ":db/valueType".to_string(),
            TxValue::Ref(existing(snapshot, spec.value_type.ident())?),
        ),
        (
            ":db/cardinality".to_string(),
            TxValue::Ref(existing(snapshot, spec.cardinality.ident())?),
        ),
    ];
    if let Some(unique) = spec.unique {
        assertions.push((
            ":db/unique".to_string(),
            TxValue::Ref(existing(snapshot, unique.ident())?),
        ));
    }
    if let Some(doc) = &spec.doc {
        assertions.push((":db/doc".to_string(), TxValue::Value(Value::String(doc.clone()))));
    }

    Ok(vec![
        TxOp::Upsert {
            target: attribute.clone(),
            assertions,
        },
        TxOp::Upsert {
            target: existing(snapshot, Partition::DB)?,
            assertions: vec![(":db.install/attribute".to_string(), TxValue::Ref(attribute))],
        },
    ])
}

/// Installs the synthetic identity attribute unless it is already present.
#[derive(Debug, Clone)]
pub struct SyntheticAttributeInit {
    pub attribute: String,
    pub lead: Duration,
}

impl SyntheticAttributeInit {
    pub fn new(attribute: impl Into<String>, lead: Duration) -> Self {
        Self {
            attribute: attribute.into(),
            lead,
        }
    }
}

impl<D: DestinationStore> InitHook<D> for SyntheticAttributeInit {
    fn init<'a>(&'a self, destination: &'a D, first: &'a Transaction) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let snapshot = destination.snapshot().await?;
            if let Some(found) = snapshot.attribute_by_ident(&self.attribute) {
                if found.value_type != ValueType::Long || found.unique != Some(Uniqueness::Identity) {
                    warn!(
                        attribute = %self.attribute,
                        value_type = found.value_type.ident(),
                        "Identity attribute exists with an unexpected definition"
                    );
                }
                debug!(attribute = %self.attribute, "Identity attribute already installed");
                return Ok(());
            }

            let ops = install_attribute_ops(&snapshot, &AttributeSpec::synthetic_identity(&self.attribute))?;
            let lead = chrono::Duration::from_std(self.lead)
                .map_err(|e| StoreError(format!("invalid init lead: {}", e)))?;
            let mut batch = CommitBatch::new(None, Some(first.timestamp - lead));
            batch.ops = ops;

            let receipt = destination.commit(batch).await?;
            info!(
                attribute = %self.attribute,
                t = %receipt.t,
                first_t = %first.t,
                "Installed identity attribute"
            );
            Ok(())
        })
    }
}
