// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared data model for both sides of the mirror.
//!
//! Source stores produce [`Transaction`]s made of [`Fact`]s. The translator
//! turns them into a [`CommitBatch`] of [`TxOp`]s addressed with
//! [`DestinationId`]s, which the destination resolves at commit time.
//!
//! ```text
//! Fact(e, a, v, t, added) ──► LookupKey(attr, value) ──► DestinationId
//!                                                         ├── Existing(eid)
//!                                                         ├── Placeholder(TempId)
//!                                                         └── Transaction
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Global name attribute. Entities carrying it have a stable identity.
pub const IDENT_ATTRIBUTE: &str = ":db/ident";

/// Attribute holding a transaction's wall-clock instant.
pub const TX_INSTANT_ATTRIBUTE: &str = ":db/txInstant";

/// Store-local entity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction basis (`t`). Totally ordered within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl TxId {
    /// The position immediately after this one.
    pub fn next(self) -> TxId {
        TxId(self.0.saturating_add(1))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fact value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Long(i64),
    Boolean(bool),
    Keyword(String),
    Instant(DateTime<Utc>),
    /// Reference to another entity in the same store.
    Ref(EntityId),
}

impl Value {
    /// The value type this value belongs to.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Long(_) => ValueType::Long,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Keyword(_) => ValueType::Keyword,
            Value::Instant(_) => ValueType::Instant,
            Value::Ref(_) => ValueType::Ref,
        }
    }

    pub fn as_ref_id(&self) -> Option<EntityId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Long(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Keyword(k) => write!(f, "{}", k),
            Value::Instant(i) => write!(f, "#inst {}", i.to_rfc3339()),
            Value::Ref(id) => write!(f, "#ref {}", id),
        }
    }
}

/// One datom from a source transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub entity: EntityId,
    pub attribute: EntityId,
    pub value: Value,
    pub tx: TxId,
    /// `true` for an assertion, `false` for a retraction.
    pub added: bool,
}

/// An atomic, timestamped group of facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub t: TxId,
    /// The transaction's own entity (target of transaction metadata facts).
    pub entity: EntityId,
    pub timestamp: DateTime<Utc>,
    pub facts: Vec<Fact>,
}

/// Declared value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Long,
    Boolean,
    Keyword,
    Instant,
    Ref,
}

impl ValueType {
    /// Parse from a `:db.type/*` ident.
    pub fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            ":db.type/string" => Some(ValueType::String),
            ":db.type/long" => Some(ValueType::Long),
            ":db.type/boolean" => Some(ValueType::Boolean),
            ":db.type/keyword" => Some(ValueType::Keyword),
            ":db.type/instant" => Some(ValueType::Instant),
            ":db.type/ref" => Some(ValueType::Ref),
            _ => None,
        }
    }

    pub fn ident(&self) -> &'static str {
        match self {
            ValueType::String => ":db.type/string",
            ValueType::Long => ":db.type/long",
            ValueType::Boolean => ":db.type/boolean",
            ValueType::Keyword => ":db.type/keyword",
            ValueType::Instant => ":db.type/instant",
            ValueType::Ref => ":db.type/ref",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

impl Cardinality {
    pub fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            ":db.cardinality/one" => Some(Cardinality::One),
            ":db.cardinality/many" => Some(Cardinality::Many),
            _ => None,
        }
    }

    pub fn ident(&self) -> &'static str {
        match self {
            Cardinality::One => ":db.cardinality/one",
            Cardinality::Many => ":db.cardinality/many",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Uniqueness {
    Value,
    Identity,
}

impl Uniqueness {
    pub fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            ":db.unique/value" => Some(Uniqueness::Value),
            ":db.unique/identity" => Some(Uniqueness::Identity),
            _ => None,
        }
    }

    pub fn ident(&self) -> &'static str {
        match self {
            Uniqueness::Value => ":db.unique/value",
            Uniqueness::Identity => ":db.unique/identity",
        }
    }
}

/// Introspected attribute definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub id: EntityId,
    pub ident: String,
    pub value_type: ValueType,
    pub cardinality: Cardinality,
    pub unique: Option<Uniqueness>,
}

impl AttributeInfo {
    pub fn is_ref(&self) -> bool {
        self.value_type == ValueType::Ref
    }
}

/// Id-allocation namespace, named by its ident (e.g. `:db.part/user`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition(pub String);

impl Partition {
    pub const DB: &'static str = ":db.part/db";
    pub const TX: &'static str = ":db.part/tx";
    pub const USER: &'static str = ":db.part/user";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable `(attribute, value)` pair naming the same logical entity in both stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupKey {
    pub attribute: String,
    pub value: Value,
}

impl LookupKey {
    pub fn new(attribute: impl Into<String>, value: Value) -> Self {
        Self {
            attribute: attribute.into(),
            value,
        }
    }

    /// Key by global name (`:db/ident`).
    pub fn ident(name: impl Into<String>) -> Self {
        Self::new(IDENT_ATTRIBUTE, Value::Keyword(name.into()))
    }

    pub fn is_ident(&self) -> bool {
        self.attribute == IDENT_ATTRIBUTE
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.attribute, self.value)
    }
}

/// Placeholder identifier scoped to a partition, resolved by the destination at commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId {
    pub partition: Partition,
    /// Negative, unique within one commit batch.
    pub index: i64,
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#tempid[{} {}]", self.partition, self.index)
    }
}

/// Target identifier on the destination side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationId {
    /// Entity already present in the destination.
    Existing(EntityId),
    /// New entity, allocated at commit.
    Placeholder(TempId),
    /// The destination transaction being committed.
    Transaction,
}

impl DestinationId {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, DestinationId::Placeholder(_))
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationId::Existing(id) => write!(f, "{}", id),
            DestinationId::Placeholder(tmp) => write!(f, "{}", tmp),
            DestinationId::Transaction => f.write_str("#tx"),
        }
    }
}

/// A value addressed to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxValue {
    /// Non-reference value, passed through unchanged.
    Value(Value),
    /// Reference rewritten to a destination identifier.
    Ref(DestinationId),
}

impl fmt::Display for TxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxValue::Value(v) => write!(f, "{}", v),
            TxValue::Ref(id) => write!(f, "{}", id),
        }
    }
}

/// One destination write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    /// All assertions for one target entity.
    Upsert {
        target: DestinationId,
        assertions: Vec<(String, TxValue)>,
    },
    /// Removal of exactly one `(entity, attribute, value)` triple.
    Retract {
        target: DestinationId,
        attribute: String,
        value: TxValue,
    },
}

impl TxOp {
    pub fn target(&self) -> &DestinationId {
        match self {
            TxOp::Upsert { target, .. } | TxOp::Retract { target, .. } => target,
        }
    }
}

/// Unit of work committed atomically to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Source transaction this batch was translated from (`None` for bootstrap commits).
    pub source_t: Option<TxId>,
    /// Instant recorded on the destination transaction (`None` = destination clock).
    pub tx_instant: Option<DateTime<Utc>>,
    pub ops: Vec<TxOp>,
}

impl CommitBatch {
    pub fn new(source_t: Option<TxId>, tx_instant: Option<DateTime<Utc>>) -> Self {
        Self {
            source_t,
            tx_instant,
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Outcome of a successful destination commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub t: TxId,
    pub tx_entity: EntityId,
    pub tempids: HashMap<TempId, EntityId>,
}

/// Last source transaction fully replicated.
pub type ResumePosition = TxId;
