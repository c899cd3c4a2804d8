// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process store implementing both sides of the mirror.
//!
//! `MemoryStore` models an append-only, entity/attribute/value store closely
//! enough to drive the engine end to end without external services: tests,
//! dry runs and local experiments.
//!
//! # Entity Ids
//!
//! Entity ids carry their partition in the high bits:
//!
//! ```text
//!  63            42 41                     0
//! ┌────────────────┬────────────────────────┐
//! │ partition eid  │ index within partition │
//! └────────────────┴────────────────────────┘
//! ```
//!
//! Bootstrap partitions are `:db.part/db` (0), `:db.part/tx` (3) and
//! `:db.part/user` (4). A transaction's entity is `(:db.part/tx, t)`.
//!
//! # Commit Semantics
//!
//! A commit is staged on a copy of the current view and published only if
//! every op succeeds. Placeholders resolve through unique-identity assertions
//! first (upsert) and are allocated in their partition otherwise.
//! Cardinality-one assertions replace the previous value with an explicit
//! retraction, so the log carries the full history.

use crate::model::{
    AttributeInfo, Cardinality, CommitBatch, CommitReceipt, DestinationId, EntityId, Fact,
    LookupKey, Partition, TempId, Transaction, TxId, TxOp, TxValue, Uniqueness, Value, ValueType,
    IDENT_ATTRIBUTE,
};
use crate::store::{
    BoxFuture, DestinationSnapshot, DestinationStore, SourceSnapshot, SourceStore, StoreError,
    StoreResult, TransactionLog,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const PARTITION_SHIFT: u32 = 42;
const INDEX_MASK: u64 = (1 << PARTITION_SHIFT) - 1;

/// First `t` handed out to a committed transaction.
pub const FIRST_T: u64 = 1000;

/// Bootstrap entity ids.
pub mod ids {
    use crate::model::EntityId;

    pub const PART_DB: EntityId = EntityId(0);
    pub const PART_TX: EntityId = EntityId(3);
    pub const PART_USER: EntityId = EntityId(4);

    pub const IDENT: EntityId = EntityId(10);
    pub const INSTALL_PARTITION: EntityId = EntityId(11);
    pub const INSTALL_ATTRIBUTE: EntityId = EntityId(13);

    pub const TYPE_REF: EntityId = EntityId(20);
    pub const TYPE_KEYWORD: EntityId = EntityId(21);
    pub const TYPE_LONG: EntityId = EntityId(22);
    pub const TYPE_STRING: EntityId = EntityId(23);
    pub const TYPE_BOOLEAN: EntityId = EntityId(24);
    pub const TYPE_INSTANT: EntityId = EntityId(25);

    pub const CARDINALITY_ONE: EntityId = EntityId(35);
    pub const CARDINALITY_MANY: EntityId = EntityId(36);
    pub const UNIQUE_VALUE: EntityId = EntityId(37);
    pub const UNIQUE_IDENTITY: EntityId = EntityId(38);

    pub const VALUE_TYPE: EntityId = EntityId(40);
    pub const CARDINALITY: EntityId = EntityId(41);
    pub const UNIQUE: EntityId = EntityId(42);
    pub const TX_INSTANT: EntityId = EntityId(50);
    pub const DOC: EntityId = EntityId(62);

    /// First index handed out in `:db.part/db` for user schema.
    pub const FIRST_DB_INDEX: u64 = 100;
}

/// Compose an entity id from a partition entity and an index.
pub fn entity_id(partition: EntityId, index: u64) -> EntityId {
    EntityId((partition.0 << PARTITION_SHIFT) | (index & INDEX_MASK))
}

/// Partition entity an id was allocated in.
pub fn partition_entity(id: EntityId) -> EntityId {
    EntityId(id.0 >> PARTITION_SHIFT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// View: current state of every entity
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
struct View {
    entities: HashMap<EntityId, BTreeMap<EntityId, Vec<Value>>>,
    idents: HashMap<String, EntityId>,
}

impl View {
    fn values(&self, entity: EntityId, attribute: EntityId) -> &[Value] {
        self.entities
            .get(&entity)
            .and_then(|attrs| attrs.get(&attribute))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn first(&self, entity: EntityId, attribute: EntityId) -> Option<&Value> {
        self.values(entity, attribute).first()
    }

    fn ident(&self, entity: EntityId) -> Option<String> {
        match self.first(entity, ids::IDENT) {
            Some(Value::Keyword(k)) => Some(k.clone()),
            _ => None,
        }
    }

    fn ref_ident(&self, entity: EntityId, attribute: EntityId) -> Option<String> {
        self.first(entity, attribute)
            .and_then(Value::as_ref_id)
            .and_then(|target| self.ident(target))
    }

    fn attribute(&self, attribute: EntityId) -> Option<AttributeInfo> {
        let ident = self.ident(attribute)?;
        let value_type = ValueType::from_ident(&self.ref_ident(attribute, ids::VALUE_TYPE)?)?;
        let cardinality = Cardinality::from_ident(&self.ref_ident(attribute, ids::CARDINALITY)?)?;
        let unique = self
            .ref_ident(attribute, ids::UNIQUE)
            .and_then(|u| Uniqueness::from_ident(&u));
        Some(AttributeInfo {
            id: attribute,
            ident,
            value_type,
            cardinality,
            unique,
        })
    }

    fn attribute_by_ident(&self, ident: &str) -> Option<AttributeInfo> {
        self.idents.get(ident).and_then(|id| self.attribute(*id))
    }

    fn is_partition(&self, entity: EntityId) -> bool {
        self.values(ids::PART_DB, ids::INSTALL_PARTITION)
            .contains(&Value::Ref(entity))
    }

    /// Entity holding `value` for a unique attribute.
    fn unique_owner(&self, attribute: EntityId, value: &Value) -> Option<EntityId> {
        if attribute == ids::IDENT {
            if let Value::Keyword(k) = value {
                return self.idents.get(k).copied();
            }
            return None;
        }
        self.entities
            .iter()
            .find(|(_, attrs)| attrs.get(&attribute).is_some_and(|vs| vs.contains(value)))
            .map(|(id, _)| *id)
    }

    fn lookup(&self, key: &LookupKey) -> Option<EntityId> {
        let info = self.attribute_by_ident(&key.attribute)?;
        info.unique?;
        self.unique_owner(info.id, &key.value)
    }

    fn apply(&mut self, fact: &Fact) {
        let values = self
            .entities
            .entry(fact.entity)
            .or_default()
            .entry(fact.attribute)
            .or_default();
        if fact.added {
            if !values.contains(&fact.value) {
                values.push(fact.value.clone());
            }
        } else {
            values.retain(|v| v != &fact.value);
        }

        if fact.attribute == ids::IDENT {
            if let Value::Keyword(k) = &fact.value {
                if fact.added {
                    self.idents.insert(k.clone(), fact.entity);
                } else if self.idents.get(k) == Some(&fact.entity) {
                    self.idents.remove(k);
                }
            }
        }
    }

    fn partition_of(&self, entity: EntityId) -> Partition {
        let part = partition_entity(entity);
        match self.ident(part) {
            Some(name) => Partition(name),
            None => Partition::new(Partition::USER),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bootstrap schema
// ═══════════════════════════════════════════════════════════════════════════════

fn bootstrap_facts() -> Vec<Fact> {
    let t0 = TxId(0);
    let mut facts = Vec::new();
    let mut add = |e: EntityId, a: EntityId, v: Value| {
        facts.push(Fact {
            entity: e,
            attribute: a,
            value: v,
            tx: t0,
            added: true,
        })
    };
    let kw = |s: &str| Value::Keyword(s.to_string());

    for (id, name) in [
        (ids::PART_DB, Partition::DB),
        (ids::PART_TX, Partition::TX),
        (ids::PART_USER, Partition::USER),
    ] {
        add(id, ids::IDENT, kw(name));
        add(ids::PART_DB, ids::INSTALL_PARTITION, Value::Ref(id));
    }

    for (id, name) in [
        (ids::TYPE_REF, ":db.type/ref"),
        (ids::TYPE_KEYWORD, ":db.type/keyword"),
        (ids::TYPE_LONG, ":db.type/long"),
        (ids::TYPE_STRING, ":db.type/string"),
        (ids::TYPE_BOOLEAN, ":db.type/boolean"),
        (ids::TYPE_INSTANT, ":db.type/instant"),
        (ids::CARDINALITY_ONE, ":db.cardinality/one"),
        (ids::CARDINALITY_MANY, ":db.cardinality/many"),
        (ids::UNIQUE_VALUE, ":db.unique/value"),
        (ids::UNIQUE_IDENTITY, ":db.unique/identity"),
    ] {
        add(id, ids::IDENT, kw(name));
    }

    let attributes = [
        (ids::IDENT, IDENT_ATTRIBUTE, ids::TYPE_KEYWORD, ids::CARDINALITY_ONE, Some(ids::UNIQUE_IDENTITY)),
        (ids::INSTALL_PARTITION, ":db.install/partition", ids::TYPE_REF, ids::CARDINALITY_MANY, None),
        (ids::INSTALL_ATTRIBUTE, ":db.install/attribute", ids::TYPE_REF, ids::CARDINALITY_MANY, None),
        (ids::VALUE_TYPE, ":db/valueType", ids::TYPE_REF, ids::CARDINALITY_ONE, None),
        (ids::CARDINALITY, ":db/cardinality", ids::TYPE_REF, ids::CARDINALITY_ONE, None),
        (ids::UNIQUE, ":db/unique", ids::TYPE_REF, ids::CARDINALITY_ONE, None),
        (ids::TX_INSTANT, ":db/txInstant", ids::TYPE_INSTANT, ids::CARDINALITY_ONE, None),
        (ids::DOC, ":db/doc", ids::TYPE_STRING, ids::CARDINALITY_ONE, None),
    ];
    for (id, name, value_type, cardinality, unique) in attributes {
        add(id, ids::IDENT, kw(name));
        add(id, ids::VALUE_TYPE, Value::Ref(value_type));
        add(id, ids::CARDINALITY, Value::Ref(cardinality));
        if let Some(unique) = unique {
            add(id, ids::UNIQUE, Value::Ref(unique));
        }
        add(ids::PART_DB, ids::INSTALL_ATTRIBUTE, Value::Ref(id));
    }

    facts
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct DbState {
    view: Arc<View>,
    history: Vec<Fact>,
    log: Vec<Transaction>,
    next_index: HashMap<EntityId, u64>,
    basis_t: TxId,
    last_instant: DateTime<Utc>,
}

impl DbState {
    fn bootstrap() -> Self {
        let history = bootstrap_facts();
        let mut view = View::default();
        for fact in &history {
            view.apply(fact);
        }
        Self {
            view: Arc::new(view),
            history,
            log: Vec::new(),
            next_index: HashMap::new(),
            basis_t: TxId(FIRST_T - 1),
            last_instant: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn view_as_of(&self, t: TxId) -> Arc<View> {
        if t >= self.basis_t {
            return Arc::clone(&self.view);
        }
        let mut view = View::default();
        for fact in self.history.iter().filter(|f| f.tx <= t) {
            view.apply(fact);
        }
        Arc::new(view)
    }
}

/// Shared-state in-memory store. Clones share the same database.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<DbState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store holding only the bootstrap schema.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(DbState::bootstrap())),
        }
    }

    /// Commit ops stamped with the store's own clock.
    pub async fn transact(&self, ops: Vec<TxOp>) -> StoreResult<CommitReceipt> {
        let mut batch = CommitBatch::new(None, None);
        batch.ops = ops;
        self.apply_batch(batch).await
    }

    /// Snapshot of the current state.
    pub async fn current(&self) -> MemorySnapshot {
        let state = self.state.read().await;
        MemorySnapshot {
            view: Arc::clone(&state.view),
            basis_t: state.basis_t,
        }
    }

    /// Latest committed `t`.
    pub async fn basis_t(&self) -> TxId {
        self.state.read().await.basis_t
    }

    /// Number of committed (non-bootstrap) transactions.
    pub async fn log_len(&self) -> usize {
        self.state.read().await.log.len()
    }

    /// Every committed transaction, oldest first.
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.read().await.log.clone()
    }

    async fn apply_batch(&self, batch: CommitBatch) -> StoreResult<CommitReceipt> {
        let mut state = self.state.write().await;
        let receipt = stage_commit(&mut state, batch)?;
        debug!(t = %receipt.t, tempids = receipt.tempids.len(), "Memory store committed");
        Ok(receipt)
    }
}

fn resolve_target(
    target: &DestinationId,
    tempids: &HashMap<TempId, EntityId>,
    tx_entity: EntityId,
) -> StoreResult<EntityId> {
    match target {
        DestinationId::Existing(id) => Ok(*id),
        DestinationId::Transaction => Ok(tx_entity),
        DestinationId::Placeholder(tmp) => tempids
            .get(tmp)
            .copied()
            .ok_or_else(|| StoreError(format!("{} used only as a value", tmp))),
    }
}

fn resolve_value(
    value: &TxValue,
    tempids: &HashMap<TempId, EntityId>,
    tx_entity: EntityId,
) -> StoreResult<Value> {
    match value {
        TxValue::Value(v) => Ok(v.clone()),
        TxValue::Ref(target) => resolve_target(target, tempids, tx_entity).map(Value::Ref),
    }
}

fn allocate(
    view: &View,
    next_index: &mut HashMap<EntityId, u64>,
    partition: &Partition,
    tx_entity: EntityId,
) -> StoreResult<EntityId> {
    let part = view
        .idents
        .get(partition.as_str())
        .copied()
        .filter(|p| view.is_partition(*p))
        .ok_or_else(|| StoreError(format!("unknown partition {}", partition)))?;
    if part == ids::PART_TX {
        return Ok(tx_entity);
    }
    let counter = next_index.entry(part).or_insert(if part == ids::PART_DB {
        ids::FIRST_DB_INDEX
    } else {
        1
    });
    let id = entity_id(part, *counter);
    *counter += 1;
    Ok(id)
}

fn attribute_for(view: &View, ident: &str) -> StoreResult<AttributeInfo> {
    view.attribute_by_ident(ident)
        .ok_or_else(|| StoreError(format!("unknown attribute {}", ident)))
}

fn check_type(info: &AttributeInfo, value: &Value) -> StoreResult<()> {
    if value.value_type() != info.value_type {
        return Err(StoreError(format!(
            "value {} does not match type {} of {}",
            value,
            info.value_type.ident(),
            info.ident
        )));
    }
    Ok(())
}

fn stage_commit(state: &mut DbState, batch: CommitBatch) -> StoreResult<CommitReceipt> {
    let instant = match batch.tx_instant {
        Some(instant) if instant < state.last_instant => {
            return Err(StoreError(format!(
                "transaction instant {} precedes latest {}",
                instant.to_rfc3339(),
                state.last_instant.to_rfc3339()
            )));
        }
        Some(instant) => instant,
        None => std::cmp::max(Utc::now(), state.last_instant),
    };
    let t = state.basis_t.next();
    let tx_entity = entity_id(ids::PART_TX, t.0);

    // Schema is read from the pre-commit view: attributes must exist before use.
    let schema = Arc::clone(&state.view);
    let mut view = (*state.view).clone();
    let mut next_index = state.next_index.clone();
    let mut tempids: HashMap<TempId, EntityId> = HashMap::new();

    for op in &batch.ops {
        let TxOp::Upsert {
            target: DestinationId::Placeholder(tmp),
            assertions,
        } = op
        else {
            continue;
        };
        if tempids.contains_key(tmp) {
            continue;
        }
        let existing = assertions.iter().find_map(|(attr, value)| {
            let info = schema.attribute_by_ident(attr)?;
            if info.unique != Some(Uniqueness::Identity) {
                return None;
            }
            match value {
                TxValue::Value(v) => view.unique_owner(info.id, v),
                TxValue::Ref(_) => None,
            }
        });
        let id = match existing {
            Some(id) => id,
            None => allocate(&view, &mut next_index, &tmp.partition, tx_entity)?,
        };
        tempids.insert(tmp.clone(), id);
    }

    let mut facts = Vec::new();
    let mut record = |view: &mut View, fact: Fact| {
        view.apply(&fact);
        facts.push(fact);
    };

    for op in &batch.ops {
        match op {
            TxOp::Upsert { target, assertions } => {
                let entity = resolve_target(target, &tempids, tx_entity)?;
                for (attr, value) in assertions {
                    let info = attribute_for(&schema, attr)?;
                    let value = resolve_value(value, &tempids, tx_entity)?;
                    check_type(&info, &value)?;
                    if info.unique.is_some() {
                        if let Some(owner) = view.unique_owner(info.id, &value) {
                            if owner != entity {
                                return Err(StoreError(format!(
                                    "unique conflict: {} {} already held by {}",
                                    info.ident, value, owner
                                )));
                            }
                        }
                    }
                    let current = view.values(entity, info.id).to_vec();
                    if current.contains(&value)
                        && (info.cardinality == Cardinality::Many || current.len() == 1)
                    {
                        continue;
                    }
                    if info.cardinality == Cardinality::One {
                        for old in current.into_iter().filter(|old| old != &value) {
                            record(
                                &mut view,
                                Fact {
                                    entity,
                                    attribute: info.id,
                                    value: old,
                                    tx: t,
                                    added: false,
                                },
                            );
                        }
                    }
                    record(
                        &mut view,
                        Fact {
                            entity,
                            attribute: info.id,
                            value,
                            tx: t,
                            added: true,
                        },
                    );
                }
            }
            TxOp::Retract {
                target,
                attribute,
                value,
            } => {
                let entity = resolve_target(target, &tempids, tx_entity)?;
                let info = attribute_for(&schema, attribute)?;
                let value = resolve_value(value, &tempids, tx_entity)?;
                if view.values(entity, info.id).contains(&value) {
                    record(
                        &mut view,
                        Fact {
                            entity,
                            attribute: info.id,
                            value,
                            tx: t,
                            added: false,
                        },
                    );
                }
            }
        }
    }

    record(
        &mut view,
        Fact {
            entity: tx_entity,
            attribute: ids::TX_INSTANT,
            value: Value::Instant(instant),
            tx: t,
            added: true,
        },
    );

    state.history.extend(facts.iter().cloned());
    state.log.push(Transaction {
        t,
        entity: tx_entity,
        timestamp: instant,
        facts,
    });
    state.view = Arc::new(view);
    state.next_index = next_index;
    state.basis_t = t;
    state.last_instant = instant;

    Ok(CommitReceipt {
        t,
        tx_entity,
        tempids,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot + log handles
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable view of a [`MemoryStore`] at some basis.
#[derive(Clone)]
pub struct MemorySnapshot {
    view: Arc<View>,
    basis_t: TxId,
}

impl MemorySnapshot {
    pub fn basis_t(&self) -> TxId {
        self.basis_t
    }

    /// Entity id for a global name.
    pub fn entid(&self, ident: &str) -> Option<EntityId> {
        self.view.idents.get(ident).copied()
    }

    /// All current values of an entity, keyed by attribute ident.
    pub fn entity(&self, entity: EntityId) -> BTreeMap<String, Vec<Value>> {
        let mut out = BTreeMap::new();
        if let Some(attrs) = self.view.entities.get(&entity) {
            for (attr, values) in attrs {
                if values.is_empty() {
                    continue;
                }
                let name = self.view.ident(*attr).unwrap_or_else(|| attr.to_string());
                out.insert(name, values.clone());
            }
        }
        out
    }

    /// First value of `attribute` on `entity`.
    pub fn value(&self, entity: EntityId, attribute: &str) -> Option<Value> {
        let attr = self.entid(attribute)?;
        self.view.first(entity, attr).cloned()
    }

    /// Entities currently holding at least one value for `attribute`, in id order.
    pub fn entities_with(&self, attribute: &str) -> Vec<EntityId> {
        let Some(attr) = self.entid(attribute) else {
            return Vec::new();
        };
        let mut found: Vec<EntityId> = self
            .view
            .entities
            .iter()
            .filter(|(_, attrs)| attrs.get(&attr).is_some_and(|vs| !vs.is_empty()))
            .map(|(id, _)| *id)
            .collect();
        found.sort();
        found
    }

    /// Every installed attribute named `ident` (normally zero or one).
    pub fn attribute_definitions(&self, ident: &str) -> Vec<AttributeInfo> {
        self.view
            .values(ids::PART_DB, ids::INSTALL_ATTRIBUTE)
            .iter()
            .filter_map(Value::as_ref_id)
            .filter_map(|id| self.view.attribute(id))
            .filter(|info| info.ident == ident)
            .collect()
    }
}

impl SourceSnapshot for MemorySnapshot {
    fn ident(&self, entity: EntityId) -> Option<String> {
        self.view.ident(entity)
    }

    fn attribute(&self, attribute: EntityId) -> Option<AttributeInfo> {
        self.view.attribute(attribute)
    }

    fn partition_of(&self, entity: EntityId) -> Partition {
        self.view.partition_of(entity)
    }
}

impl DestinationSnapshot for MemorySnapshot {
    fn lookup(&self, key: &LookupKey) -> Option<EntityId> {
        self.view.lookup(key)
    }

    fn attribute_by_ident(&self, ident: &str) -> Option<AttributeInfo> {
        self.view.attribute_by_ident(ident)
    }
}

/// Tailable log handle for a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<RwLock<DbState>>,
}

impl TransactionLog for MemoryLog {
    fn range(&self, from: TxId, to: Option<TxId>) -> BoxFuture<'_, Vec<Transaction>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let start = state.log.partition_point(|tx| tx.t < from);
            Ok(state.log[start..]
                .iter()
                .take_while(|tx| to.map_or(true, |to| tx.t < to))
                .cloned()
                .collect())
        })
    }
}

impl SourceStore for MemoryStore {
    type Log = MemoryLog;
    type Snapshot = MemorySnapshot;

    fn open_log(&self) -> BoxFuture<'_, MemoryLog> {
        Box::pin(async move {
            Ok(MemoryLog {
                state: Arc::clone(&self.state),
            })
        })
    }

    fn snapshot_at(&self, t: TxId) -> BoxFuture<'_, MemorySnapshot> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(MemorySnapshot {
                view: state.view_as_of(t),
                basis_t: std::cmp::min(t, state.basis_t),
            })
        })
    }
}

impl DestinationStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    fn snapshot(&self) -> BoxFuture<'_, MemorySnapshot> {
        Box::pin(async move { Ok(self.current().await) })
    }

    fn commit(&self, batch: CommitBatch) -> BoxFuture<'_, CommitReceipt> {
        Box::pin(async move { self.apply_batch(batch).await })
    }
}
