//! Fixtures: schema installs, entities and wait helpers.

use chrono::{DateTime, TimeZone, Utc};
use mirror_engine::config::MirrorConfig;
use mirror_engine::init::{install_attribute_ops, AttributeSpec};
use mirror_engine::memory::{MemorySnapshot, MemoryStore};
use mirror_engine::model::{
    Cardinality, CommitBatch, DestinationId, EntityId, Partition, TempId, TxId, TxOp, TxValue,
    Uniqueness, Value, ValueType,
};
use mirror_engine::store::DestinationStore;
use mirror_engine::ControllerState;
use std::time::Duration;
use tokio::sync::watch;

pub const SYNTHETIC: &str = ":mirror/source-eid";

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> MirrorConfig {
    MirrorConfig::for_testing("source", "destination")
}

pub fn tmp(partition: &str, index: i64) -> DestinationId {
    DestinationId::Placeholder(TempId {
        partition: Partition::new(partition),
        index,
    })
}

pub fn string(attribute: &str, value: &str) -> (String, TxValue) {
    (attribute.to_string(), TxValue::Value(Value::String(value.to_string())))
}

pub fn long(attribute: &str, value: i64) -> (String, TxValue) {
    (attribute.to_string(), TxValue::Value(Value::Long(value)))
}

pub fn reference(attribute: &str, target: DestinationId) -> (String, TxValue) {
    (attribute.to_string(), TxValue::Ref(target))
}

/// Install one attribute in its own transaction.
pub async fn install(store: &MemoryStore, spec: AttributeSpec) -> TxId {
    let ops = install_attribute_ops(&store.current().await, &spec).unwrap();
    store.transact(ops).await.unwrap().t
}

/// `:user/name`, `:user/age`, `:user/email` (unique identity), `:user/friends`, `:user/tags`.
pub async fn install_user_schema(store: &MemoryStore) -> TxId {
    install(store, AttributeSpec::new(":user/name", ValueType::String, Cardinality::One)).await;
    install(store, AttributeSpec::new(":user/age", ValueType::Long, Cardinality::One)).await;
    install(
        store,
        AttributeSpec::new(":user/email", ValueType::String, Cardinality::One).unique(Uniqueness::Identity),
    )
    .await;
    install(store, AttributeSpec::new(":user/friends", ValueType::Ref, Cardinality::Many)).await;
    install(store, AttributeSpec::new(":user/tags", ValueType::Keyword, Cardinality::Many)).await
}

/// Install a partition. `instant` lets a destination be prepared "in the past".
pub async fn install_partition(store: &MemoryStore, ident: &str, instant: Option<DateTime<Utc>>) -> TxId {
    let part = tmp(Partition::DB, -1);
    let mut batch = CommitBatch::new(None, instant);
    batch.ops = vec![
        TxOp::Upsert {
            target: part.clone(),
            assertions: vec![(
                ":db/ident".to_string(),
                TxValue::Value(Value::Keyword(ident.to_string())),
            )],
        },
        TxOp::Upsert {
            target: DestinationId::Existing(store.current().await.entid(Partition::DB).unwrap()),
            assertions: vec![reference(":db.install/partition", part)],
        },
    ];
    DestinationStore::commit(store, batch).await.unwrap().t
}

/// An instant well before anything stamped by a store clock.
pub fn long_ago() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap()
}

/// Add a user in `:db.part/user`. Returns the commit `t` and the new entity.
pub async fn add_user(store: &MemoryStore, name: &str, age: Option<i64>) -> (TxId, EntityId) {
    let target = tmp(Partition::USER, -1);
    let mut assertions = vec![string(":user/name", name)];
    if let Some(age) = age {
        assertions.push(long(":user/age", age));
    }
    let receipt = store
        .transact(vec![TxOp::Upsert {
            target: target.clone(),
            assertions,
        }])
        .await
        .unwrap();
    let DestinationId::Placeholder(tempid) = target else {
        unreachable!()
    };
    (receipt.t, receipt.tempids[&tempid])
}

/// Entities whose `:user/name` is `name`.
pub fn named(snap: &MemorySnapshot, name: &str) -> Vec<EntityId> {
    snap.entities_with(":user/name")
        .into_iter()
        .filter(|e| snap.value(*e, ":user/name") == Some(Value::String(name.to_string())))
        .collect()
}

/// Wait until the position reaches `t`, failing the test after 5s.
pub async fn wait_for_position(mut rx: watch::Receiver<Option<TxId>>, t: TxId) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| p.is_some_and(|p| p >= t)))
        .await
        .unwrap_or_else(|_| panic!("position never reached {}", t))
        .unwrap();
}

pub async fn wait_for_state(mut rx: watch::Receiver<ControllerState>, state: ControllerState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("controller never reached {}", state))
        .unwrap();
}
