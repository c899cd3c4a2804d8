// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Mirror Engine
//!
//! Every test runs a real `ReplicationController` between two in-memory
//! stores. No external services are required.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # With logs
//! RUST_LOG=mirror_engine=debug cargo test --test integration -- --nocapture
//! ```
//!
//! # Test Organization
//! - `scenario_*` - End-to-end replication scenarios
//! - `identity_*` - Cross-store identity and references
//! - `partition_*` - Partition mirroring and mapping
//! - `resume_*` - Restart, replay and the SQLite resume store

mod common;

use common::*;
use mirror_engine::config::ResumeStoreConfig;
use mirror_engine::init::AttributeSpec;
use mirror_engine::memory::{ids, partition_entity, MemoryStore};
use mirror_engine::model::{
    AttributeInfo, Cardinality, DestinationId, Partition, TempId, TxId, TxOp, TxValue, Uniqueness, Value,
    ValueType,
};
use mirror_engine::store::SourceStore;
use mirror_engine::tailer::LogTailer;
use mirror_engine::{ControllerState, MirrorError, MirrorHooks, ReplicationController, ResumeStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

type MemoryController = ReplicationController<MemoryStore, MemoryStore>;

fn controller(source: &MemoryStore, destination: &MemoryStore, config: mirror_engine::MirrorConfig) -> MemoryController {
    ReplicationController::with_default_hooks(config, Arc::new(source.clone()), Arc::new(destination.clone()))
}

/// Start, wait for `t`, stop cleanly.
async fn mirror_through(source: &MemoryStore, destination: &MemoryStore, t: TxId) {
    let mut controller = controller(source, destination, config());
    controller.start().await.unwrap();
    wait_for_position(controller.position_receiver(), t).await;
    controller.stop().await.unwrap();
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_attribute_definition_mirrored() {
    init_tracing();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    let t = install(&source, AttributeSpec::new(":user/name", ValueType::String, Cardinality::One)).await;

    mirror_through(&source, &destination, t).await;

    let definitions = destination.current().await.attribute_definitions(":user/name");
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].value_type, ValueType::String);
    assert_eq!(definitions[0].cardinality, Cardinality::One);
}

#[tokio::test]
async fn scenario_entities_mirrored() {
    init_tracing();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;

    let receipt = source
        .transact(vec![
            TxOp::Upsert {
                target: tmp(Partition::USER, -1),
                assertions: vec![string(":user/name", "Chris"), long(":user/age", 44)],
            },
            TxOp::Upsert {
                target: tmp(Partition::USER, -2),
                assertions: vec![string(":user/name", "Bob")],
            },
        ])
        .await
        .unwrap();

    mirror_through(&source, &destination, receipt.t).await;

    let snap = destination.current().await;
    assert_eq!(snap.entities_with(":user/name").len(), 2);
    let chris = named(&snap, "Chris");
    let bob = named(&snap, "Bob");
    assert_eq!(chris.len(), 1);
    assert_eq!(bob.len(), 1);
    assert_eq!(snap.value(chris[0], ":user/age"), Some(Value::Long(44)));
    assert_eq!(snap.value(bob[0], ":user/age"), None);
}

#[tokio::test]
async fn scenario_resume_after_stop_without_reapplying() {
    init_tracing();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    add_user(&source, "Ada", Some(36)).await;
    let (n, _) = add_user(&source, "Grace", Some(45)).await;

    mirror_through(&source, &destination, n).await;

    add_user(&source, "Edsger", None).await;
    let (last, _) = add_user(&source, "Barbara", Some(80)).await;

    let recording = Arc::new(RecordingDestination::new(destination.clone()));
    let mut config = config();
    config.resume_from = Some(n.next().0);
    let mut second = ReplicationController::with_default_hooks(config, Arc::new(source.clone()), Arc::clone(&recording));
    second.start().await.unwrap();
    wait_for_position(second.position_receiver(), last).await;
    second.stop().await.unwrap();

    let committed = recording.committed();
    assert_eq!(committed, vec![n.next(), last]);

    let snap = destination.current().await;
    for name in ["Ada", "Grace", "Edsger", "Barbara"] {
        assert_eq!(named(&snap, name).len(), 1, "{} mirrored exactly once", name);
    }
    // Init found the attribute from the first run
    assert_eq!(snap.attribute_definitions(SYNTHETIC).len(), 1);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn resume_replaying_last_transaction_creates_no_duplicates() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let (n, _) = add_user(&source, "Ada", Some(36)).await;

    mirror_through(&source, &destination, n).await;
    let before = destination.current().await.entities_with(":user/name");

    // As after a crash between commit and position write
    let mut config = config();
    config.resume_from = Some(n.0);
    let mut replay = controller(&source, &destination, config);
    replay.start().await.unwrap();
    wait_for_position(replay.position_receiver(), n).await;
    replay.stop().await.unwrap();

    let snap = destination.current().await;
    assert_eq!(snap.entities_with(":user/name"), before);
    assert_eq!(named(&snap, "Ada").len(), 1);
}

#[tokio::test]
async fn commits_follow_source_order() {
    let source = MemoryStore::new();
    install_user_schema(&source).await;
    let mut last = TxId(0);
    for i in 0..10 {
        last = add_user(&source, &format!("user-{}", i), Some(i)).await.0;
    }

    let recording = Arc::new(RecordingDestination::new(MemoryStore::new()));
    let mut controller =
        ReplicationController::with_default_hooks(config(), Arc::new(source.clone()), Arc::clone(&recording));
    controller.start().await.unwrap();
    wait_for_position(controller.position_receiver(), last).await;
    controller.stop().await.unwrap();

    // Each commit finishes before the next starts, in increasing t
    let events = recording.events();
    let mut previous: Option<TxId> = None;
    for pair in events.chunks(2) {
        match pair {
            [CommitEvent::Started(a), CommitEvent::Finished(b)] => {
                assert_eq!(a, b);
                if let (Some(prev), Some(t)) = (previous, *a) {
                    assert!(t > prev);
                }
                if a.is_some() {
                    previous = *a;
                }
            }
            other => panic!("unexpected commit events {:?}", other),
        }
    }
    assert_eq!(recording.committed().len(), source.log_len().await);
}

#[tokio::test]
async fn identity_references_resolve_within_and_across_batches() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;

    // Within one batch: a references b before b is otherwise mentioned
    let first = source
        .transact(vec![
            TxOp::Upsert {
                target: tmp(Partition::USER, -1),
                assertions: vec![
                    string(":user/name", "a"),
                    reference(":user/friends", tmp(Partition::USER, -2)),
                ],
            },
            TxOp::Upsert {
                target: tmp(Partition::USER, -2),
                assertions: vec![string(":user/name", "b")],
            },
        ])
        .await
        .unwrap();
    // Across batches: c references the existing b
    let b_src = first.tempids[&TempId {
        partition: Partition::new(Partition::USER),
        index: -2,
    }];
    let second = source
        .transact(vec![TxOp::Upsert {
            target: tmp(Partition::USER, -1),
            assertions: vec![
                string(":user/name", "c"),
                reference(":user/friends", DestinationId::Existing(b_src)),
            ],
        }])
        .await
        .unwrap();

    mirror_through(&source, &destination, second.t).await;

    let snap = destination.current().await;
    let b = named(&snap, "b")[0];
    for name in ["a", "c"] {
        let e = named(&snap, name)[0];
        assert_eq!(snap.value(e, ":user/friends"), Some(Value::Ref(b)), "{} -> b", name);
    }
    assert_eq!(snap.entities_with(":user/name").len(), 3);
}

#[tokio::test]
async fn identity_unique_attribute_and_synthetic_anchor() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let receipt = source
        .transact(vec![TxOp::Upsert {
            target: tmp(Partition::USER, -1),
            assertions: vec![string(":user/name", "Ada"), string(":user/email", "ada@example.com")],
        }])
        .await
        .unwrap();
    let src = receipt.tempids.values().copied().next().unwrap();

    mirror_through(&source, &destination, receipt.t).await;

    let snap = destination.current().await;
    let ada = named(&snap, "Ada")[0];
    assert_eq!(snap.value(ada, SYNTHETIC), Some(Value::Long(src.0 as i64)));
    assert_eq!(
        snap.attribute_definitions(":user/email")[0].unique,
        Some(Uniqueness::Identity)
    );
}

#[tokio::test]
async fn retract_removes_only_that_value() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let kw = |k: &str| TxValue::Value(Value::Keyword(k.to_string()));
    let created = source
        .transact(vec![TxOp::Upsert {
            target: tmp(Partition::USER, -1),
            assertions: vec![
                string(":user/name", "Chris"),
                long(":user/age", 44),
                (":user/tags".to_string(), kw(":admin")),
                (":user/tags".to_string(), kw(":ops")),
            ],
        }])
        .await
        .unwrap();
    let chris = created.tempids.values().copied().next().unwrap();
    let retracted = source
        .transact(vec![TxOp::Retract {
            target: DestinationId::Existing(chris),
            attribute: ":user/tags".to_string(),
            value: kw(":admin"),
        }])
        .await
        .unwrap();

    mirror_through(&source, &destination, retracted.t).await;

    let snap = destination.current().await;
    let e = named(&snap, "Chris")[0];
    let entity = snap.entity(e);
    assert_eq!(entity[":user/tags"], vec![Value::Keyword(":ops".to_string())]);
    assert_eq!(entity[":user/age"], vec![Value::Long(44)]);
    assert_eq!(entity[":user/name"], vec![Value::String("Chris".to_string())]);
}

#[tokio::test]
async fn cardinality_one_update_replaces_value() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let (_, chris) = add_user(&source, "Chris", Some(44)).await;
    let birthday = source
        .transact(vec![TxOp::Upsert {
            target: DestinationId::Existing(chris),
            assertions: vec![long(":user/age", 45)],
        }])
        .await
        .unwrap();

    mirror_through(&source, &destination, birthday.t).await;

    let snap = destination.current().await;
    let e = named(&snap, "Chris")[0];
    assert_eq!(snap.entity(e)[":user/age"], vec![Value::Long(45)]);
}

#[tokio::test]
async fn transaction_metadata_lands_on_destination_transaction() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    install(&source, AttributeSpec::new(":audit/origin", ValueType::String, Cardinality::One)).await;
    let receipt = source
        .transact(vec![
            TxOp::Upsert {
                target: tmp(Partition::USER, -1),
                assertions: vec![string(":user/name", "Ada")],
            },
            TxOp::Upsert {
                target: DestinationId::Transaction,
                assertions: vec![string(":audit/origin", "import")],
            },
        ])
        .await
        .unwrap();

    mirror_through(&source, &destination, receipt.t).await;

    let snap = destination.current().await;
    let tagged = snap.entities_with(":audit/origin");
    assert_eq!(tagged.len(), 1);
    assert_eq!(partition_entity(tagged[0]), ids::PART_TX);
    // Same destination transaction as the entity
    let ada_tx = destination
        .transactions()
        .await
        .into_iter()
        .find(|tx| tx.entity == tagged[0])
        .unwrap();
    assert_eq!(ada_tx.timestamp, source.transactions().await.last().unwrap().timestamp);
}

#[tokio::test]
async fn identity_reference_to_earlier_transaction() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    install(&source, AttributeSpec::new(":audit/label", ValueType::String, Cardinality::One)).await;
    install(&source, AttributeSpec::new(":audit/tx", ValueType::Ref, Cardinality::One)).await;

    let (ada_t, _) = add_user(&source, "Ada", Some(36)).await;
    let ada_src_tx = source
        .transactions()
        .await
        .into_iter()
        .find(|tx| tx.t == ada_t)
        .unwrap()
        .entity;
    let audit = source
        .transact(vec![TxOp::Upsert {
            target: tmp(Partition::USER, -1),
            assertions: vec![
                string(":audit/label", "Audit"),
                reference(":audit/tx", DestinationId::Existing(ada_src_tx)),
            ],
        }])
        .await
        .unwrap();

    mirror_through(&source, &destination, audit.t).await;

    let snap = destination.current().await;
    let ada = named(&snap, "Ada")[0];
    let audit_e = snap.entities_with(":audit/label")[0];
    let txs = destination.transactions().await;
    let ada_tx = txs.iter().find(|tx| tx.facts.iter().any(|f| f.entity == ada)).unwrap().entity;
    let audit_tx = txs.iter().find(|tx| tx.facts.iter().any(|f| f.entity == audit_e)).unwrap().entity;

    assert_ne!(ada_tx, audit_tx);
    assert_eq!(snap.value(audit_e, ":audit/tx"), Some(Value::Ref(ada_tx)));
    assert_eq!(snap.value(ada_tx, SYNTHETIC), Some(Value::Long(ada_src_tx.0 as i64)));
}

#[tokio::test]
async fn identity_survives_entity_gaining_an_ident() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let (_, ada_src) = add_user(&source, "Ada", None).await;
    let named_t = source
        .transact(vec![TxOp::Upsert {
            target: DestinationId::Existing(ada_src),
            assertions: vec![
                (":db/ident".to_string(), TxValue::Value(Value::Keyword(":user/ada".to_string()))),
                long(":user/age", 36),
            ],
        }])
        .await
        .unwrap()
        .t;

    mirror_through(&source, &destination, named_t).await;

    let snap = destination.current().await;
    let ada = named(&snap, "Ada");
    assert_eq!(ada.len(), 1);
    assert_eq!(snap.entities_with(":user/age"), ada);
    assert_eq!(snap.value(ada[0], ":user/age"), Some(Value::Long(36)));
    assert_eq!(snap.entid(":user/ada"), Some(ada[0]));
    assert_eq!(snap.value(ada[0], SYNTHETIC), Some(Value::Long(ada_src.0 as i64)));
}

#[tokio::test]
async fn skipped_attributes_are_not_mirrored() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let (t, _) = add_user(&source, "Chris", Some(44)).await;

    let hooks: MirrorHooks<MemoryStore> = MirrorHooks::from_config(&config())
        .with_skip_attribute(Arc::new(|a: &AttributeInfo| a.ident == ":user/age"));
    let mut controller =
        ReplicationController::new(config(), Arc::new(source.clone()), Arc::new(destination.clone()), hooks);
    controller.start().await.unwrap();
    wait_for_position(controller.position_receiver(), t).await;
    controller.stop().await.unwrap();

    let snap = destination.current().await;
    let e = named(&snap, "Chris")[0];
    assert_eq!(snap.value(e, ":user/age"), None);
}

// =============================================================================
// Partitions
// =============================================================================

#[tokio::test]
async fn partition_new_entities_keep_their_partition() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    install_partition(&source, ":part/accounts", None).await;
    let receipt = source
        .transact(vec![TxOp::Upsert {
            target: tmp(":part/accounts", -1),
            assertions: vec![string(":user/name", "ledger")],
        }])
        .await
        .unwrap();

    mirror_through(&source, &destination, receipt.t).await;

    let snap = destination.current().await;
    let e = named(&snap, "ledger")[0];
    assert_eq!(Some(partition_entity(e)), snap.entid(":part/accounts"));
}

#[tokio::test]
async fn partition_map_redirects_allocation() {
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_partition(&destination, ":part/dr-accounts", Some(long_ago())).await;
    install_user_schema(&source).await;
    install_partition(&source, ":part/accounts", None).await;
    let receipt = source
        .transact(vec![TxOp::Upsert {
            target: tmp(":part/accounts", -1),
            assertions: vec![string(":user/name", "ledger")],
        }])
        .await
        .unwrap();

    let mut config = config();
    config
        .identity
        .partition_map
        .insert(":part/accounts".to_string(), ":part/dr-accounts".to_string());
    let mut controller = controller(&source, &destination, config);
    controller.start().await.unwrap();
    wait_for_position(controller.position_receiver(), receipt.t).await;
    controller.stop().await.unwrap();

    let snap = destination.current().await;
    let e = named(&snap, "ledger")[0];
    assert_eq!(Some(partition_entity(e)), snap.entid(":part/dr-accounts"));
}

// =============================================================================
// Tailer against a real store
// =============================================================================

#[tokio::test]
async fn tailer_stream_reads_store_log_in_order() {
    use futures::StreamExt;

    let source = MemoryStore::new();
    install_user_schema(&source).await;
    add_user(&source, "Ada", None).await;
    let log = SourceStore::open_log(&source).await.unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let ts: Vec<TxId> = LogTailer::new(log, None, Duration::from_millis(5))
        .into_stream(shutdown)
        .take(source.log_len().await)
        .map(|tx| tx.t)
        .collect()
        .await;

    let expected: Vec<TxId> = source.transactions().await.iter().map(|tx| tx.t).collect();
    assert_eq!(ts, expected);
}

// =============================================================================
// Resume store
// =============================================================================

#[tokio::test]
async fn resume_position_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("positions.db").to_string_lossy().to_string();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let (n, _) = add_user(&source, "Ada", None).await;

    let mut config = config();
    config.resume_store = ResumeStoreConfig::at(path.clone());

    let mut first = controller(&source, &destination, config.clone());
    first.start().await.unwrap();
    wait_for_position(first.position_receiver(), n).await;
    first.stop().await.unwrap();

    {
        let store = ResumeStore::new(&path).await.unwrap();
        assert_eq!(store.get("source=>destination").await, Some(n));
        store.close().await;
    }

    let (last, _) = add_user(&source, "Grace", None).await;
    let recording = Arc::new(RecordingDestination::new(destination.clone()));
    let mut second =
        ReplicationController::with_default_hooks(config, Arc::new(source.clone()), Arc::clone(&recording));
    second.start().await.unwrap();
    // Restored from disk, not reset
    assert!(second.resume_position() >= Some(n));
    wait_for_position(second.position_receiver(), last).await;
    second.stop().await.unwrap();

    assert_eq!(recording.committed(), vec![last]);
    assert_eq!(named(&destination.current().await, "Ada").len(), 1);
}

#[tokio::test]
async fn resume_explicit_position_overrides_stored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("positions.db").to_string_lossy().to_string();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    install_user_schema(&source).await;
    let (n, _) = add_user(&source, "Ada", None).await;

    let mut config = config();
    config.resume_store = ResumeStoreConfig::at(path.clone());
    let mut first = controller(&source, &destination, config.clone());
    first.start().await.unwrap();
    wait_for_position(first.position_receiver(), n).await;
    first.stop().await.unwrap();

    let recording = Arc::new(RecordingDestination::new(destination.clone()));
    config.resume_from = Some(n.0);
    let mut second =
        ReplicationController::with_default_hooks(config, Arc::new(source.clone()), Arc::clone(&recording));
    second.start().await.unwrap();
    wait_for_position(second.position_receiver(), n).await;
    second.stop().await.unwrap();

    assert_eq!(recording.committed(), vec![n]);
}

#[tokio::test]
async fn resume_lease_blocks_second_controller() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("positions.db").to_string_lossy().to_string();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();

    let mut config = config();
    config.resume_store = ResumeStoreConfig::at(path);

    let mut first = controller(&source, &destination, config.clone());
    first.start().await.unwrap();

    let mut second = controller(&source, &destination, config);
    match second.start().await {
        Err(MirrorError::LeaseUnavailable { pair }) => assert_eq!(pair, "source=>destination"),
        other => panic!("expected LeaseUnavailable, got {:?}", other),
    }
    assert_eq!(second.state(), ControllerState::Created);

    first.stop().await.unwrap();
    assert_eq!(first.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn resume_lease_loss_halts_controller() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("positions.db").to_string_lossy().to_string();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();

    let mut config = config();
    config.resume_store = ResumeStoreConfig {
        lease_ttl_sec: 1,
        ..ResumeStoreConfig::at(path.clone())
    };

    let mut controller = controller(&source, &destination, config);
    controller.start().await.unwrap();

    // Another holder takes the lease out from under us
    steal_lease(&path, "source=>destination").await;

    let state = tokio::time::timeout(Duration::from_secs(5), controller.halted())
        .await
        .expect("controller should halt after losing its lease");
    assert_eq!(state, ControllerState::Failed);

    let report = controller.halt_report().await.unwrap();
    assert_eq!(report.t, None);
    assert!(report.cause.contains("source=>destination"));
    assert!(matches!(controller.stop().await, Err(MirrorError::LeaseLost { .. })));
}

/// Rewrite the lease row directly, as a competing replicator would.
async fn steal_lease(path: &str, pair: &str) {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", path)).await.unwrap();
    let stolen = sqlx::query("UPDATE leases SET holder = 'intruder', expires_at = ? WHERE pair_key = ?")
        .bind(i64::MAX)
        .bind(pair)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(stolen.rows_affected(), 1);
    pool.close().await;
}
