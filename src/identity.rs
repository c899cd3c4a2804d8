// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-store identity resolution.
//!
//! Source entity ids mean nothing to the destination, so every entity is
//! named by a [`LookupKey`] that both stores agree on:
//!
//! | Entity | LookupKey |
//! |--------|-----------|
//! | Has a global name | `[:db/ident <name>]` |
//! | Anything else | `[<synthetic attribute> <source eid>]` |
//!
//! The key is then looked up in the destination. A hit targets the existing
//! entity; a miss allocates a placeholder in the (mapped) source partition.
//!
//! Two entities are special:
//!
//! - The transaction entity targets the destination transaction being
//!   committed, anchored with its own key so later transactions can refer to
//!   it. Once mirrored, its key resolves like any other.
//! - An entity mirrored under its source id that has since gained a name
//!   misses on the name but is still found by `[<synthetic attribute> <eid>]`.
//!   The name is then anchored on that entity.
//!
//! # Scope
//!
//! Resolutions live in a [`ResolutionArena`] owned by one resolver, which
//! lives for the translation of one transaction. Nothing is cached across
//! transactions: an entity created by transaction `t` becomes resolvable for
//! `t + 1` only because its commit is visible in the next destination
//! snapshot.

use crate::model::{DestinationId, EntityId, LookupKey, Partition, TempId, Transaction, TxId, Value};
use crate::store::{DestinationSnapshot, SourceSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Maps a source entity to its cross-store key.
pub type IdentityFn = Arc<dyn Fn(&dyn SourceSnapshot, EntityId) -> LookupKey + Send + Sync>;

/// Source partition ident → destination partition ident.
pub type PartitionMap = BTreeMap<String, String>;

/// Global name when present, else `(synthetic_attribute, source eid)`.
pub fn default_identity(synthetic_attribute: impl Into<String>) -> IdentityFn {
    let attribute: String = synthetic_attribute.into();
    Arc::new(move |snapshot: &dyn SourceSnapshot, entity: EntityId| {
        match snapshot.ident(entity) {
            Some(name) => LookupKey::ident(name),
            None => source_id_key(&attribute, entity),
        }
    })
}

/// `[<synthetic attribute> <source eid>]`.
pub fn source_id_key(synthetic_attribute: &str, entity: EntityId) -> LookupKey {
    // Entity ids stay below 2^63, so the cast is lossless.
    LookupKey::new(synthetic_attribute, Value::Long(entity.0 as i64))
}

/// Where one source entity lands in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: LookupKey,
    pub target: DestinationId,
    /// A placeholder was allocated for this entity.
    pub created: bool,
    /// `key` must be asserted on `target` in this transaction.
    pub anchor: bool,
}

/// Per-transaction memo of resolved entities.
#[derive(Debug, Default)]
pub struct ResolutionArena {
    entries: HashMap<EntityId, Resolution>,
    order: Vec<EntityId>,
    allocated: i64,
}

impl ResolutionArena {
    pub fn get(&self, entity: EntityId) -> Option<&Resolution> {
        self.entries.get(&entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entities that need a new destination entity, in first-resolution order.
    pub fn placeholders(&self) -> impl Iterator<Item = (EntityId, &Resolution)> + '_ {
        self.order
            .iter()
            .filter_map(|e| self.entries.get(e).map(|r| (*e, r)))
            .filter(|(_, r)| r.created)
    }

    /// Entities whose key must be asserted, in first-resolution order.
    pub fn anchors(&self) -> impl Iterator<Item = (EntityId, &Resolution)> + '_ {
        self.order
            .iter()
            .filter_map(|e| self.entries.get(e).map(|r| (*e, r)))
            .filter(|(_, r)| r.anchor)
    }

    fn next_temp_index(&mut self) -> i64 {
        self.allocated += 1;
        -self.allocated
    }

    fn insert(&mut self, entity: EntityId, resolution: Resolution) {
        self.order.push(entity);
        self.entries.insert(entity, resolution);
    }
}

/// Resolves source entities of one transaction to destination identifiers.
pub struct IdentityResolver<'a> {
    tx: &'a Transaction,
    source: &'a dyn SourceSnapshot,
    destination: &'a dyn DestinationSnapshot,
    identity: &'a IdentityFn,
    synthetic_attribute: &'a str,
    partitions: &'a PartitionMap,
    arena: ResolutionArena,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(
        tx: &'a Transaction,
        source: &'a dyn SourceSnapshot,
        destination: &'a dyn DestinationSnapshot,
        identity: &'a IdentityFn,
        synthetic_attribute: &'a str,
        partitions: &'a PartitionMap,
    ) -> Self {
        Self {
            tx,
            source,
            destination,
            identity,
            synthetic_attribute,
            partitions,
            arena: ResolutionArena::default(),
        }
    }

    /// Source transaction being translated.
    pub fn t(&self) -> TxId {
        self.tx.t
    }

    /// Resolve a source entity, memoized for the rest of this transaction.
    pub fn resolve(&mut self, entity: EntityId) -> &Resolution {
        if !self.arena.entries.contains_key(&entity) {
            let resolution = self.resolve_uncached(entity);
            self.arena.insert(entity, resolution);
        }
        &self.arena.entries[&entity]
    }

    fn resolve_uncached(&mut self, entity: EntityId) -> Resolution {
        let key = (self.identity)(self.source, entity);
        if let Some(existing) = self.destination.lookup(&key) {
            return Resolution {
                key,
                target: DestinationId::Existing(existing),
                created: false,
                anchor: false,
            };
        }

        if entity == self.tx.entity {
            return Resolution {
                key,
                target: DestinationId::Transaction,
                created: false,
                anchor: true,
            };
        }

        let by_source_id = source_id_key(self.synthetic_attribute, entity);
        if by_source_id != key {
            if let Some(existing) = self.destination.lookup(&by_source_id) {
                return Resolution {
                    key,
                    target: DestinationId::Existing(existing),
                    created: false,
                    anchor: true,
                };
            }
        }

        let partition = self.destination_partition(entity);
        let index = self.arena.next_temp_index();
        Resolution {
            key,
            target: DestinationId::Placeholder(TempId { partition, index }),
            created: true,
            anchor: true,
        }
    }

    /// Partition a new destination entity is allocated in.
    pub fn destination_partition(&self, entity: EntityId) -> Partition {
        let source = self.source.partition_of(entity);
        match self.partitions.get(source.as_str()) {
            Some(mapped) => Partition::new(mapped.clone()),
            None => source,
        }
    }

    pub fn arena(&self) -> &ResolutionArena {
        &self.arena
    }

    pub fn into_arena(self) -> ResolutionArena {
        self.arena
    }
}
