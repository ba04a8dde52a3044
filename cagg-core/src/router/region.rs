// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./region_test.rs"]
mod region_test;

use super::{
  AggregationMessage,
  ClusterSubstrate,
  EntityRef,
  Envelope,
  Result,
  RouterError,
  ShardId,
};
use crate::aggregation::{Aggregator, AggregatorContext};
use bd_server_stats::stats::Scope;
use bd_shutdown::{ComponentShutdown, ComponentShutdownTriggerHandle};
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

//
// Stats
//

struct Stats {
  active_aggregators: IntGauge,
  aggregators_started: IntCounter,
  stale_passivations: IntCounter,
}

struct Entity {
  tx: mpsc::UnboundedSender<AggregationMessage>,
  generation: u64,
  shard_id: ShardId,
}

//
// LocalShardRegion
//

// Single process substrate: every shard is local and each entity gets one aggregator task, created
// on the first message routed to it. The lock covers the routing map only. Aggregator state is
// owned by the aggregator tasks.
pub struct LocalShardRegion {
  entities: Mutex<HashMap<String, Entity>>,
  next_generation: AtomicU64,
  context: Arc<AggregatorContext>,
  passivate_tx: mpsc::UnboundedSender<EntityRef>,
  shutdown_trigger_handle: ComponentShutdownTriggerHandle,
  stats: Stats,
}

impl LocalShardRegion {
  #[must_use]
  pub fn new(
    context: Arc<AggregatorContext>,
    scope: &Scope,
    shutdown_trigger_handle: ComponentShutdownTriggerHandle,
  ) -> Arc<Self> {
    let scope = scope.scope("region");
    let (passivate_tx, passivate_rx) = mpsc::unbounded_channel();
    let region = Arc::new(Self {
      entities: Mutex::default(),
      next_generation: AtomicU64::default(),
      context,
      passivate_tx,
      shutdown_trigger_handle: shutdown_trigger_handle.clone(),
      stats: Stats {
        active_aggregators: scope.gauge("active_aggregators"),
        aggregators_started: scope.counter("aggregators_started"),
        stale_passivations: scope.counter("stale_passivations"),
      },
    });

    tokio::spawn(Self::passivation_loop(
      Arc::downgrade(&region),
      passivate_rx,
      shutdown_trigger_handle.make_shutdown(),
    ));
    region
  }

  async fn passivation_loop(
    region: Weak<Self>,
    mut passivate_rx: mpsc::UnboundedReceiver<EntityRef>,
    mut shutdown: ComponentShutdown,
  ) {
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        entity = passivate_rx.recv() => {
          let (Some(entity), Some(region)) = (entity, region.upgrade()) else {
            break;
          };
          region.passivate(&entity);
        }
      }
    }
  }

  fn spawn_entity(&self, entity_id: &str, shard_id: ShardId) -> Entity {
    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
    log::debug!("starting aggregator for '{entity_id}' on {shard_id} (generation {generation})");
    self.stats.aggregators_started.inc();
    let (tx, _) = Aggregator::spawn(
      EntityRef {
        entity_id: entity_id.to_string(),
        generation,
      },
      self.context.clone(),
      self.passivate_tx.clone(),
      self.shutdown_trigger_handle.make_shutdown(),
    );
    Entity {
      tx,
      generation,
      shard_id,
    }
  }

  #[must_use]
  pub fn active_entities(&self) -> usize {
    self.entities.lock().len()
  }

  #[must_use]
  pub fn generation_of(&self, entity_id: &str) -> Option<u64> {
    self.entities.lock().get(entity_id).map(|entity| entity.generation)
  }
}

impl ClusterSubstrate for LocalShardRegion {
  fn route(&self, envelope: Envelope) -> Result<()> {
    let Envelope {
      entity_id,
      shard_id,
      mut message,
    } = envelope;

    let mut entities = self.entities.lock();
    // A closed mailbox means the previous instance already exited, so start a fresh one once.
    for _ in 0 .. 2 {
      let entity = entities
        .entry(entity_id.clone())
        .or_insert_with(|| self.spawn_entity(&entity_id, shard_id));
      match entity.tx.send(message) {
        Ok(()) => {
          self
            .stats
            .active_aggregators
            .set(entities.len().try_into().unwrap_or(i64::MAX));
          return Ok(());
        },
        Err(mpsc::error::SendError(returned)) => {
          message = returned;
          entities.remove(&entity_id);
        },
      }
    }
    Err(RouterError::Unavailable(entity_id))
  }

  fn passivate(&self, entity: &EntityRef) {
    let mut entities = self.entities.lock();
    if !entities
      .get(&entity.entity_id)
      .is_some_and(|live| live.generation == entity.generation)
    {
      log::debug!("ignoring stale passivation for {entity:?}");
      self.stats.stale_passivations.inc();
      return;
    }

    if let Some(removed) = entities.remove(&entity.entity_id) {
      log::debug!("passivating {entity:?}");
      // Queued behind any messages already in the mailbox, so those are processed first.
      let _ignored = removed.tx.send(AggregationMessage::Shutdown);
    }
    self
      .stats
      .active_aggregators
      .set(entities.len().try_into().unwrap_or(i64::MAX));
  }

  fn shard_allocations(&self) -> BTreeMap<ShardId, usize> {
    let mut allocations = BTreeMap::new();
    for entity in self.entities.lock().values() {
      *allocations.entry(entity.shard_id).or_default() += 1;
    }
    allocations
  }
}
