// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod region;

use crate::model::{AggregatedData, ModelError, StatisticSetRecord, format_period};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

pub const DEFAULT_SHARD_COUNT: u32 = 10_000;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RouterError {
  #[error("message cannot be routed: {0}")]
  UnroutableMessage(&'static str),
  #[error("invalid record: {0}")]
  InvalidRecord(#[from] ModelError),
  #[error("shard count must be positive")]
  InvalidShardCount,
  #[error("no aggregator available for entity '{0}'")]
  Unavailable(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;

//
// AggregationMessage
//

#[derive(Clone, Debug, PartialEq)]
pub enum AggregationMessage {
  StatisticSet(StatisticSetRecord),
  Aggregated(AggregatedData),
  // Control message sent by the substrate to a passivating aggregator. Never routed.
  Shutdown,
}

//
// EntityRef
//

// Handle to one incarnation of an aggregator. The generation tells incarnations of the same entity
// apart so a stale passivation request cannot stop a fresh instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
  pub entity_id: String,
  pub generation: u64,
}

//
// ShardId
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "shard_{}", self.0)
  }
}

//
// ShardExtractor
//

// Pure mapping from a message to the entity that owns it and the shard that entity lives on. The
// hash is seeded and platform independent so every node and every restart agrees.
#[derive(Clone, Copy, Debug)]
pub struct ShardExtractor {
  shard_count: u32,
}

impl ShardExtractor {
  pub const fn new(shard_count: u32) -> Result<Self> {
    if shard_count == 0 {
      return Err(RouterError::InvalidShardCount);
    }
    Ok(Self { shard_count })
  }

  pub fn entity_id(&self, message: &AggregationMessage) -> Result<String> {
    match message {
      AggregationMessage::StatisticSet(record) => Ok(format!(
        "{}||{}||{}||{}",
        record.cluster,
        record.service,
        record.metric,
        format_period(record.period)
      )),
      AggregationMessage::Aggregated(datum) => Ok(format!(
        "{}{}{}{}{}",
        datum.fqdsn.cluster,
        datum.fqdsn.service,
        datum.fqdsn.metric,
        format_period(datum.period),
        datum.fqdsn.statistic
      )),
      AggregationMessage::Shutdown => Err(RouterError::UnroutableMessage("shutdown")),
    }
  }

  #[must_use]
  pub fn shard_for_entity(&self, entity_id: &str) -> ShardId {
    let shard = xxh64(entity_id.as_bytes(), 0) % u64::from(self.shard_count);
    // The modulo keeps the value below shard_count which fits in u32.
    ShardId(u32::try_from(shard).unwrap_or_default())
  }

  pub fn shard_id(&self, message: &AggregationMessage) -> Result<ShardId> {
    Ok(self.shard_for_entity(&self.entity_id(message)?))
  }
}

//
// Envelope
//

#[derive(Debug)]
pub struct Envelope {
  pub entity_id: String,
  pub shard_id: ShardId,
  pub message: AggregationMessage,
}

//
// ClusterSubstrate
//

// Places entities on nodes and delivers messages to the single live instance of each entity.
#[cfg_attr(test, mockall::automock)]
pub trait ClusterSubstrate: Send + Sync {
  fn route(&self, envelope: Envelope) -> Result<()>;
  fn passivate(&self, entity: &EntityRef);

  // Number of live aggregators per shard.
  fn shard_allocations(&self) -> BTreeMap<ShardId, usize>;
}

//
// AggregationRouter
//

// Entry point for decoded records: validates them, computes their keys and hands them to the
// substrate.
#[derive(Clone)]
pub struct AggregationRouter {
  extractor: ShardExtractor,
  substrate: Arc<dyn ClusterSubstrate>,
}

impl AggregationRouter {
  #[must_use]
  pub fn new(extractor: ShardExtractor, substrate: Arc<dyn ClusterSubstrate>) -> Self {
    Self {
      extractor,
      substrate,
    }
  }

  pub fn route(&self, message: AggregationMessage) -> Result<()> {
    let message = match message {
      AggregationMessage::StatisticSet(record) => {
        AggregationMessage::StatisticSet(record.validate()?)
      },
      AggregationMessage::Aggregated(datum) => AggregationMessage::Aggregated(datum.validate()?),
      AggregationMessage::Shutdown => {
        return Err(RouterError::UnroutableMessage("shutdown"));
      },
    };
    let entity_id = self.extractor.entity_id(&message)?;
    let shard_id = self.extractor.shard_for_entity(&entity_id);
    self.substrate.route(Envelope {
      entity_id,
      shard_id,
      message,
    })
  }

  pub fn route_record(&self, record: StatisticSetRecord) -> Result<()> {
    self.route(AggregationMessage::StatisticSet(record))
  }
}
