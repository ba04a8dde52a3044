// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::config::AggregationConfig;
use crate::model::{StatisticRecord, StatisticSetRecord};
use crate::router::{AggregationRouter, ShardExtractor};
use crate::test::{AggregatorHelper, aggregator_context_for_test, make_record, t0};
use bd_server_stats::test::util::stats::Helper as StatsHelper;
use bd_time::TimeDurationExt;
use time::ext::NumericalDuration;

struct Helper {
  inner: AggregatorHelper,
  _stats_helper: StatsHelper,
  region: Arc<LocalShardRegion>,
  router: AggregationRouter,
}

impl Helper {
  fn new() -> Self {
    let (inner, context) = aggregator_context_for_test(AggregationConfig::default());
    let stats_helper = StatsHelper::default();
    let region = LocalShardRegion::new(
      context,
      &stats_helper.collector().scope("test"),
      inner.shutdown_trigger.make_handle(),
    );
    let router = AggregationRouter::new(ShardExtractor::new(16).unwrap(), region.clone());
    Self {
      inner,
      _stats_helper: stats_helper,
      region,
      router,
    }
  }
}

fn record(metric: &str) -> StatisticSetRecord {
  let mut record = make_record(
    "host-a",
    t0(),
    vec![StatisticRecord::new("tp99", 1.0, None, true)],
  );
  record.metric = metric.to_string();
  record
}

#[tokio::test(start_paused = true)]
async fn creates_and_reuses_aggregators() {
  let mut helper = Helper::new();
  helper.router.route_record(record("a")).unwrap();
  helper.router.route_record(record("a")).unwrap();
  helper.router.route_record(record("b")).unwrap();

  assert_eq!(2, helper.region.active_entities());
  assert_eq!(Some(0), helper.region.generation_of("cluster||service||a||PT1M"));
  assert_eq!(Some(1), helper.region.generation_of("cluster||service||b||PT1M"));
  assert_eq!(2, helper.region.stats.aggregators_started.get());
  assert_eq!(2, helper.region.stats.active_aggregators.get());

  let allocations = helper.region.shard_allocations();
  assert_eq!(2, allocations.values().sum::<usize>());
  let extractor = ShardExtractor::new(16).unwrap();
  assert!(allocations.contains_key(&extractor.shard_for_entity("cluster||service||a||PT1M")));

  // Both records for "a" land in the same aggregator.
  helper
    .inner
    .time_provider
    .advance(2.minutes() + 1.seconds());
  6.seconds().sleep().await;
  let mut emitted: Vec<_> = helper
    .inner
    .drain_emitted()
    .iter()
    .map(|data| (data.data[0].fqdsn.metric.clone(), data.data[0].population_size))
    .collect();
  emitted.sort();
  assert_eq!(vec![("a".to_string(), 2), ("b".to_string(), 1)], emitted);
}

#[tokio::test(start_paused = true)]
async fn idle_aggregators_are_passivated() {
  let helper = Helper::new();
  helper.router.route_record(record("a")).unwrap();
  assert_eq!(Some(0), helper.region.generation_of("cluster||service||a||PT1M"));

  31.minutes().sleep().await;
  assert_eq!(0, helper.region.active_entities());
  assert_eq!(None, helper.region.generation_of("cluster||service||a||PT1M"));
  assert_eq!(0, helper.region.stats.active_aggregators.get());

  // The next message starts a fresh incarnation.
  helper.router.route_record(record("a")).unwrap();
  assert_eq!(Some(1), helper.region.generation_of("cluster||service||a||PT1M"));
  assert_eq!(2, helper.region.stats.aggregators_started.get());
}

#[tokio::test(start_paused = true)]
async fn stale_passivation_is_ignored() {
  let helper = Helper::new();
  helper.router.route_record(record("a")).unwrap();

  helper.region.passivate(&EntityRef {
    entity_id: "cluster||service||a||PT1M".to_string(),
    generation: 7,
  });
  helper.region.passivate(&EntityRef {
    entity_id: "cluster||service||unknown||PT1M".to_string(),
    generation: 0,
  });
  assert_eq!(Some(0), helper.region.generation_of("cluster||service||a||PT1M"));
  assert_eq!(2, helper.region.stats.stale_passivations.get());

  helper.region.passivate(&EntityRef {
    entity_id: "cluster||service||a||PT1M".to_string(),
    generation: 0,
  });
  assert_eq!(0, helper.region.active_entities());
}

#[tokio::test(start_paused = true)]
async fn restarts_after_mailbox_closes() {
  let helper = Helper::new();
  let (tx, rx) = mpsc::unbounded_channel();
  drop(rx);
  helper.region.entities.lock().insert(
    "cluster||service||a||PT1M".to_string(),
    Entity {
      tx,
      generation: 42,
      shard_id: ShardId(0),
    },
  );

  helper.router.route_record(record("a")).unwrap();
  assert_eq!(Some(0), helper.region.generation_of("cluster||service||a||PT1M"));
  assert_eq!(1, helper.region.stats.aggregators_started.get());
}
