// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod bucket;

use crate::bookkeeper::LifecycleTracker;
use crate::clock::TimeProvider;
use crate::config::AggregationConfig;
use crate::emitter::EmitterHandle;
use crate::model::{AggregatedData, Fqdsn, PeriodicData, Quantity, StatisticSetRecord};
use crate::periodic::PeriodicStatisticsHandle;
use crate::router::{AggregationMessage, EntityRef};
use crate::statistics::{Statistic, StatisticRegistry};
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use bucket::AggregationBucket;
use prometheus::IntCounter;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use time::ext::NumericalDuration;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

//
// Stats
//

#[derive(Clone)]
pub struct Stats {
  records_received: IntCounter,
  late_records_dropped: IntCounter,
  identity_mismatch: IntCounter,
  buckets_created: IntCounter,
  buckets_finalized: IntCounter,
  statistics_failed: IntCounter,
  crashes: IntCounter,
  passivations: IntCounter,
}

impl Stats {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    let scope = scope.scope("aggregator");
    Self {
      records_received: scope.counter("records_received"),
      late_records_dropped: scope.counter("late_records_dropped"),
      identity_mismatch: scope.counter("identity_mismatch"),
      buckets_created: scope.counter("buckets_created"),
      buckets_finalized: scope.counter("buckets_finalized"),
      statistics_failed: scope.counter("statistics_failed"),
      crashes: scope.counter("crashes"),
      passivations: scope.counter("passivations"),
    }
  }
}

//
// AggregatorContext
//

// Everything an aggregator needs that is shared by all aggregators in the process.
pub struct AggregatorContext {
  pub config: AggregationConfig,
  pub registry: Arc<StatisticRegistry>,
  pub time_provider: Arc<dyn TimeProvider>,
  pub emitter: EmitterHandle,
  pub periodic_statistics: PeriodicStatisticsHandle,
  pub lifecycle: Arc<dyn LifecycleTracker>,
  pub stats: Stats,
}

//
// Identity
//

#[derive(Clone, Debug, PartialEq, Eq)]
struct Identity {
  cluster: String,
  service: String,
  metric: String,
  period: Duration,
  // Only set for aggregators fed pre-aggregated single statistic data.
  statistic: Option<Statistic>,
}

struct Work {
  identity: Identity,
  period_start: OffsetDateTime,
  contributions: Vec<AggregatedData>,
}

impl Work {
  fn from_message(message: &AggregationMessage, registry: &StatisticRegistry) -> Option<Self> {
    match message {
      AggregationMessage::StatisticSet(record) => Some(Self::from_record(record, registry)),
      AggregationMessage::Aggregated(datum) => Some(Self {
        identity: Identity {
          cluster: datum.fqdsn.cluster.clone(),
          service: datum.fqdsn.service.clone(),
          metric: datum.fqdsn.metric.clone(),
          period: datum.period,
          statistic: Some(datum.fqdsn.statistic),
        },
        period_start: datum.period_start,
        contributions: vec![datum.clone()],
      }),
      AggregationMessage::Shutdown => None,
    }
  }

  fn from_record(record: &StatisticSetRecord, registry: &StatisticRegistry) -> Self {
    let contributions = record
      .statistics
      .iter()
      .filter_map(|statistic_record| {
        let Some(statistic) = registry.lookup(&statistic_record.statistic) else {
          warn_every!(
            15.seconds(),
            "unknown statistic '{}' for metric {}, skipping",
            statistic_record.statistic,
            record.metric
          );
          return None;
        };
        Some(AggregatedData {
          fqdsn: Fqdsn {
            cluster: record.cluster.clone(),
            service: record.service.clone(),
            metric: record.metric.clone(),
            statistic,
          },
          host: record.host.clone(),
          period: record.period,
          period_start: record.period_start,
          value: statistic_record.quantity(),
          samples: statistic_record
            .samples
            .iter()
            .map(|sample| Quantity::new(*sample, statistic_record.unit))
            .collect(),
          population_size: statistic_record.population_size(),
          is_specified: statistic_record.user_specified,
          histogram: statistic_record.histogram.clone(),
        })
      })
      .collect();

    Self {
      identity: Identity {
        cluster: record.cluster.clone(),
        service: record.service.clone(),
        metric: record.metric.clone(),
        period: record.period,
        statistic: None,
      },
      period_start: record.period_start,
      contributions,
    }
  }
}

//
// AggregatorState
//

// Everything lost when an aggregator restarts.
#[derive(Default)]
struct AggregatorState {
  identity: Option<Identity>,
  host: String,
  buckets: VecDeque<AggregationBucket>,
  last_finalized: Option<OffsetDateTime>,
  emitted: BTreeSet<Statistic>,
}

impl AggregatorState {
  fn process(&mut self, message: &AggregationMessage, context: &AggregatorContext) {
    let Some(work) = Work::from_message(message, &context.registry) else {
      return;
    };
    context.stats.records_received.inc();

    match &self.identity {
      None => self.initialize(&work, context),
      Some(identity) if *identity != work.identity => {
        context.stats.identity_mismatch.inc();
        log::error!(
          "received a work item for another aggregator: expected {identity:?}, got {:?}",
          work.identity
        );
      },
      Some(_) => {},
    }

    // Buckets are only ever created at the tail. Anything older than the newest open bucket
    // must land in a bucket that already exists.
    let period_start = work.period_start;
    let index = match self
      .buckets
      .binary_search_by(|bucket| bucket.period_start().cmp(&period_start))
    {
      Ok(index) => index,
      Err(index)
        if index == self.buckets.len()
          && self.last_finalized.is_none_or(|last| period_start > last) =>
      {
        log::debug!("creating bucket for period start {period_start}");
        context.stats.buckets_created.inc();
        self.buckets.push_back(AggregationBucket::new(period_start));
        index
      },
      Err(_) => {
        context.stats.late_records_dropped.inc();
        warn_every!(
          15.seconds(),
          "no bucket found for {:?} with period start {}, dropping",
          work.identity,
          period_start
        );
        return;
      },
    };
    for contribution in work.contributions {
      self.buckets[index].update(contribution);
    }
  }

  fn initialize(&mut self, work: &Work, context: &AggregatorContext) {
    log::debug!("initializing aggregator for {:?}", work.identity);
    self.host = format!(
      "{}-cluster{}",
      work.identity.cluster, context.config.cluster_host_suffix
    );
    self.identity = Some(work.identity.clone());
    for contribution in &work.contributions {
      context.lifecycle.aggregator_started(contribution);
    }
  }

  fn fqdsn(identity: &Identity, statistic: Statistic) -> Fqdsn {
    Fqdsn {
      cluster: identity.cluster.clone(),
      service: identity.service.clone(),
      metric: identity.metric.clone(),
      statistic,
    }
  }

  // Finalize every bucket whose grace deadline has passed, oldest first, stopping at the first one
  // still open.
  fn check_buckets(&mut self, context: &AggregatorContext) {
    let Some(identity) = &self.identity else {
      return;
    };
    let now = context.time_provider.now_utc();

    while self.buckets.front().is_some_and(|bucket| {
      bucket.period_start() + identity.period + context.config.grace_period < now
    }) {
      let Some(bucket) = self.buckets.pop_front() else {
        break;
      };
      let finalized = bucket.finalize();
      context.stats.buckets_finalized.inc();
      context.stats.statistics_failed.inc_by(finalized.failures);
      self.last_finalized = Some(finalized.period_start);

      let mut data = Vec::with_capacity(finalized.statistics.len());
      for computed in finalized.statistics {
        self.emitted.insert(computed.statistic);
        let datum = AggregatedData {
          fqdsn: Self::fqdsn(identity, computed.statistic),
          host: self.host.clone(),
          period: identity.period,
          period_start: finalized.period_start,
          value: computed.value.value,
          samples: Vec::new(),
          population_size: computed.population_size,
          is_specified: computed.is_specified,
          histogram: computed.value.histogram,
        };
        log::debug!("computed result {datum:?}");
        context.periodic_statistics.record(datum.clone());
        data.push(datum);
      }

      if data.is_empty() {
        log::debug!(
          "bucket {} of {identity:?} produced no statistics",
          finalized.period_start
        );
        continue;
      }
      context.emitter.emit(PeriodicData {
        period: identity.period,
        period_start: finalized.period_start,
        dimensions: BTreeMap::from([("host".to_string(), self.host.clone())]),
        data,
        conditions: Vec::new(),
      });
    }
  }

  fn update_bookkeeper(&mut self, context: &AggregatorContext) {
    let Some(identity) = &self.identity else {
      return;
    };
    for statistic in std::mem::take(&mut self.emitted) {
      context.lifecycle.aggregator_started(&AggregatedData {
        fqdsn: Self::fqdsn(identity, statistic),
        host: self.host.clone(),
        period: identity.period,
        period_start: self.last_finalized.unwrap_or(OffsetDateTime::UNIX_EPOCH),
        value: Quantity::unitless(0.0),
        samples: Vec::new(),
        population_size: 0,
        is_specified: false,
        histogram: None,
      });
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
  panic
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("unknown panic")
}

//
// Aggregator
//

// Owns the rolling window of buckets for one entity. Runs as its own task and handles one message
// at a time from its mailbox.
pub struct Aggregator {
  entity: EntityRef,
  context: Arc<AggregatorContext>,
  passivate_tx: mpsc::UnboundedSender<EntityRef>,
  state: AggregatorState,
}

impl Aggregator {
  pub fn spawn(
    entity: EntityRef,
    context: Arc<AggregatorContext>,
    passivate_tx: mpsc::UnboundedSender<EntityRef>,
    shutdown: ComponentShutdown,
  ) -> (mpsc::UnboundedSender<AggregationMessage>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let aggregator = Self {
      entity,
      context,
      passivate_tx,
      state: AggregatorState::default(),
    };
    (tx, tokio::spawn(aggregator.run(rx, shutdown)))
  }

  async fn run(
    mut self,
    mut mailbox: mpsc::UnboundedReceiver<AggregationMessage>,
    mut shutdown: ComponentShutdown,
  ) {
    let config = self.context.config.clone();
    let mut bucket_check = interval_at(
      Instant::now() + config.bucket_check_interval,
      config.bucket_check_interval,
    );
    bucket_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut bookkeeping = interval_at(
      Instant::now() + config.bookkeeper_initial_delay,
      config.bookkeeper_interval,
    );
    bookkeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(config.idle_timeout);
    tokio::pin!(idle);
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);
    let mut passivation_requested = false;

    log::debug!("aggregator {} started", self.entity.entity_id);
    loop {
      tokio::select! {
        () = &mut shutdown => break,
        message = mailbox.recv() => {
          let Some(message) = message else {
            break;
          };
          if matches!(message, AggregationMessage::Shutdown) {
            log::debug!("aggregator {} shutting down after passivation", self.entity.entity_id);
            break;
          }
          idle.as_mut().reset(Instant::now() + config.idle_timeout);
          self.guarded(&message, |state, context| state.process(&message, context));
        },
        _ = bucket_check.tick() => {
          self.guarded(&"bucket check", AggregatorState::check_buckets);
        },
        _ = bookkeeping.tick() => {
          self.guarded(&"bookkeeper update", AggregatorState::update_bookkeeper);
        },
        () = &mut idle, if !passivation_requested => {
          log::debug!("aggregator {} idle, requesting passivation", self.entity.entity_id);
          passivation_requested = true;
          self.context.stats.passivations.inc();
          if self.passivate_tx.send(self.entity.clone()).is_err() {
            break;
          }
        },
      }
    }
    log::debug!("aggregator {} stopped", self.entity.entity_id);
  }

  // Run one unit of work. A panic is logged with the work that triggered it and the aggregator
  // restarts with empty state. Buckets in flight are lost.
  fn guarded(
    &mut self,
    trigger: &dyn Debug,
    work: impl FnOnce(&mut AggregatorState, &AggregatorContext),
  ) {
    let context = &*self.context;
    let state = &mut self.state;
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| work(state, context))) {
      self.context.stats.crashes.inc();
      log::error!(
        "aggregator {} crashed processing {trigger:?}: {}; restarting with empty state",
        self.entity.entity_id,
        panic_message(panic.as_ref())
      );
      self.state = AggregatorState::default();
    }
  }
}
