// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::aggregation::{AggregatorContext, Stats};
use crate::bookkeeper::memory::InMemoryBookkeeper;
use crate::bookkeeper::{Bookkeeper, LifecycleTracker};
use crate::clock::TestTimeProvider;
use crate::cluster::{AssociationErrorEvent, ClusterStatusCache, Membership};
use crate::config::AggregationConfig;
use crate::emitter::{EmitterHandle, Sink};
use crate::model::{
  AggregatedData,
  Fqdsn,
  PeriodicData,
  Quantity,
  StatisticRecord,
  StatisticSetRecord,
};
use crate::periodic::{PeriodicStatistics, PeriodicStatisticsHandle};
use crate::router::{MockClusterSubstrate, ShardId};
use crate::statistics::StatisticRegistry;
use crate::status::Status;
use async_trait::async_trait;
use bd_server_stats::stats::Scope;
use bd_server_stats::test::util::stats::Helper as StatsHelper;
use bd_shutdown::ComponentShutdownTrigger;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use time::ext::NumericalDuration;
use time::macros::datetime;
use tokio::sync::{broadcast, mpsc};

#[must_use]
pub const fn t0() -> OffsetDateTime {
  datetime!(2024-01-01 0:00 UTC)
}

pub fn make_aggregated(statistic: &str, value: Quantity) -> AggregatedData {
  AggregatedData {
    fqdsn: Fqdsn {
      cluster: "cluster".to_string(),
      service: "service".to_string(),
      metric: "latency".to_string(),
      statistic: StatisticRegistry::default().lookup(statistic).unwrap(),
    },
    host: "host".to_string(),
    period: 1.minutes(),
    period_start: t0(),
    value,
    samples: Vec::new(),
    population_size: 1,
    is_specified: true,
    histogram: None,
  }
}

pub fn make_record(
  host: &str,
  period_start: OffsetDateTime,
  statistics: Vec<StatisticRecord>,
) -> StatisticSetRecord {
  StatisticSetRecord {
    cluster: "cluster".to_string(),
    service: "service".to_string(),
    metric: "latency".to_string(),
    host: host.to_string(),
    period: 1.minutes(),
    period_start,
    statistics,
  }
}

pub fn make_periodic(period_start: OffsetDateTime) -> PeriodicData {
  let mut datum = make_aggregated("count", Quantity::unitless(1.0));
  datum.period_start = period_start;
  PeriodicData {
    period: datum.period,
    period_start,
    dimensions: BTreeMap::from([("host".to_string(), "cluster-cluster".to_string())]),
    data: vec![datum],
    conditions: Vec::new(),
  }
}

//
// RecordingLifecycle
//

#[derive(Default)]
pub struct RecordingLifecycle {
  pub started: Mutex<Vec<AggregatedData>>,
}

impl LifecycleTracker for RecordingLifecycle {
  fn aggregator_started(&self, datum: &AggregatedData) {
    self.started.lock().push(datum.clone());
  }
}

//
// RecordingSink
//

#[derive(Default)]
pub struct RecordingSink {
  pub records: Mutex<Vec<Arc<PeriodicData>>>,
  pub closed: AtomicBool,
}

impl RecordingSink {
  pub fn period_starts(&self) -> Vec<OffsetDateTime> {
    self
      .records
      .lock()
      .iter()
      .map(|record| record.period_start)
      .collect()
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Sink for RecordingSink {
  async fn record(&self, data: Arc<PeriodicData>) {
    self.records.lock().push(data);
  }

  async fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
  }
}

//
// AggregatorHelper
//

pub struct AggregatorHelper {
  pub stats_helper: StatsHelper,
  pub time_provider: Arc<TestTimeProvider>,
  pub lifecycle: Arc<RecordingLifecycle>,
  pub emitted_rx: mpsc::UnboundedReceiver<Arc<PeriodicData>>,
  pub periodic: PeriodicStatisticsHandle,
  pub shutdown_trigger: ComponentShutdownTrigger,
}

impl AggregatorHelper {
  pub fn drain_emitted(&mut self) -> Vec<Arc<PeriodicData>> {
    let mut emitted = Vec::new();
    while let Ok(data) = self.emitted_rx.try_recv() {
      emitted.push(data);
    }
    emitted
  }
}

// Must be called from within a tokio runtime.
pub fn aggregator_context_for_test(
  config: AggregationConfig,
) -> (AggregatorHelper, Arc<AggregatorContext>) {
  let stats_helper = StatsHelper::default();
  let shutdown_trigger = ComponentShutdownTrigger::default();
  let time_provider = Arc::new(TestTimeProvider::new(t0()));
  let lifecycle = Arc::new(RecordingLifecycle::default());
  let (emitted_tx, emitted_rx) = mpsc::unbounded_channel();
  let (periodic, _) = PeriodicStatistics::spawn(
    &stats_helper.collector().scope("test"),
    shutdown_trigger.make_shutdown(),
  );
  let context = Arc::new(AggregatorContext {
    config,
    registry: Arc::new(StatisticRegistry::default()),
    time_provider: time_provider.clone(),
    emitter: EmitterHandle::new(emitted_tx),
    periodic_statistics: periodic.clone(),
    lifecycle: lifecycle.clone(),
    stats: Stats::new(&stats_helper.collector().scope("test")),
  });
  (
    AggregatorHelper {
      stats_helper,
      time_provider,
      lifecycle,
      emitted_rx,
      periodic,
      shutdown_trigger,
    },
    context,
  )
}

//
// StatusHelper
//

pub struct StatusHelper {
  pub status: Status,
  pub association_errors: broadcast::Sender<AssociationErrorEvent>,
  pub shutdown_trigger: ComponentShutdownTrigger,
}

// Status backed by real component actors and a fixed shard layout. Must be called from within a
// tokio runtime.
pub fn status_for_test(membership: Arc<dyn Membership>, scope: &Scope) -> StatusHelper {
  let shutdown_trigger = ComponentShutdownTrigger::default();
  let (bookkeeper, _) = Bookkeeper::spawn(
    Arc::new(InMemoryBookkeeper::default()),
    Duration::from_secs(60),
    scope,
    shutdown_trigger.make_shutdown(),
  );
  let (cluster, _) = ClusterStatusCache::spawn(
    membership.clone(),
    Duration::from_secs(10),
    shutdown_trigger.make_shutdown(),
  );
  let (periodic, _) = PeriodicStatistics::spawn(scope, shutdown_trigger.make_shutdown());
  let mut substrate = MockClusterSubstrate::new();
  substrate
    .expect_shard_allocations()
    .returning(|| BTreeMap::from([(ShardId(7), 2)]));
  let (association_errors, association_errors_rx) = broadcast::channel(16);
  let status = Status::new(
    Arc::new(bookkeeper),
    cluster,
    periodic,
    membership,
    Arc::new(substrate),
    Duration::from_secs(3),
    association_errors_rx,
    shutdown_trigger.make_shutdown(),
  );
  StatusHelper {
    status,
    association_errors,
    shutdown_trigger,
  }
}
