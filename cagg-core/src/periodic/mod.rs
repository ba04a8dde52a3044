// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::model::{AggregatedData, format_period};
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

//
// PeriodMetricsSnapshot
//

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeriodMetricsSnapshot {
  pub period_start: Option<String>,
  pub metrics: usize,
  pub services: usize,
  pub statistics: usize,
  // Population sizes keyed by "service/cluster".
  pub samples: BTreeMap<String, u64>,
}

pub type PeriodicSnapshot = BTreeMap<String, PeriodMetricsSnapshot>;

//
// PeriodMetrics
//

// What this node computed during the most recent window start of one period.
#[derive(Default)]
struct PeriodMetrics {
  period_start: Option<OffsetDateTime>,
  metrics: HashSet<(String, String)>,
  services: HashSet<String>,
  statistics: HashSet<String>,
  samples: HashMap<(String, String), u64>,
}

impl PeriodMetrics {
  fn record(&mut self, datum: &AggregatedData, scope: &Scope) {
    match self.period_start {
      Some(current) if datum.period_start < current => {
        log::debug!(
          "ignoring {} for {} which precedes current start {current}",
          datum.fqdsn,
          datum.period_start
        );
        return;
      },
      Some(current) if datum.period_start > current => {
        self.dump(datum.period, scope);
        *self = Self {
          period_start: Some(datum.period_start),
          ..Self::default()
        };
      },
      Some(_) => {},
      None => self.period_start = Some(datum.period_start),
    }

    let fqdsn = &datum.fqdsn;
    self
      .metrics
      .insert((fqdsn.service.clone(), fqdsn.metric.clone()));
    self.services.insert(fqdsn.service.clone());
    self.statistics.insert(fqdsn.to_string());
    *self
      .samples
      .entry((fqdsn.service.clone(), fqdsn.cluster.clone()))
      .or_default() += datum.population_size;
  }

  // Publish the totals of the window that just closed.
  fn dump(&self, period: Duration, scope: &Scope) {
    let period = format_period(period);
    let labels = HashMap::from([("period".to_string(), period.clone())]);
    scope
      .counter_with_labels("metrics_seen", labels.clone())
      .inc_by(self.metrics.len() as u64);
    scope
      .counter_with_labels("services_seen", labels.clone())
      .inc_by(self.services.len() as u64);
    scope
      .counter_with_labels("statistics_seen", labels)
      .inc_by(self.statistics.len() as u64);
    for ((service, cluster), samples) in &self.samples {
      scope
        .counter_with_labels(
          "samples",
          HashMap::from([
            ("period".to_string(), period.clone()),
            ("service".to_string(), service.clone()),
            ("cluster".to_string(), cluster.clone()),
          ]),
        )
        .inc_by(*samples);
    }
  }

  fn snapshot(&self) -> PeriodMetricsSnapshot {
    PeriodMetricsSnapshot {
      period_start: self
        .period_start
        .and_then(|start| start.format(&Rfc3339).ok()),
      metrics: self.metrics.len(),
      services: self.services.len(),
      statistics: self.statistics.len(),
      samples: self
        .samples
        .iter()
        .map(|((service, cluster), samples)| (format!("{service}/{cluster}"), *samples))
        .collect(),
    }
  }
}

enum Request {
  Record(AggregatedData),
  Snapshot(oneshot::Sender<PeriodicSnapshot>),
}

//
// PeriodicStatisticsHandle
//

#[derive(Clone)]
pub struct PeriodicStatisticsHandle {
  tx: mpsc::UnboundedSender<Request>,
}

impl PeriodicStatisticsHandle {
  pub fn record(&self, datum: AggregatedData) {
    // A stopped observer only loses local bookkeeping.
    let _ignored = self.tx.send(Request::Record(datum));
  }

  pub async fn snapshot(&self) -> Option<PeriodicSnapshot> {
    let (tx, rx) = oneshot::channel();
    self.tx.send(Request::Snapshot(tx)).ok()?;
    rx.await.ok()
  }
}

//
// PeriodicStatistics
//

// Observes every result computed on this node and keeps per period activity counts.
pub struct PeriodicStatistics {
  periods: HashMap<Duration, PeriodMetrics>,
  scope: Scope,
}

impl PeriodicStatistics {
  pub fn spawn(
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> (PeriodicStatisticsHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let periodic = Self {
      periods: HashMap::new(),
      scope: scope.scope("periodic"),
    };
    (
      PeriodicStatisticsHandle { tx },
      tokio::spawn(periodic.run(rx, shutdown)),
    )
  }

  async fn run(
    mut self,
    mut rx: mpsc::UnboundedReceiver<Request>,
    mut shutdown: ComponentShutdown,
  ) {
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        request = rx.recv() => {
          let Some(request) = request else {
            break;
          };
          self.handle(request);
        }
      }
    }
  }

  fn handle(&mut self, request: Request) {
    match request {
      Request::Record(datum) => {
        self
          .periods
          .entry(datum.period)
          .or_default()
          .record(&datum, &self.scope);
      },
      Request::Snapshot(tx) => {
        let _ignored = tx.send(
          self
            .periods
            .iter()
            .map(|(period, metrics)| (format_period(*period), metrics.snapshot()))
            .collect(),
        );
      },
    }
  }
}
