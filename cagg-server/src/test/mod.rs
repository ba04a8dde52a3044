// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{RunningServer, ServerHooks, run_server};
use bd_shutdown::ComponentShutdownTrigger;
use bytes::Bytes;
use cagg_common::singleton::SingletonManager;
use cagg_core::clock::TestTimeProvider;
use cagg_core::config::{AdminConfig, AggregationConfig, Config, EmitterConfig};
use cagg_core::emitter::Sink;
use cagg_core::model::{PeriodicData, StatisticRecord, StatisticSetRecord, Unit};
use cagg_core::statistics::Statistic;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::ext::NumericalDuration;
use time::macros::datetime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const T0: OffsetDateTime = datetime!(2024-01-01 0:00 UTC);

async fn make_admin_request(addr: SocketAddr, path: &str) -> (u16, String) {
  let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
  let response = client
    .get(format!("http://{addr}{path}").try_into().unwrap())
    .await
    .unwrap();
  let status = response.status().as_u16();
  let body = response.into_body().collect().await.unwrap().to_bytes();
  (status, String::from_utf8(body.to_vec()).unwrap())
}

fn make_record(host: &str, count: f64, sum: f64) -> StatisticSetRecord {
  StatisticSetRecord {
    cluster: "frontend".to_string(),
    service: "checkout".to_string(),
    metric: "latency".to_string(),
    host: host.to_string(),
    period: 1.minutes(),
    period_start: T0,
    statistics: vec![
      StatisticRecord::new("count", count, None, false),
      StatisticRecord::new("sum", sum, Some(Unit::Millisecond), false),
    ],
  }
}

//
// ChannelSink
//

struct ChannelSink {
  tx: mpsc::UnboundedSender<Arc<PeriodicData>>,
}

#[async_trait::async_trait]
impl Sink for ChannelSink {
  async fn record(&self, data: Arc<PeriodicData>) {
    let _ignored = self.tx.send(data);
  }

  async fn close(&self) {}
}

//
// HelperHooks
//

struct HelperHooks {
  tx: mpsc::Sender<RunningServer>,
}

#[async_trait::async_trait]
impl ServerHooks for HelperHooks {
  async fn server_started(&self, server: RunningServer) {
    self.tx.send(server).await.unwrap();
  }
}

//
// Helper
//

struct Helper {
  shutdown_trigger: Option<ComponentShutdownTrigger>,
  server: RunningServer,
  emitted_rx: mpsc::UnboundedReceiver<Arc<PeriodicData>>,
  join_handle: JoinHandle<anyhow::Result<()>>,
}

impl Helper {
  // Buckets are checked quickly and the wall clock sits well past T0, so every window fed by a
  // test is already past its grace deadline.
  async fn new() -> Self {
    let config = Config {
      aggregation: AggregationConfig {
        bucket_check_interval: Duration::from_millis(50),
        ..Default::default()
      },
      emitter: EmitterConfig { sinks: vec![] },
      admin: AdminConfig {
        bind: "127.0.0.1:0".to_string(),
      },
      ..Default::default()
    };
    let shutdown_trigger = ComponentShutdownTrigger::default();
    let mut shutdown = shutdown_trigger.make_shutdown();
    let (emitted_tx, emitted_rx) = mpsc::unbounded_channel();
    let (tx, mut rx) = mpsc::channel(1);
    let join_handle = tokio::spawn(async move {
      run_server(
        config,
        || async move { shutdown.cancelled().await },
        HelperHooks { tx },
        Arc::new(TestTimeProvider::new(T0 + 1.hours())),
        Arc::new(SingletonManager::default()),
        vec![Arc::new(ChannelSink { tx: emitted_tx }) as Arc<dyn Sink>],
      )
      .await
    });
    let server = rx.recv().await.unwrap();
    Self {
      shutdown_trigger: Some(shutdown_trigger),
      server,
      emitted_rx,
      join_handle,
    }
  }

  async fn next_emitted(&mut self) -> Arc<PeriodicData> {
    timeout(Duration::from_secs(5), self.emitted_rx.recv())
      .await
      .unwrap()
      .unwrap()
  }

  async fn shutdown(mut self) {
    self.shutdown_trigger.take().unwrap().shutdown().await;
    self.join_handle.await.unwrap().unwrap();
  }
}

#[tokio::test]
async fn records_flow_to_sinks() {
  let mut helper = Helper::new().await;
  helper
    .server
    .router
    .route_record(make_record("host-a", 2.0, 300.0))
    .unwrap();

  let emitted = helper.next_emitted().await;
  assert_eq!(T0, emitted.period_start);
  assert_eq!("frontend-cluster", emitted.dimensions["host"]);
  let values: Vec<_> = emitted
    .data
    .iter()
    .map(|datum| (datum.fqdsn.statistic, datum.value.value))
    .collect();
  assert_eq!(
    vec![(Statistic::Count, 2.0), (Statistic::Sum, 300.0)],
    values
  );
  helper.shutdown().await;
}

#[tokio::test]
async fn invalid_records_are_rejected() {
  let helper = Helper::new().await;
  let mut record = make_record("host-a", 1.0, 1.0);
  record.period = 0.seconds();
  assert!(helper.server.router.route_record(record).is_err());
  helper.shutdown().await;
}

#[tokio::test]
async fn admin_endpoints() {
  let helper = Helper::new().await;
  let address = helper.server.admin_address;

  assert_eq!(
    (200, "OK".to_string()),
    make_admin_request(address, "/healthcheck").await
  );
  let (status, metrics) = make_admin_request(address, "/metrics").await;
  assert_eq!(200, status);
  assert!(metrics.contains("heartbeat"), "{metrics}");
  let (status, body) = make_admin_request(address, "/status").await;
  assert_eq!(200, status);
  assert!(body.contains("\"is_leader\":true"), "{body}");

  helper.shutdown().await;
}
