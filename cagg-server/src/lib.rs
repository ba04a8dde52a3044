// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
mod test;

use anyhow::Context;
use bd_server_stats::stats::Collector;
use bd_shutdown::ComponentShutdownTrigger;
use cagg_common::singleton::SingletonManager;
use cagg_core::admin::AdminState;
use cagg_core::aggregation::{AggregatorContext, Stats};
use cagg_core::bookkeeper::memory::InMemoryBookkeeper;
use cagg_core::bookkeeper::{Bookkeeper, LifecycleTracker};
use cagg_core::clock::TimeProvider;
use cagg_core::cluster::{ClusterStatusCache, LocalMembership, Membership};
use cagg_core::config::Config;
use cagg_core::emitter::{Emitter, Sink, build_sink};
use cagg_core::periodic::PeriodicStatistics;
use cagg_core::router::region::LocalShardRegion;
use cagg_core::router::{AggregationRouter, ShardExtractor};
use cagg_core::statistics::StatisticRegistry;
use cagg_core::status::Status;
use itertools::Itertools;
use log::info;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  cagg_common::global_initialize();
}

//
// RunningServer
//

// Handed to the embedder once every component is up.
pub struct RunningServer {
  pub router: AggregationRouter,
  pub collector: Collector,
  pub admin_address: SocketAddr,
}

//
// ServerHooks
//

#[async_trait::async_trait]
pub trait ServerHooks {
  async fn server_started(&self, server: RunningServer);
}

// Wire every component together and run until the shutdown future resolves. Sinks in
// `extra_sinks` receive emitted data alongside the configured ones.
pub async fn run_server<ShutdownFuture: Future<Output = ()>>(
  config: Config,
  shutdown: impl FnOnce() -> ShutdownFuture,
  hooks: impl ServerHooks,
  time_provider: Arc<dyn TimeProvider>,
  singleton_manager: Arc<SingletonManager>,
  extra_sinks: Vec<Arc<dyn Sink>>,
) -> anyhow::Result<()> {
  config.validate()?;

  // Setup stats
  let collector = Collector::default();
  let scope = collector.scope(&config.meta_prefix);
  scope.gauge("heartbeat").set(1);

  let aggregation_shutdown_trigger = ComponentShutdownTrigger::default();
  let emitter_shutdown_trigger = ComponentShutdownTrigger::default();
  let components_shutdown_trigger = ComponentShutdownTrigger::default();
  let admin_shutdown_trigger = ComponentShutdownTrigger::default();

  let listener = TcpListener::bind(&config.admin.bind)
    .await
    .with_context(|| format!("can't bind admin server to {}", config.admin.bind))?;
  let admin_address = listener.local_addr()?;
  let membership: Arc<dyn Membership> = Arc::new(LocalMembership::new(admin_address.to_string()));

  let bookkeeper = Bookkeeper::elect(
    &singleton_manager,
    Arc::new(InMemoryBookkeeper::default()),
    config.bookkeeper.refresh_interval,
    &scope,
    components_shutdown_trigger.make_shutdown(),
  )
  .await;
  let (periodic_statistics, _) =
    PeriodicStatistics::spawn(&scope, components_shutdown_trigger.make_shutdown());
  let (cluster_status, _) = ClusterStatusCache::spawn(
    membership.clone(),
    config.status.cluster_poll_interval,
    components_shutdown_trigger.make_shutdown(),
  );

  let mut sinks: Vec<_> = config
    .emitter
    .sinks
    .iter()
    .map(|sink| build_sink(sink, &scope))
    .collect();
  sinks.extend(extra_sinks);
  info!("emitting to {} sink(s)", sinks.len());
  let (emitter, emitter_join) =
    Emitter::spawn(sinks, &scope, emitter_shutdown_trigger.make_shutdown());

  let registry = StatisticRegistry::default();
  info!(
    "known statistics: {}",
    registry.statistics().iter().map(ToString::to_string).join(", ")
  );
  let lifecycle: Arc<dyn LifecycleTracker> = bookkeeper.clone();
  let context = Arc::new(AggregatorContext {
    config: config.aggregation.clone(),
    registry: Arc::new(registry),
    time_provider,
    emitter,
    periodic_statistics: periodic_statistics.clone(),
    lifecycle,
    stats: Stats::new(&scope),
  });
  let region = LocalShardRegion::new(
    context,
    &scope,
    aggregation_shutdown_trigger.make_handle(),
  );
  let router = AggregationRouter::new(
    ShardExtractor::new(config.router.shard_count)?,
    region.clone(),
  );

  // The local substrate has no remote associations, so nothing publishes here yet.
  let (_association_errors, association_errors_rx) = broadcast::channel(16);
  let status = Status::new(
    bookkeeper,
    cluster_status,
    periodic_statistics,
    membership,
    region,
    config.status.ask_timeout,
    association_errors_rx,
    components_shutdown_trigger.make_shutdown(),
  );

  // Spawn admin server
  let admin_state = AdminState::new(collector.clone(), status);
  let admin_shutdown = admin_shutdown_trigger.make_shutdown();
  tokio::spawn(async move {
    if let Err(e) = admin_state.spawn_server(listener, admin_shutdown).await {
      log::error!("admin server failed: {e}");
    }
  });

  info!("aggregator started, admin listening on {admin_address}");
  hooks
    .server_started(RunningServer {
      router,
      collector,
      admin_address,
    })
    .await;

  shutdown().await;

  // Aggregators stop first so nothing new reaches the emitter, which then drains into the sinks.
  info!("shutting down");
  admin_shutdown_trigger.shutdown().await;
  aggregation_shutdown_trigger.shutdown().await;
  emitter_shutdown_trigger.shutdown().await;
  if let Err(e) = emitter_join.await {
    log::warn!("emitter task failed: {e}");
  }
  components_shutdown_trigger.shutdown().await;
  info!("runtime terminated");
  Ok(())
}
