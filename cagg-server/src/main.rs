// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::Context;
use cagg_common::global_initialize;
use cagg_common::singleton::SingletonManager;
use cagg_core::clock::RealTimeProvider;
use cagg_core::config::Config;
use cagg_server::{RunningServer, ServerHooks, run_server};
use clap::Parser;
use log::info;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tikv_jemallocator::Jemalloc;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug, Clone)]
struct Options {
  #[arg(short = 'c', long = "config")]
  pub config: String,

  #[arg(long = "config-check-and-exit")]
  pub config_check: bool,
}

struct NullHooks {}

#[async_trait::async_trait]
impl ServerHooks for NullHooks {
  async fn server_started(&self, _server: RunningServer) {}
}

fn main() -> anyhow::Result<()> {
  global_initialize();
  let opts = Options::parse();
  info!("cagg-server loading: {}", env!("CARGO_PKG_VERSION"));

  let config: Config = cagg_core::config::load_from_file(&opts.config)
    .with_context(|| format!("can't load config file from {}", opts.config))?;
  info!("loaded config file {}", opts.config);
  if opts.config_check {
    info!("--config-check-and-exit set, exiting");
    return Ok(());
  }

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::MIN
  });
  log::info!("running server with {num_threads} workers");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()
    .context("can't build tokio runtime")?;

  runtime.block_on(async {
    // Trap ctrl+c and sigterm messages and perform a clean shutdown
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    run_server(
      config,
      || async move {
        select! {
          _ = sigint.recv() => info!("received sigint"),
          _ = sigterm.recv() => info!("received sigterm"),
        }
      },
      NullHooks {},
      Arc::new(RealTimeProvider {}),
      Arc::new(SingletonManager::default()),
      Vec::new(),
    )
    .await
  })
}
