// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

pub mod buffer;
pub mod log_sink;

use crate::config::SinkConfig;
use crate::model::PeriodicData;
use async_trait::async_trait;
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use buffer::BufferedSink;
use prometheus::IntCounter;
use std::sync::Arc;
use time::ext::NumericalDuration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

//
// Sink
//

// Destination for computed periodic results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sink: Send + Sync {
  async fn record(&self, data: Arc<PeriodicData>);

  // Flush anything still pending. No records are sent after this is called.
  async fn close(&self);
}

#[must_use]
pub fn build_sink(config: &SinkConfig, scope: &Scope) -> Arc<dyn Sink> {
  match config {
    SinkConfig::Log => Arc::new(log_sink::LogSink {}),
    SinkConfig::Buffered {
      max_buffered,
      inner,
    } => {
      let scope = scope.scope("buffered");
      BufferedSink::new(*max_buffered, build_sink(inner, &scope), &scope)
    },
  }
}

//
// EmitterHandle
//

// Fire and forget handle used by aggregators.
#[derive(Clone)]
pub struct EmitterHandle {
  tx: mpsc::UnboundedSender<Arc<PeriodicData>>,
}

impl EmitterHandle {
  #[must_use]
  pub const fn new(tx: mpsc::UnboundedSender<Arc<PeriodicData>>) -> Self {
    Self { tx }
  }

  pub fn emit(&self, data: PeriodicData) {
    if self.tx.send(Arc::new(data)).is_err() {
      warn_every!(15.seconds(), "{}", "emitter stopped, dropping periodic data");
    }
  }
}

//
// Emitter
//

// Forwards every periodic result to each configured sink, one sink at a time in configuration
// order.
pub struct Emitter {
  sinks: Vec<Arc<dyn Sink>>,
  records_emitted: IntCounter,
}

impl Emitter {
  pub fn spawn(
    sinks: Vec<Arc<dyn Sink>>,
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> (EmitterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let emitter = Self {
      sinks,
      records_emitted: scope.scope("emitter").counter("records_emitted"),
    };
    (EmitterHandle::new(tx), tokio::spawn(emitter.run(rx, shutdown)))
  }

  async fn run(
    self,
    mut rx: mpsc::UnboundedReceiver<Arc<PeriodicData>>,
    mut shutdown: ComponentShutdown,
  ) {
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        data = rx.recv() => {
          let Some(data) = data else {
            break;
          };
          self.fan_out(data).await;
        }
      }
    }

    log::debug!("emitter draining before shutdown");
    while let Ok(data) = rx.try_recv() {
      self.fan_out(data).await;
    }
    for sink in &self.sinks {
      sink.close().await;
    }
    log::debug!("emitter stopped");
  }

  async fn fan_out(&self, data: Arc<PeriodicData>) {
    self.records_emitted.inc();
    for sink in &self.sinks {
      sink.record(data.clone()).await;
    }
  }
}
