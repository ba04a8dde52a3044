// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod memory;

use crate::model::AggregatedData;
use async_trait::async_trait;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use cagg_common::singleton::SingletonManager;
use prometheus::IntCounter;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const SINGLETON_NAME: &str = "bookkeeper";

//
// BookkeeperData
//

// Cluster wide summary of what is being aggregated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BookkeeperData {
  pub clusters: u64,
  pub services: u64,
  pub metrics: u64,
  pub statistics: u64,
}

//
// BookkeeperPersistence
//

// Storage backend that remembers which metrics and statistics exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookkeeperPersistence: Send + Sync {
  fn insert_metric(&self, datum: &AggregatedData);
  async fn get_summary(&self) -> anyhow::Result<BookkeeperData>;
}

//
// LifecycleTracker
//

// Notified when an aggregator starts and periodically while it keeps producing statistics.
#[cfg_attr(test, mockall::automock)]
pub trait LifecycleTracker: Send + Sync {
  fn aggregator_started(&self, datum: &AggregatedData);
}

//
// Stats
//

struct Stats {
  notifications: IntCounter,
  refresh_failures: IntCounter,
}

pub(crate) enum Request {
  Started(AggregatedData),
  Summary(oneshot::Sender<Option<BookkeeperData>>),
  Refreshed(anyhow::Result<BookkeeperData>),
}

//
// BookkeeperHandle
//

#[derive(Clone)]
pub struct BookkeeperHandle {
  tx: mpsc::UnboundedSender<Request>,
}

impl BookkeeperHandle {
  // The cached summary, or None before the first successful refresh.
  pub async fn summary(&self) -> Option<BookkeeperData> {
    let (tx, rx) = oneshot::channel();
    self.tx.send(Request::Summary(tx)).ok()?;
    rx.await.ok().flatten()
  }

  // A handle whose requests queue up on the returned receiver and are never answered.
  #[cfg(test)]
  pub(crate) fn stalled() -> (Self, mpsc::UnboundedReceiver<Request>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl LifecycleTracker for BookkeeperHandle {
  fn aggregator_started(&self, datum: &AggregatedData) {
    if self.tx.send(Request::Started(datum.clone())).is_err() {
      log::debug!("bookkeeper stopped, dropping notification for {}", datum.fqdsn);
    }
  }
}

//
// Bookkeeper
//

// Serializes writes to the persistence backend and serves reads from a summary that is refreshed
// in the background. A failed refresh keeps the previous summary.
pub struct Bookkeeper {
  persistence: Arc<dyn BookkeeperPersistence>,
  refresh_interval: Duration,
  cache: Option<BookkeeperData>,
  refreshing: bool,
  stats: Stats,
}

impl Bookkeeper {
  pub fn spawn(
    persistence: Arc<dyn BookkeeperPersistence>,
    refresh_interval: Duration,
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> (BookkeeperHandle, JoinHandle<()>) {
    let scope = scope.scope("bookkeeper");
    let (tx, rx) = mpsc::unbounded_channel();
    let bookkeeper = Self {
      persistence,
      refresh_interval,
      cache: None,
      refreshing: false,
      stats: Stats {
        notifications: scope.counter("notifications"),
        refresh_failures: scope.counter("refresh_failures"),
      },
    };
    (
      BookkeeperHandle { tx: tx.clone() },
      tokio::spawn(bookkeeper.run(tx, rx, shutdown)),
    )
  }

  // Elect the process wide bookkeeper, spawning it on first use.
  pub async fn elect(
    singleton_manager: &SingletonManager,
    persistence: Arc<dyn BookkeeperPersistence>,
    refresh_interval: Duration,
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> Arc<BookkeeperHandle> {
    let Ok(handle) = singleton_manager
      .get_or_init::<_, Infallible>(SINGLETON_NAME, async move {
        let (handle, _) = Self::spawn(persistence, refresh_interval, scope, shutdown);
        Ok(Arc::new(handle))
      })
      .await;
    handle
  }

  async fn run(
    mut self,
    tx: mpsc::UnboundedSender<Request>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    mut shutdown: ComponentShutdown,
  ) {
    let mut refresh = tokio::time::interval(self.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        _ = refresh.tick() => self.start_refresh(&tx),
        request = rx.recv() => {
          let Some(request) = request else {
            break;
          };
          self.handle(request);
        }
      }
    }
    log::debug!("bookkeeper stopped");
  }

  fn start_refresh(&mut self, tx: &mpsc::UnboundedSender<Request>) {
    if self.refreshing {
      log::debug!("bookkeeper refresh still in flight, skipping");
      return;
    }
    self.refreshing = true;
    let persistence = self.persistence.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
      let _ignored = tx.send(Request::Refreshed(persistence.get_summary().await));
    });
  }

  fn handle(&mut self, request: Request) {
    match request {
      Request::Started(datum) => {
        log::debug!("recording lifecycle of {}", datum.fqdsn);
        self.stats.notifications.inc();
        self.persistence.insert_metric(&datum);
      },
      Request::Summary(tx) => {
        let _ignored = tx.send(self.cache.clone());
      },
      Request::Refreshed(result) => {
        self.refreshing = false;
        match result {
          Ok(data) => {
            log::debug!("refreshed bookkeeper summary: {data:?}");
            self.cache = Some(data);
          },
          Err(e) => {
            log::warn!("failed to refresh bookkeeper summary: {e}");
            self.stats.refresh_failures.inc();
          },
        }
      },
    }
  }
}
