// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::bookkeeper::{BookkeeperData, BookkeeperHandle};
use crate::cluster::{
  AssociationErrorEvent,
  ClusterState,
  ClusterStatusHandle,
  MemberStatus,
  Membership,
};
use crate::periodic::{PeriodicSnapshot, PeriodicStatisticsHandle};
use crate::router::{ClusterSubstrate, ShardId};
use bd_shutdown::ComponentShutdown;
use futures::Future;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

//
// StatusResponse
//

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
  pub cluster_metrics: Option<BookkeeperData>,
  pub cluster_state: Option<ClusterState>,
  pub local_metrics: Option<PeriodicSnapshot>,
  pub local_address: String,
  pub is_leader: bool,
  pub shard_allocations: BTreeMap<ShardId, usize>,
}

//
// Status
//

// Answers status and health requests by querying the other components. Each query has its own
// timeout and a failed or slow query leaves its field empty.
#[derive(Clone)]
pub struct Status {
  bookkeeper: Arc<BookkeeperHandle>,
  cluster: ClusterStatusHandle,
  periodic: PeriodicStatisticsHandle,
  membership: Arc<dyn Membership>,
  substrate: Arc<dyn ClusterSubstrate>,
  ask_timeout: Duration,
  quarantined: Arc<AtomicBool>,
}

impl Status {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    bookkeeper: Arc<BookkeeperHandle>,
    cluster: ClusterStatusHandle,
    periodic: PeriodicStatisticsHandle,
    membership: Arc<dyn Membership>,
    substrate: Arc<dyn ClusterSubstrate>,
    ask_timeout: Duration,
    association_errors: broadcast::Receiver<AssociationErrorEvent>,
    shutdown: ComponentShutdown,
  ) -> Self {
    let quarantined = Arc::new(AtomicBool::new(false));
    tokio::spawn(Self::watch_association_errors(
      association_errors,
      quarantined.clone(),
      shutdown,
    ));
    Self {
      bookkeeper,
      cluster,
      periodic,
      membership,
      substrate,
      ask_timeout,
      quarantined,
    }
  }

  async fn watch_association_errors(
    mut association_errors: broadcast::Receiver<AssociationErrorEvent>,
    quarantined: Arc<AtomicBool>,
    mut shutdown: ComponentShutdown,
  ) {
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        event = association_errors.recv() => match event {
          Ok(event) => {
            if event.is_quarantine() {
              log::error!("node was quarantined: {}", event.cause);
              quarantined.store(true, Ordering::Relaxed);
            } else {
              log::debug!("association error: {}", event.cause);
            }
          },
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            log::warn!("missed {skipped} association error event(s)");
          },
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    }
  }

  async fn ask<T>(&self, what: &str, request: impl Future<Output = Option<T>>) -> Option<T> {
    match tokio::time::timeout(self.ask_timeout, request).await {
      Ok(Some(response)) => Some(response),
      Ok(None) => {
        log::warn!("{what} unavailable for status request");
        None
      },
      Err(_) => {
        log::warn!("timed out asking for {what} after {:?}", self.ask_timeout);
        None
      },
    }
  }

  pub async fn status(&self) -> StatusResponse {
    let (cluster_metrics, cluster_state, local_metrics) = tokio::join!(
      self.ask("cluster metrics", self.bookkeeper.summary()),
      self.ask("cluster state", self.cluster.get()),
      self.ask("local metrics", self.periodic.snapshot()),
    );
    let is_leader = cluster_state.as_ref().is_some_and(ClusterState::is_leader);
    StatusResponse {
      cluster_metrics,
      cluster_state,
      local_metrics,
      local_address: self.membership.self_address(),
      is_leader,
      shard_allocations: self.substrate.shard_allocations(),
    }
  }

  // Up while membership reports this node up and it has not been quarantined.
  #[must_use]
  pub fn health(&self) -> bool {
    self.membership.self_status() == MemberStatus::Up && !self.quarantined.load(Ordering::Relaxed)
  }
}
