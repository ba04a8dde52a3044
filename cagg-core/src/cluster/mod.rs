// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use bd_shutdown::ComponentShutdown;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

//
// MemberStatus
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
  Joining,
  Up,
  Leaving,
  Exiting,
  Down,
  Removed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Member {
  pub address: String,
  pub status: MemberStatus,
}

//
// ClusterState
//

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterState {
  pub self_address: String,
  pub leader: Option<String>,
  pub members: Vec<Member>,
}

impl ClusterState {
  #[must_use]
  pub fn is_leader(&self) -> bool {
    self.leader.as_ref() == Some(&self.self_address)
  }
}

//
// AssociationErrorEvent
//

// Published by the transport when a connection to a peer fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociationErrorEvent {
  pub cause: String,
}

impl AssociationErrorEvent {
  #[must_use]
  pub fn is_quarantine(&self) -> bool {
    self.cause.contains("quarantined this system")
  }
}

//
// Membership
//

// View of cluster membership from this node.
#[cfg_attr(test, mockall::automock)]
pub trait Membership: Send + Sync {
  fn self_address(&self) -> String;
  fn self_status(&self) -> MemberStatus;
  fn current_state(&self) -> ClusterState;
}

//
// LocalMembership
//

// Single node cluster. This node is always up and always the leader.
pub struct LocalMembership {
  address: String,
}

impl LocalMembership {
  #[must_use]
  pub fn new(address: impl Into<String>) -> Self {
    Self {
      address: address.into(),
    }
  }
}

impl Membership for LocalMembership {
  fn self_address(&self) -> String {
    self.address.clone()
  }

  fn self_status(&self) -> MemberStatus {
    MemberStatus::Up
  }

  fn current_state(&self) -> ClusterState {
    ClusterState {
      self_address: self.address.clone(),
      leader: Some(self.address.clone()),
      members: vec![Member {
        address: self.address.clone(),
        status: MemberStatus::Up,
      }],
    }
  }
}

//
// ClusterStatusHandle
//

#[derive(Clone)]
pub struct ClusterStatusHandle {
  tx: mpsc::UnboundedSender<oneshot::Sender<Option<ClusterState>>>,
}

impl ClusterStatusHandle {
  // The last polled state, or None before the first poll.
  pub async fn get(&self) -> Option<ClusterState> {
    let (tx, rx) = oneshot::channel();
    self.tx.send(tx).ok()?;
    rx.await.ok().flatten()
  }
}

//
// ClusterStatusCache
//

// Polls membership on a timer so status requests never wait on the membership layer.
pub struct ClusterStatusCache {
  membership: Arc<dyn Membership>,
  poll_interval: Duration,
  state: Option<ClusterState>,
}

impl ClusterStatusCache {
  pub fn spawn(
    membership: Arc<dyn Membership>,
    poll_interval: Duration,
    shutdown: ComponentShutdown,
  ) -> (ClusterStatusHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cache = Self {
      membership,
      poll_interval,
      state: None,
    };
    (
      ClusterStatusHandle { tx },
      tokio::spawn(cache.run(rx, shutdown)),
    )
  }

  async fn run(
    mut self,
    mut rx: mpsc::UnboundedReceiver<oneshot::Sender<Option<ClusterState>>>,
    mut shutdown: ComponentShutdown,
  ) {
    let mut poll = tokio::time::interval(self.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown.cancelled();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        _ = poll.tick() => {
          let state = self.membership.current_state();
          log::trace!("polled cluster state: {state:?}");
          self.state = Some(state);
        },
        request = rx.recv() => {
          let Some(request) = request else {
            break;
          };
          let _ignored = request.send(self.state.clone());
        }
      }
    }
  }
}
