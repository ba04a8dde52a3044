// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./memory_test.rs"]
mod memory_test;

use super::{BookkeeperData, BookkeeperPersistence};
use crate::model::{AggregatedData, format_period};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
struct Seen {
  clusters: HashSet<String>,
  services: HashSet<String>,
  metrics: HashSet<String>,
  statistics: HashSet<String>,
}

//
// InMemoryBookkeeper
//

// Process local persistence. Everything is forgotten on restart.
#[derive(Default)]
pub struct InMemoryBookkeeper {
  seen: Mutex<Seen>,
}

#[async_trait]
impl BookkeeperPersistence for InMemoryBookkeeper {
  fn insert_metric(&self, datum: &AggregatedData) {
    let fqdsn = &datum.fqdsn;
    let mut seen = self.seen.lock();
    seen.clusters.insert(fqdsn.cluster.clone());
    seen.services.insert(fqdsn.service.clone());
    seen
      .metrics
      .insert(format!("{}/{}", fqdsn.service, fqdsn.metric));
    seen.statistics.insert(format!(
      "{}/{}/{}/{}/{}",
      fqdsn.cluster,
      fqdsn.service,
      fqdsn.metric,
      format_period(datum.period),
      fqdsn.statistic
    ));
  }

  async fn get_summary(&self) -> anyhow::Result<BookkeeperData> {
    let seen = self.seen.lock();
    Ok(BookkeeperData {
      clusters: seen.clusters.len() as u64,
      services: seen.services.len() as u64,
      metrics: seen.metrics.len() as u64,
      statistics: seen.statistics.len() as u64,
    })
  }
}
