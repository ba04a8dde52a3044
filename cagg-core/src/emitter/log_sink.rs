// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::Sink;
use crate::model::PeriodicData;
use async_trait::async_trait;
use std::sync::Arc;

//
// LogSink
//

// Writes each periodic result to the log at info level.
pub struct LogSink {}

#[async_trait]
impl Sink for LogSink {
  async fn record(&self, data: Arc<PeriodicData>) {
    for datum in &data.data {
      log::info!(
        "{} {} {:?}: {} (population {}, specified {})",
        data.period_start,
        datum.fqdsn,
        data.dimensions,
        datum.value,
        datum.population_size,
        datum.is_specified
      );
    }
  }

  async fn close(&self) {}
}
