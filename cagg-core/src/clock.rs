// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::{Duration, OffsetDateTime};

//
// TimeProvider
//

// Wall clock used for grace deadlines. Timers themselves run on tokio time.
pub trait TimeProvider: Send + Sync + 'static {
  fn now_utc(&self) -> OffsetDateTime;
  fn unix_now(&self) -> i64;
}

//
// RealTimeProvider
//

pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }

  fn unix_now(&self) -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
  }
}

//
// TestTimeProvider
//

#[derive(Default)]
pub struct TestTimeProvider {
  pub time: Arc<AtomicI64>,
}

impl TestTimeProvider {
  #[must_use]
  pub fn new(now: OffsetDateTime) -> Self {
    Self {
      time: Arc::new(AtomicI64::new(now.unix_timestamp())),
    }
  }

  pub fn advance(&self, by: Duration) {
    self.time.fetch_add(by.whole_seconds(), Ordering::SeqCst);
  }
}

impl TimeProvider for TestTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(self.time.load(Ordering::SeqCst))
      .unwrap_or(OffsetDateTime::UNIX_EPOCH)
  }

  fn unix_now(&self) -> i64 {
    self.time.load(Ordering::SeqCst)
  }
}
