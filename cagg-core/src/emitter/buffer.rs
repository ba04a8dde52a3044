// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./buffer_test.rs"]
mod buffer_test;

use super::Sink;
use crate::model::PeriodicData;
use async_trait::async_trait;
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use event_listener::{Event, listener};
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::ext::NumericalDuration;
use tokio::task::JoinHandle;

//
// Stats
//

struct Stats {
  dropped: IntCounter,
}

//
// BufferedSink
//

// Queues records in front of a slower sink. A single consumer forwards them in arrival order. On
// overflow the oldest queued records are dropped.
pub struct BufferedSink {
  inner: Arc<dyn Sink>,
  queue: Mutex<VecDeque<Arc<PeriodicData>>>,
  event: Event,
  max_buffered: usize,
  closed: AtomicBool,
  consumer: Mutex<Option<JoinHandle<()>>>,
  stats: Stats,
}

impl BufferedSink {
  pub fn new(max_buffered: usize, inner: Arc<dyn Sink>, scope: &Scope) -> Arc<Self> {
    let sink = Arc::new(Self {
      inner,
      queue: Mutex::default(),
      event: Event::new(),
      max_buffered,
      closed: AtomicBool::new(false),
      consumer: Mutex::default(),
      stats: Stats {
        dropped: scope.counter("dropped"),
      },
    });

    let cloned_sink = sink.clone();
    *sink.consumer.lock() = Some(tokio::spawn(async move {
      cloned_sink.consume_loop().await;
    }));
    sink
  }

  fn pop(&self) -> Option<Arc<PeriodicData>> {
    if self.closed.load(Ordering::Acquire) {
      return None;
    }
    self.queue.lock().pop_front()
  }

  // Returns None once the sink is closed.
  async fn recv(&self) -> Option<Arc<PeriodicData>> {
    loop {
      if let Some(data) = self.pop() {
        return Some(data);
      }
      if self.closed.load(Ordering::Acquire) {
        return None;
      }

      listener!(self.event => listener);

      if let Some(data) = self.pop() {
        return Some(data);
      }
      if self.closed.load(Ordering::Acquire) {
        return None;
      }

      listener.await;
    }
  }

  async fn consume_loop(&self) {
    while let Some(data) = self.recv().await {
      self.inner.record(data).await;
    }
    log::debug!("buffered sink consumer stopped");
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.queue.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl Sink for BufferedSink {
  async fn record(&self, data: Arc<PeriodicData>) {
    if self.closed.load(Ordering::Acquire) {
      warn_every!(15.seconds(), "{}", "buffered sink closed, dropping record");
      self.stats.dropped.inc();
      return;
    }

    {
      let mut queue = self.queue.lock();
      while queue.len() >= self.max_buffered {
        if queue.pop_front().is_none() {
          break;
        }
        warn_every!(15.seconds(), "{}", "buffered sink overflow, dropping oldest record");
        self.stats.dropped.inc();
      }
      queue.push_back(data);
    }
    self.event.notify_additional(1);
  }

  async fn close(&self) {
    self.closed.store(true, Ordering::Release);
    self.event.notify(usize::MAX);

    // Let an in flight record finish so ordering holds, then drain what is left.
    let consumer = self.consumer.lock().take();
    if let Some(consumer) = consumer {
      let _ignored = consumer.await;
    }

    log::debug!("performing shutdown drain");
    while let Some(data) = {
      let mut queue = self.queue.lock();
      queue.pop_front()
    } {
      self.inner.record(data).await;
    }
    self.inner.close().await;
    log::debug!("shutdown drain complete");
  }
}
