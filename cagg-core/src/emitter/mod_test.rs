// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::test::{RecordingSink, make_periodic, t0};
use bd_server_stats::test::util::stats::Helper as StatsHelper;
use bd_shutdown::ComponentShutdownTrigger;
use bd_test_helpers::make_mut;
use bd_time::TimeDurationExt;
use mockall::Sequence;
use time::ext::NumericalDuration;

#[tokio::test(start_paused = true)]
async fn fans_out_in_order_and_closes() {
  let helper = StatsHelper::default();
  let shutdown_trigger = ComponentShutdownTrigger::default();
  let first = Arc::new(RecordingSink::default());
  let mut second = Arc::new(MockSink::new());
  let mut seq = Sequence::new();
  make_mut(&mut second)
    .expect_record()
    .times(2)
    .in_sequence(&mut seq)
    .returning(|_| ());
  make_mut(&mut second)
    .expect_close()
    .times(1)
    .in_sequence(&mut seq)
    .returning(|| ());

  let (handle, join_handle) = Emitter::spawn(
    vec![first.clone() as Arc<dyn Sink>, second.clone()],
    &helper.collector().scope("test"),
    shutdown_trigger.make_shutdown(),
  );
  handle.emit(make_periodic(t0()));
  handle.emit(make_periodic(t0() + 1.minutes()));
  1.seconds().sleep().await;

  assert_eq!(vec![t0(), t0() + 1.minutes()], first.period_starts());
  assert!(!first.is_closed());

  shutdown_trigger.shutdown().await;
  join_handle.await.unwrap();
  assert!(first.is_closed());
}

#[tokio::test]
async fn drains_on_shutdown() {
  let helper = StatsHelper::default();
  let shutdown_trigger = ComponentShutdownTrigger::default();
  let sink = Arc::new(RecordingSink::default());
  let (handle, join_handle) = Emitter::spawn(
    vec![sink.clone()],
    &helper.collector().scope("emitter_test"),
    shutdown_trigger.make_shutdown(),
  );

  // Queued before the emitter task gets a chance to run.
  handle.emit(make_periodic(t0()));
  handle.emit(make_periodic(t0() + 1.minutes()));
  shutdown_trigger.shutdown().await;
  join_handle.await.unwrap();

  assert_eq!(vec![t0(), t0() + 1.minutes()], sink.period_starts());
  assert!(sink.is_closed());
}

#[tokio::test]
async fn emit_after_stop_is_dropped() {
  let (tx, rx) = mpsc::unbounded_channel();
  let handle = EmitterHandle::new(tx);
  drop(rx);
  handle.emit(make_periodic(t0()));
}

#[tokio::test]
async fn build_from_config() {
  let helper = StatsHelper::default();
  let sink = build_sink(
    &SinkConfig::Buffered {
      max_buffered: 1,
      inner: Box::new(SinkConfig::Log),
    },
    &helper.collector().scope("test"),
  );
  sink.record(Arc::new(make_periodic(t0()))).await;
  sink.close().await;
}
