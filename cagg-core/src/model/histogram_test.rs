// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;

#[test]
fn truncation() {
  assert_eq!(BucketKey(1.0), BucketKey::truncate(1.0));
  // 7 bits of mantissa keeps values within 1% of each other in one bucket.
  assert_eq!(BucketKey::truncate(100.0), BucketKey::truncate(100.4));
  assert_ne!(BucketKey::truncate(100.0), BucketKey::truncate(102.0));
}

#[test]
fn percentiles() {
  let mut histogram = Histogram::new(Some(Unit::Millisecond));
  for value in 1 ..= 5 {
    histogram.record(f64::from(value), 1);
  }
  assert_eq!(5, histogram.count());
  assert_eq!(Some(1.0), histogram.value_at_percentile(0.0));
  assert_eq!(Some(3.0), histogram.value_at_percentile(50.0));
  assert_eq!(Some(5.0), histogram.value_at_percentile(99.0));
  assert_eq!(Some(5.0), histogram.value_at_percentile(100.0));
  assert_eq!(None, Histogram::default().value_at_percentile(50.0));
}

#[test]
fn ignores_non_finite() {
  let mut histogram = Histogram::default();
  histogram.record(f64::NAN, 3);
  histogram.record(f64::INFINITY, 1);
  histogram.record(1.0, 0);
  assert!(histogram.is_empty());
}

#[test]
fn merge_converts_units() {
  let mut seconds = Histogram::new(Some(Unit::Second));
  seconds.record(1.0, 2);
  let mut millis = Histogram::new(Some(Unit::Millisecond));
  millis.record(1000.0, 3);

  seconds.merge(&millis).unwrap();
  assert_eq!(5, seconds.count());
  assert_eq!(Some(Unit::Second), seconds.unit());
  assert_eq!(vec![(1.0, 5)], seconds.buckets().collect::<Vec<_>>());
}

#[test]
fn merge_into_empty_adopts_unit() {
  let mut merged = Histogram::default();
  let mut millis = Histogram::new(Some(Unit::Millisecond));
  millis.record(4.0, 1);
  merged.merge(&millis).unwrap();
  assert_eq!(Some(Unit::Millisecond), merged.unit());
  assert_eq!(1, merged.count());
}

#[test]
fn merge_incompatible() {
  let mut seconds = Histogram::new(Some(Unit::Second));
  seconds.record(1.0, 1);
  let mut bytes = Histogram::new(Some(Unit::Byte));
  bytes.record(1.0, 1);
  assert!(seconds.merge(&bytes).is_err());
  assert_eq!(1, seconds.count());
}
