// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use super::{Result, Unit};
use cagg_common::{LossyFloatToInt, LossyIntoToFloat};
use std::cmp::Ordering;
use std::collections::BTreeMap;

// Keeps the sign, the exponent and 7 bits of mantissa.
const BUCKET_MASK: u64 = 0xffff_e000_0000_0000;

//
// BucketKey
//

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketKey(pub f64);

impl BucketKey {
  #[must_use]
  pub fn truncate(value: f64) -> Self {
    Self(f64::from_bits(value.to_bits() & BUCKET_MASK))
  }
}

impl Eq for BucketKey {}

impl PartialOrd for BucketKey {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for BucketKey {
  fn cmp(&self, other: &Self) -> Ordering {
    self.0.total_cmp(&other.0)
  }
}

//
// Histogram
//

// Sparse histogram of truncated bucket keys to counts. Hosts ship these as supporting data so
// percentiles can be computed across hosts without the raw samples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
  buckets: BTreeMap<BucketKey, u64>,
  count: u64,
  unit: Option<Unit>,
}

impl Histogram {
  #[must_use]
  pub fn new(unit: Option<Unit>) -> Self {
    Self {
      buckets: BTreeMap::new(),
      count: 0,
      unit,
    }
  }

  #[must_use]
  pub const fn count(&self) -> u64 {
    self.count
  }

  #[must_use]
  pub const fn unit(&self) -> Option<Unit> {
    self.unit
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn buckets(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
    self.buckets.iter().map(|(key, count)| (key.0, *count))
  }

  pub fn record(&mut self, value: f64, count: u64) {
    if !value.is_finite() || count == 0 {
      return;
    }
    *self.buckets.entry(BucketKey::truncate(value)).or_default() += count;
    self.count += count;
  }

  // Merge another histogram into this one, converting its buckets into this histogram's unit. An
  // empty histogram adopts the unit of the first non-empty merge.
  pub fn merge(&mut self, other: &Self) -> Result<()> {
    if other.is_empty() {
      return Ok(());
    }
    if self.is_empty() {
      self.unit = other.unit;
    }

    if self.unit == other.unit {
      for (key, count) in &other.buckets {
        *self.buckets.entry(*key).or_default() += count;
      }
      self.count += other.count;
      return Ok(());
    }

    let converted = other.convert_to(self.unit)?;
    self.merge(&converted)
  }

  pub fn convert_to(&self, target: Option<Unit>) -> Result<Self> {
    if self.unit == target {
      return Ok(self.clone());
    }

    let mut converted = Self::new(target);
    for (key, count) in &self.buckets {
      let value = super::Quantity::new(key.0, self.unit).convert_to(target)?;
      converted.record(value.value, *count);
    }
    Ok(converted)
  }

  // Value of the bucket holding the requested percentile, percentile in [0, 100].
  #[must_use]
  pub fn value_at_percentile(&self, percentile: f64) -> Option<f64> {
    let target = (percentile / 100.0 * self.count.lossy_to_f64())
      .ceil()
      .lossy_to_u64();
    let mut running = 0;
    for (key, count) in &self.buckets {
      running += count;
      if running >= target {
        return Some(key.0);
      }
    }
    self.buckets.last_key_value().map(|(key, _)| key.0)
  }
}
