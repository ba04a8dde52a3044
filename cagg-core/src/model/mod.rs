// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod histogram;
pub mod unit;

use crate::statistics::Statistic;
use histogram::Histogram;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use time::{Duration, OffsetDateTime};
pub use unit::{Unit, UnitFamily};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
  #[error("units {0} and {1} belong to different families")]
  IncompatibleFamilies(Unit, Unit),
  #[error("unitless quantity cannot be converted to {0}")]
  MissingUnit(Unit),
  #[error("{0} quantity cannot be converted to a unitless quantity")]
  UnexpectedUnit(Unit),
  #[error("unknown unit '{0}'")]
  UnknownUnit(String),
  #[error("period must be positive, got {0}")]
  InvalidPeriod(Duration),
  #[error("statistic '{0}' has a non finite value")]
  NonFiniteValue(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

//
// Quantity
//

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantity {
  pub value: f64,
  pub unit: Option<Unit>,
}

impl Quantity {
  #[must_use]
  pub const fn new(value: f64, unit: Option<Unit>) -> Self {
    Self { value, unit }
  }

  #[must_use]
  pub const fn unitless(value: f64) -> Self {
    Self { value, unit: None }
  }

  #[must_use]
  pub const fn with_unit(value: f64, unit: Unit) -> Self {
    Self {
      value,
      unit: Some(unit),
    }
  }

  // Convert into the target unit. A unitless quantity only converts to unitless.
  pub fn convert_to(self, target: Option<Unit>) -> Result<Self> {
    match (self.unit, target) {
      (source, target) if source == target => Ok(self),
      (None, Some(target)) => Err(ModelError::MissingUnit(target)),
      (Some(source), None) => Err(ModelError::UnexpectedUnit(source)),
      (Some(source), Some(target)) => Ok(Self::with_unit(
        target.convert(self.value, source)?,
        target,
      )),
      (None, None) => Ok(self),
    }
  }

  pub fn try_add(self, other: Self) -> Result<Self> {
    let unit = common_unit(self.unit, other.unit)?;
    Ok(Self::new(
      self.convert_to(unit)?.value + other.convert_to(unit)?.value,
      unit,
    ))
  }

  pub fn try_cmp(self, other: Self) -> Result<Ordering> {
    let unit = common_unit(self.unit, other.unit)?;
    Ok(
      self
        .convert_to(unit)?
        .value
        .total_cmp(&other.convert_to(unit)?.value),
    )
  }
}

impl fmt::Display for Quantity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.unit {
      Some(unit) => write!(f, "{} {unit}", self.value),
      None => write!(f, "{}", self.value),
    }
  }
}

// The unit two quantities can be combined under.
pub fn common_unit(left: Option<Unit>, right: Option<Unit>) -> Result<Option<Unit>> {
  match (left, right) {
    (None, None) => Ok(None),
    (Some(unit), None) | (None, Some(unit)) => Err(ModelError::MissingUnit(unit)),
    (Some(left), Some(right)) => left.smaller(right).map(Some),
  }
}

//
// Fqdsn
//

// Fully qualified data series name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fqdsn {
  pub cluster: String,
  pub service: String,
  pub metric: String,
  pub statistic: Statistic,
}

impl fmt::Display for Fqdsn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}/{}/{}",
      self.cluster, self.service, self.metric, self.statistic
    )
  }
}

//
// AggregatedData
//

#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedData {
  pub fqdsn: Fqdsn,
  pub host: String,
  pub period: Duration,
  pub period_start: OffsetDateTime,
  pub value: Quantity,
  pub samples: Vec<Quantity>,
  pub population_size: u64,
  pub is_specified: bool,
  pub histogram: Option<Histogram>,
}

impl AggregatedData {
  pub fn validate(self) -> Result<Self> {
    if !self.period.is_positive() {
      return Err(ModelError::InvalidPeriod(self.period));
    }
    if !self.value.value.is_finite() || self.samples.iter().any(|s| !s.value.is_finite()) {
      return Err(ModelError::NonFiniteValue(self.fqdsn.statistic.to_string()));
    }
    Ok(self)
  }

  fn in_unit(&self, target: Option<Unit>) -> bool {
    self.value.unit == target && self.samples.iter().all(|s| s.unit == target)
  }

  // Returns self untouched when everything is already in the target unit, otherwise a converted
  // copy.
  pub fn convert_to(self, target: Option<Unit>) -> Result<Self> {
    if self.in_unit(target) {
      return Ok(self);
    }

    let value = self.value.convert_to(target)?;
    let samples = self
      .samples
      .iter()
      .map(|sample| sample.convert_to(target))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self {
      value,
      samples,
      ..self
    })
  }
}

//
// Condition
//

// Alert condition evaluated against a periodic result. The aggregator itself never produces any.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
  pub name: String,
  pub fqdsn: Fqdsn,
  pub threshold: Quantity,
  pub triggered: Option<bool>,
}

//
// PeriodicData
//

#[derive(Clone, Debug, PartialEq)]
pub struct PeriodicData {
  pub period: Duration,
  pub period_start: OffsetDateTime,
  pub dimensions: BTreeMap<String, String>,
  pub data: Vec<AggregatedData>,
  pub conditions: Vec<Condition>,
}

//
// StatisticRecord
//

// One partial statistic as reported by a host.
#[derive(Clone, Debug, PartialEq)]
pub struct StatisticRecord {
  pub statistic: String,
  pub value: f64,
  pub unit: Option<Unit>,
  pub user_specified: bool,
  pub samples: Vec<f64>,
  pub histogram: Option<Histogram>,
}

impl StatisticRecord {
  #[must_use]
  pub fn new(statistic: &str, value: f64, unit: Option<Unit>, user_specified: bool) -> Self {
    Self {
      statistic: statistic.to_string(),
      value,
      unit,
      user_specified,
      samples: Vec::new(),
      histogram: None,
    }
  }

  #[must_use]
  pub fn quantity(&self) -> Quantity {
    Quantity::new(self.value, self.unit)
  }

  // Partial values count as one member of the population unless raw samples came along.
  #[must_use]
  pub fn population_size(&self) -> u64 {
    if self.samples.is_empty() {
      1
    } else {
      self.samples.len() as u64
    }
  }
}

//
// StatisticSetRecord
//

// The decoded inbound message: every statistic one host computed for one metric and window.
#[derive(Clone, Debug, PartialEq)]
pub struct StatisticSetRecord {
  pub cluster: String,
  pub service: String,
  pub metric: String,
  pub host: String,
  pub period: Duration,
  pub period_start: OffsetDateTime,
  pub statistics: Vec<StatisticRecord>,
}

impl StatisticSetRecord {
  pub fn validate(self) -> Result<Self> {
    if !self.period.is_positive() {
      return Err(ModelError::InvalidPeriod(self.period));
    }
    if let Some(bad) = self
      .statistics
      .iter()
      .find(|s| !s.value.is_finite() || s.samples.iter().any(|v| !v.is_finite()))
    {
      return Err(ModelError::NonFiniteValue(bad.statistic.clone()));
    }
    Ok(self)
  }
}

// Render a period as an ISO-8601 duration, e.g. PT1M or P1D.
#[must_use]
pub fn format_period(period: Duration) -> String {
  const DAY: i64 = 24 * 60 * 60;

  let seconds = period.whole_seconds();
  if seconds > 0 && seconds % DAY == 0 {
    return format!("P{}D", seconds / DAY);
  }

  let mut out = "PT".to_string();
  let (hours, minutes, seconds) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
  if hours > 0 {
    let _ = write!(out, "{hours}H");
  }
  if minutes > 0 {
    let _ = write!(out, "{minutes}M");
  }
  if seconds > 0 || out.len() == 2 {
    let _ = write!(out, "{seconds}S");
  }
  out
}
