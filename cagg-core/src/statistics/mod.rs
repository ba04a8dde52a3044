// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod calculator;

use crate::model::{ModelError, Quantity};
use cagg_common::{LossyFloatToInt, LossyIntoToFloat};
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StatisticError {
  #[error("unit error: {0}")]
  Unit(#[from] ModelError),
  #[error("statistic {0} cannot be calculated from raw values")]
  Unsupported(Statistic),
  #[error("statistic {0} requires histogram supporting data")]
  MissingSupportingData(Statistic),
  #[error("invalid percentile {0}")]
  InvalidPercentile(f64),
  #[error("statistic name '{0}' is already registered")]
  DuplicateName(String),
}

pub type Result<T> = std::result::Result<T, StatisticError>;

//
// Statistic
//

// Percentiles are stored in tenths so that tp99.9 is representable and hashable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Statistic {
  Count,
  Sum,
  Mean,
  Percentile(u16),
  Histogram,
}

impl Statistic {
  pub const MIN: Self = Self::Percentile(0);
  pub const MEDIAN: Self = Self::Percentile(500);
  pub const MAX: Self = Self::Percentile(1000);

  pub fn percentile(percentile: f64) -> Result<Self> {
    if !(0.0 ..= 100.0).contains(&percentile) {
      return Err(StatisticError::InvalidPercentile(percentile));
    }
    let tenths = (percentile * 10.0).round();
    if (tenths - percentile * 10.0).abs() > 1e-6 {
      return Err(StatisticError::InvalidPercentile(percentile));
    }
    u16::try_from(tenths.lossy_to_u64())
      .map(Self::Percentile)
      .map_err(|_| StatisticError::InvalidPercentile(percentile))
  }

  // Fraction in [0, 1] for percentiles.
  #[must_use]
  pub fn quantile(self) -> Option<f64> {
    match self {
      Self::Percentile(tenths) => Some(f64::from(tenths) / 1000.0),
      _ => None,
    }
  }

  #[must_use]
  pub fn name(self) -> String {
    match self {
      Self::Count => "count".to_string(),
      Self::Sum => "sum".to_string(),
      Self::Mean => "mean".to_string(),
      Self::Histogram => "histogram".to_string(),
      Self::MIN => "min".to_string(),
      Self::MEDIAN => "median".to_string(),
      Self::MAX => "max".to_string(),
      Self::Percentile(tenths) => format!("tp{}", format_tenths(tenths, ".")),
    }
  }

  // Every name this statistic answers to, canonical name first.
  #[must_use]
  pub fn aliases(self) -> Vec<String> {
    let mut names = vec![self.name()];
    if let Self::Percentile(tenths) = self {
      for separator in [".", "p"] {
        let formatted = format_tenths(tenths, separator);
        for prefix in ["tp", "p"] {
          let alias = format!("{prefix}{formatted}");
          if !names.contains(&alias) {
            names.push(alias);
          }
        }
      }
    }
    names
  }

  #[must_use]
  pub const fn kind(self) -> StatisticKind {
    match self {
      Self::Count | Self::Sum => StatisticKind::OrderIndependent,
      Self::Percentile(_) => StatisticKind::OrderDependent,
      Self::Mean => StatisticKind::DependencyBased(&[Self::Sum, Self::Count]),
      Self::Histogram => StatisticKind::Sketch,
    }
  }

  // Calculate from raw values. Order dependent statistics require the caller to sort ascending
  // first. All values must already share a unit.
  pub fn calculate(self, values: &[Quantity]) -> Result<Option<Quantity>> {
    if values.is_empty() {
      return Ok(match self {
        Self::Count => Some(Quantity::unitless(0.0)),
        _ => None,
      });
    }

    match self {
      Self::Count => Ok(Some(Quantity::unitless(values.len().lossy_to_f64()))),
      Self::Sum => Ok(Some(sum(values)?)),
      Self::Mean => {
        let total = sum(values)?;
        Ok(Some(Quantity::new(
          total.value / values.len().lossy_to_f64(),
          total.unit,
        )))
      },
      Self::Percentile(_) => {
        debug_assert!(values.is_sorted_by(|a, b| a.value <= b.value));
        let quantile = self.quantile().unwrap_or_default();
        let index = (quantile * (values.len() - 1).lossy_to_f64())
          .ceil()
          .lossy_to_usize();
        Ok(Some(values[index.min(values.len() - 1)]))
      },
      Self::Histogram => Err(StatisticError::Unsupported(self)),
    }
  }
}

fn sum(values: &[Quantity]) -> Result<Quantity> {
  let mut iter = values.iter();
  let Some(first) = iter.next() else {
    return Ok(Quantity::unitless(0.0));
  };
  iter.try_fold(*first, |total, value| {
    total.try_add(*value).map_err(StatisticError::from)
  })
}

fn format_tenths(tenths: u16, separator: &str) -> String {
  if tenths % 10 == 0 {
    format!("{}", tenths / 10)
  } else {
    format!("{}{separator}{}", tenths / 10, tenths % 10)
  }
}

impl fmt::Display for Statistic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

//
// StatisticKind
//

// Capability tag fixed when a statistic is registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatisticKind {
  OrderIndependent,
  OrderDependent,
  DependencyBased(&'static [Statistic]),
  Sketch,
}

impl StatisticKind {
  #[must_use]
  pub const fn dependencies(self) -> &'static [Statistic] {
    match self {
      Self::DependencyBased(dependencies) => dependencies,
      _ => &[],
    }
  }
}

//
// StatisticRegistry
//

// Case insensitive name and alias lookup. Built once at startup and shared by reference.
#[derive(Debug)]
pub struct StatisticRegistry {
  by_name: HashMap<String, Statistic>,
}

impl Default for StatisticRegistry {
  fn default() -> Self {
    let mut registry = Self {
      by_name: HashMap::new(),
    };
    for statistic in [
      Statistic::Count,
      Statistic::Sum,
      Statistic::Mean,
      Statistic::Histogram,
      Statistic::MIN,
      Statistic::MAX,
      Statistic::MEDIAN,
    ] {
      registry.insert(statistic);
    }
    for percentile in [75.0, 90.0, 95.0, 99.0, 99.9] {
      if let Ok(statistic) = Statistic::percentile(percentile) {
        registry.insert(statistic);
      }
    }
    registry
  }
}

impl StatisticRegistry {
  fn insert(&mut self, statistic: Statistic) {
    for alias in statistic.aliases() {
      self.by_name.insert(alias, statistic);
    }
  }

  // Register an additional percentile, e.g. tp97.
  pub fn register_percentile(&mut self, percentile: f64) -> Result<Statistic> {
    let statistic = Statistic::percentile(percentile)?;
    if let Some(existing) = statistic
      .aliases()
      .into_iter()
      .find(|alias| self.by_name.contains_key(alias))
    {
      return Err(StatisticError::DuplicateName(existing));
    }
    self.insert(statistic);
    Ok(statistic)
  }

  #[must_use]
  pub fn lookup(&self, name: &str) -> Option<Statistic> {
    self.by_name.get(&name.to_ascii_lowercase()).copied()
  }

  #[must_use]
  pub fn statistics(&self) -> Vec<Statistic> {
    self
      .by_name
      .values()
      .copied()
      .sorted_unstable()
      .dedup()
      .collect()
  }
}
