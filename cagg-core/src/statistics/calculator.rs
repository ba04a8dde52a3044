// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./calculator_test.rs"]
mod calculator_test;

use super::{Result, Statistic, StatisticError};
use crate::model::histogram::Histogram;
use crate::model::{AggregatedData, Quantity, common_unit};
use cagg_common::LossyIntoToFloat;
use std::collections::BTreeMap;

//
// CalculatedValue
//

#[derive(Clone, Debug, PartialEq)]
pub struct CalculatedValue {
  pub value: Quantity,
  pub histogram: Option<Histogram>,
}

impl CalculatedValue {
  #[must_use]
  pub const fn new(value: Quantity) -> Self {
    Self {
      value,
      histogram: None,
    }
  }
}

//
// Calculator
//

// Running merged state for one statistic inside a bucket. Partial values from many hosts are
// folded in with accumulate() and the final value is produced once by calculate(), which may read
// sibling calculators of the same bucket.
#[derive(Clone, Debug)]
pub enum Calculator {
  Count {
    total: f64,
  },
  Sum {
    total: Option<Quantity>,
  },
  Mean,
  // Raw samples where a host sent them, its partial value otherwise.
  Percentile {
    statistic: Statistic,
    pool: Vec<Quantity>,
  },
  Histogram {
    histogram: Histogram,
  },
}

impl Calculator {
  #[must_use]
  pub fn new(statistic: Statistic) -> Self {
    match statistic {
      Statistic::Count => Self::Count { total: 0.0 },
      Statistic::Sum => Self::Sum { total: None },
      Statistic::Mean => Self::Mean,
      Statistic::Percentile(_) => Self::Percentile {
        statistic,
        pool: Vec::new(),
      },
      Statistic::Histogram => Self::Histogram {
        histogram: Histogram::default(),
      },
    }
  }

  pub fn accumulate(&mut self, data: &AggregatedData) -> Result<()> {
    match self {
      Self::Count { total } => *total += data.value.value,
      Self::Sum { total } => {
        let next = match *total {
          Some(total) => total.try_add(data.value)?,
          None => data.value,
        };
        *total = Some(next);
      },
      Self::Mean => {},
      Self::Percentile { pool, .. } => {
        if data.samples.is_empty() {
          pool.push(data.value);
        } else {
          pool.extend_from_slice(&data.samples);
        }
      },
      Self::Histogram { histogram } => {
        let other = data
          .histogram
          .as_ref()
          .ok_or(StatisticError::MissingSupportingData(Statistic::Histogram))?;
        histogram.merge(other)?;
      },
    }
    Ok(())
  }

  // Ok(None) means the statistic has nothing to report, typically because a dependency is absent.
  pub fn calculate(
    &self,
    siblings: &BTreeMap<Statistic, Self>,
  ) -> Result<Option<CalculatedValue>> {
    match self {
      Self::Count { total } => Ok(Some(CalculatedValue::new(Quantity::unitless(*total)))),
      Self::Sum { total } => Ok(total.map(CalculatedValue::new)),
      Self::Mean => {
        let (Some(sum), Some(count)) = (
          Self::dependency(siblings, Statistic::Sum)?,
          Self::dependency(siblings, Statistic::Count)?,
        ) else {
          log::debug!("mean dependency absent, skipping");
          return Ok(None);
        };
        if count.value.value <= 0.0 {
          return Ok(None);
        }
        Ok(Some(CalculatedValue::new(Quantity::new(
          sum.value.value / count.value.value,
          sum.value.unit,
        ))))
      },
      Self::Percentile { statistic, pool } => {
        if let Some(Self::Histogram { histogram }) = siblings.get(&Statistic::Histogram)
          && !histogram.is_empty()
        {
          let percentile = statistic.quantile().unwrap_or_default() * 100.0;
          return Ok(
            histogram
              .value_at_percentile(percentile)
              .map(|value| CalculatedValue::new(Quantity::new(value, histogram.unit()))),
          );
        }

        let sorted = sorted_in_common_unit(pool)?;
        Ok(statistic.calculate(&sorted)?.map(CalculatedValue::new))
      },
      Self::Histogram { histogram } => {
        if histogram.is_empty() {
          return Ok(None);
        }
        Ok(Some(CalculatedValue {
          value: Quantity::unitless(histogram.count().lossy_to_f64()),
          histogram: Some(histogram.clone()),
        }))
      },
    }
  }

  fn dependency(
    siblings: &BTreeMap<Statistic, Self>,
    statistic: Statistic,
  ) -> Result<Option<CalculatedValue>> {
    match siblings.get(&statistic) {
      Some(calculator) => calculator.calculate(siblings),
      None => Ok(None),
    }
  }
}

fn sorted_in_common_unit(values: &[Quantity]) -> Result<Vec<Quantity>> {
  let Some(first) = values.first() else {
    return Ok(Vec::new());
  };
  let unit = values
    .iter()
    .try_fold(first.unit, |unit, value| common_unit(unit, value.unit))?;
  let mut converted = values
    .iter()
    .map(|value| value.convert_to(unit))
    .collect::<std::result::Result<Vec<_>, _>>()?;
  converted.sort_by(|a, b| a.value.total_cmp(&b.value));
  Ok(converted)
}
