// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./bucket_test.rs"]
mod bucket_test;

use crate::model::AggregatedData;
use crate::statistics::Statistic;
use crate::statistics::calculator::{CalculatedValue, Calculator};
use crate::unify::unify;
use bd_log::warn_every;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::ext::NumericalDuration;

//
// ComputedStatistic
//

#[derive(Clone, Debug, PartialEq)]
pub struct ComputedStatistic {
  pub statistic: Statistic,
  pub value: CalculatedValue,
  pub population_size: u64,
  pub is_specified: bool,
}

//
// FinalizedBucket
//

#[derive(Debug)]
pub struct FinalizedBucket {
  pub period_start: OffsetDateTime,
  pub statistics: Vec<ComputedStatistic>,
  pub failures: u64,
}

#[derive(Default)]
struct Contributions {
  data: Vec<AggregatedData>,
  specified: bool,
}

//
// AggregationBucket
//

// Accumulates contributions for one metric and one window. Contributions are appended as they
// arrive and only reconciled and combined when the bucket is finalized, which consumes it.
pub struct AggregationBucket {
  period_start: OffsetDateTime,
  statistics: BTreeMap<Statistic, Contributions>,
}

impl AggregationBucket {
  #[must_use]
  pub const fn new(period_start: OffsetDateTime) -> Self {
    Self {
      period_start,
      statistics: BTreeMap::new(),
    }
  }

  #[must_use]
  pub const fn period_start(&self) -> OffsetDateTime {
    self.period_start
  }

  #[must_use]
  pub fn is_specified(&self, statistic: Statistic) -> bool {
    self
      .statistics
      .get(&statistic)
      .is_some_and(|contributions| contributions.specified)
  }

  pub fn update(&mut self, datum: AggregatedData) {
    debug_assert_eq!(self.period_start, datum.period_start);
    let contributions = self.statistics.entry(datum.fqdsn.statistic).or_default();
    contributions.specified |= datum.is_specified;
    contributions.data.push(datum);
  }

  #[must_use]
  pub fn finalize(self) -> FinalizedBucket {
    let mut failures = 0;
    let mut calculators = BTreeMap::new();
    let mut details = BTreeMap::new();

    for (statistic, contributions) in self.statistics {
      let mut calculator = Calculator::new(statistic);
      let mut population_size = 0;
      for unified in unify(contributions.data) {
        let accumulated = unified
          .map_err(|e| e.to_string())
          .and_then(|datum| {
            calculator
              .accumulate(&datum)
              .map(|()| datum.population_size)
              .map_err(|e| format!("{} from host '{}': {e}", datum.fqdsn, datum.host))
          });
        match accumulated {
          Ok(population) => population_size += population,
          Err(e) => {
            failures += 1;
            warn_every!(15.seconds(), "skipping contribution: {}", e);
          },
        }
      }
      calculators.insert(statistic, calculator);
      details.insert(statistic, (population_size, contributions.specified));
    }

    let mut statistics = Vec::with_capacity(calculators.len());
    for (statistic, calculator) in &calculators {
      let (population_size, is_specified) = details[statistic];
      match calculator.calculate(&calculators) {
        Ok(Some(value)) => statistics.push(ComputedStatistic {
          statistic: *statistic,
          value,
          population_size,
          is_specified,
        }),
        Ok(None) => log::debug!("statistic {statistic} has no value for {}", self.period_start),
        Err(e) => {
          failures += 1;
          warn_every!(
            15.seconds(),
            "error while calculating statistic {}: {}",
            statistic,
            e
          );
        },
      }
    }

    FinalizedBucket {
      period_start: self.period_start,
      statistics,
      failures,
    }
  }
}
