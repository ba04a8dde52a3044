// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./unify_test.rs"]
mod unify_test;

use crate::model::{AggregatedData, Fqdsn, ModelError, Unit};
use std::iter::once;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("cannot unify {fqdsn} from host '{host}': {error}")]
pub struct UnificationError {
  pub fqdsn: Fqdsn,
  pub host: String,
  #[source]
  pub error: ModelError,
}

// The smallest unit across every value and sample. Unitless quantities never displace a chosen
// unit, and units from a different family than the first one seen are ignored here and fail
// later during conversion.
#[must_use]
pub fn smallest_unit(data: &[AggregatedData]) -> Option<Unit> {
  let mut smallest: Option<Unit> = None;
  for unit in data
    .iter()
    .flat_map(|datum| once(&datum.value).chain(datum.samples.iter()))
    .filter_map(|quantity| quantity.unit)
  {
    smallest = Some(match smallest {
      None => unit,
      Some(current) => current.smaller(unit).unwrap_or(current),
    });
  }
  smallest
}

// Convert a collection to a single unit. Items already in that unit are passed through untouched.
// Failures are per item so one bad contribution does not poison the rest.
#[must_use]
pub fn unify(data: Vec<AggregatedData>) -> Vec<Result<AggregatedData, UnificationError>> {
  let target = smallest_unit(&data);
  data
    .into_iter()
    .map(|datum| {
      let (fqdsn, host) = (datum.fqdsn.clone(), datum.host.clone());
      datum
        .convert_to(target)
        .map_err(|error| UnificationError { fqdsn, host, error })
    })
    .collect()
}
