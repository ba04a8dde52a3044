// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::model::Quantity;
use crate::test::make_aggregated;
use pretty_assertions::assert_eq;
use time::ext::NumericalDuration;

#[tokio::test]
async fn counts_distinct_entries() {
  let bookkeeper = InMemoryBookkeeper::default();
  assert_eq!(BookkeeperData::default(), bookkeeper.get_summary().await.unwrap());

  let tp99 = make_aggregated("tp99", Quantity::unitless(1.0));
  bookkeeper.insert_metric(&tp99);
  bookkeeper.insert_metric(&tp99);

  let mut other_period = tp99.clone();
  other_period.period = 5.minutes();
  bookkeeper.insert_metric(&other_period);

  let mut other_service = make_aggregated("count", Quantity::unitless(1.0));
  other_service.fqdsn.service = "other".to_string();
  other_service.fqdsn.cluster = "other".to_string();
  bookkeeper.insert_metric(&other_service);

  assert_eq!(
    BookkeeperData {
      clusters: 2,
      services: 2,
      metrics: 2,
      statistics: 3,
    },
    bookkeeper.get_summary().await.unwrap()
  );
}
