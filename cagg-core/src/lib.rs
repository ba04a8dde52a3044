// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod admin;
pub mod aggregation;
pub mod bookkeeper;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod emitter;
pub mod model;
pub mod periodic;
pub mod router;
pub mod statistics;
pub mod status;
pub mod unify;

#[cfg(test)]
pub mod test;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  cagg_common::global_initialize();
}
