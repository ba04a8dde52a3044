// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use assert_matches::assert_matches;

#[test]
fn scale_conversion() {
  assert_eq!(
    100_000_000.0,
    Unit::Nanosecond.convert(100.0, Unit::Millisecond).unwrap()
  );
  assert_eq!(0.25, Unit::Minute.convert(15.0, Unit::Second).unwrap());
  assert_eq!(16.0, Unit::Bit.convert(2.0, Unit::Byte).unwrap());
  assert_eq!(8_000.0, Unit::Bit.convert(1.0, Unit::Kilobyte).unwrap());
  assert_eq!(1_024.0, Unit::Bit.convert(1.0, Unit::Kilobit).unwrap());
  assert_eq!(42.0, Unit::Second.convert(42.0, Unit::Second).unwrap());
}

#[test]
fn temperature_conversion() {
  assert!((Unit::Kelvin.convert(0.0, Unit::Celsius).unwrap() - 273.15).abs() < 1e-9);
  assert!((Unit::Celsius.convert(212.0, Unit::Fahrenheit).unwrap() - 100.0).abs() < 1e-9);
  assert!((Unit::Fahrenheit.convert(0.0, Unit::Kelvin).unwrap() + 459.67).abs() < 1e-9);
}

#[test]
fn incompatible_families() {
  assert_matches!(
    Unit::Second.convert(1.0, Unit::Byte),
    Err(ModelError::IncompatibleFamilies(Unit::Byte, Unit::Second))
  );
  assert_matches!(
    Unit::Second.smaller(Unit::Kelvin),
    Err(ModelError::IncompatibleFamilies(..))
  );
}

#[test]
fn smaller() {
  assert_eq!(
    Unit::Millisecond,
    Unit::Second.smaller(Unit::Millisecond).unwrap()
  );
  assert_eq!(Unit::Byte, Unit::Byte.smaller(Unit::Kilobyte).unwrap());
  assert_eq!(Unit::Kelvin, Unit::Fahrenheit.smaller(Unit::Kelvin).unwrap());
}

#[test]
fn parse() {
  assert_eq!(Unit::Millisecond, "millisecond".parse().unwrap());
  assert_eq!(Unit::Petabyte, "PETABYTE".parse().unwrap());
  assert_eq!(Unit::Celsius, "CELCIUS".parse().unwrap());
  assert_matches!("parsec".parse::<Unit>(), Err(ModelError::UnknownUnit(name)) if name == "parsec");
  for unit in Unit::ALL {
    assert_eq!(unit, unit.to_string().parse().unwrap());
  }
}
