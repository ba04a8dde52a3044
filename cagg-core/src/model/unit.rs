// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./unit_test.rs"]
mod unit_test;

use super::{ModelError, Result};
use std::fmt;
use std::str::FromStr;

//
// UnitFamily
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitFamily {
  Time,
  DataSize,
  Temperature,
}

//
// Unit
//

// A unit of measure. Units convert freely within a family by scale, except temperatures which use
// offset conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Unit {
  Nanosecond,
  Microsecond,
  Millisecond,
  Second,
  Minute,
  Hour,
  Day,
  Week,
  Bit,
  Byte,
  Kilobit,
  Megabit,
  Gigabit,
  Terabit,
  Petabit,
  Kilobyte,
  Megabyte,
  Gigabyte,
  Terabyte,
  Petabyte,
  Kelvin,
  Celsius,
  Fahrenheit,
}

const KIBI: f64 = 1024.0;
const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

impl Unit {
  pub const ALL: [Self; 23] = [
    Self::Nanosecond,
    Self::Microsecond,
    Self::Millisecond,
    Self::Second,
    Self::Minute,
    Self::Hour,
    Self::Day,
    Self::Week,
    Self::Bit,
    Self::Byte,
    Self::Kilobit,
    Self::Megabit,
    Self::Gigabit,
    Self::Terabit,
    Self::Petabit,
    Self::Kilobyte,
    Self::Megabyte,
    Self::Gigabyte,
    Self::Terabyte,
    Self::Petabyte,
    Self::Kelvin,
    Self::Celsius,
    Self::Fahrenheit,
  ];

  #[must_use]
  pub const fn family(self) -> UnitFamily {
    match self {
      Self::Nanosecond
      | Self::Microsecond
      | Self::Millisecond
      | Self::Second
      | Self::Minute
      | Self::Hour
      | Self::Day
      | Self::Week => UnitFamily::Time,
      Self::Bit
      | Self::Byte
      | Self::Kilobit
      | Self::Megabit
      | Self::Gigabit
      | Self::Terabit
      | Self::Petabit
      | Self::Kilobyte
      | Self::Megabyte
      | Self::Gigabyte
      | Self::Terabyte
      | Self::Petabyte => UnitFamily::DataSize,
      Self::Kelvin | Self::Celsius | Self::Fahrenheit => UnitFamily::Temperature,
    }
  }

  // Size of one unit expressed in the smallest unit of the family. Temperatures only use this for
  // ordering.
  #[must_use]
  pub fn scale(self) -> f64 {
    match self {
      Self::Nanosecond | Self::Bit | Self::Kelvin => 1.0,
      Self::Microsecond => 1_000.0,
      Self::Millisecond => 1_000_000.0,
      Self::Second => NANOS_PER_SECOND,
      Self::Minute => NANOS_PER_SECOND * 60.0,
      Self::Hour => NANOS_PER_SECOND * 60.0 * 60.0,
      Self::Day => NANOS_PER_SECOND * 60.0 * 60.0 * 24.0,
      Self::Week => NANOS_PER_SECOND * 60.0 * 60.0 * 24.0 * 7.0,
      Self::Byte => 8.0,
      Self::Kilobit => KIBI,
      Self::Megabit => KIBI * KIBI,
      Self::Gigabit => KIBI * KIBI * KIBI,
      Self::Terabit => KIBI * KIBI * KIBI * KIBI,
      Self::Petabit => KIBI * KIBI * KIBI * KIBI * KIBI,
      Self::Kilobyte => 8.0 * 1e3,
      Self::Megabyte => 8.0 * 1e6,
      Self::Gigabyte => 8.0 * 1e9,
      Self::Terabyte => 8.0 * 1e12,
      Self::Petabyte => 8.0 * 1e15,
      Self::Celsius => 2.0,
      Self::Fahrenheit => 3.0,
    }
  }

  #[must_use]
  pub const fn name(self) -> &'static str {
    match self {
      Self::Nanosecond => "NANOSECOND",
      Self::Microsecond => "MICROSECOND",
      Self::Millisecond => "MILLISECOND",
      Self::Second => "SECOND",
      Self::Minute => "MINUTE",
      Self::Hour => "HOUR",
      Self::Day => "DAY",
      Self::Week => "WEEK",
      Self::Bit => "BIT",
      Self::Byte => "BYTE",
      Self::Kilobit => "KILOBIT",
      Self::Megabit => "MEGABIT",
      Self::Gigabit => "GIGABIT",
      Self::Terabit => "TERABIT",
      Self::Petabit => "PETABIT",
      Self::Kilobyte => "KILOBYTE",
      Self::Megabyte => "MEGABYTE",
      Self::Gigabyte => "GIGABYTE",
      Self::Terabyte => "TERABYTE",
      Self::Petabyte => "PETABYTE",
      Self::Kelvin => "KELVIN",
      Self::Celsius => "CELSIUS",
      Self::Fahrenheit => "FAHRENHEIT",
    }
  }

  // Pick the smaller of two units. Units from different families cannot be ordered.
  pub fn smaller(self, other: Self) -> Result<Self> {
    if self.family() != other.family() {
      return Err(ModelError::IncompatibleFamilies(self, other));
    }
    Ok(if other.scale() < self.scale() {
      other
    } else {
      self
    })
  }

  // Convert a value expressed in `source` into this unit.
  pub fn convert(self, value: f64, source: Self) -> Result<f64> {
    if self == source {
      return Ok(value);
    }
    if self.family() != source.family() {
      return Err(ModelError::IncompatibleFamilies(source, self));
    }
    if self.family() == UnitFamily::Temperature {
      return Ok(convert_temperature(value, source, self));
    }
    Ok(source.scale() / self.scale() * value)
  }
}

fn convert_temperature(value: f64, source: Unit, target: Unit) -> f64 {
  let kelvin = match source {
    Unit::Celsius => value + 273.15,
    Unit::Fahrenheit => (value + 459.67) * 5.0 / 9.0,
    _ => value,
  };
  match target {
    Unit::Celsius => kelvin - 273.15,
    Unit::Fahrenheit => kelvin * 9.0 / 5.0 - 459.67,
    _ => kelvin,
  }
}

impl fmt::Display for Unit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Unit {
  type Err = ModelError;

  fn from_str(s: &str) -> Result<Self> {
    // Older clients spell it CELCIUS.
    if s.eq_ignore_ascii_case("celcius") {
      return Ok(Self::Celsius);
    }
    Self::ALL
      .into_iter()
      .find(|unit| unit.name().eq_ignore_ascii_case(s))
      .ok_or_else(|| ModelError::UnknownUnit(s.to_string()))
  }
}
