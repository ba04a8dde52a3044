// cagg - bitdrift's cluster metrics aggregator
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::router::DEFAULT_SHARD_COUNT;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("router.shard_count must be positive")]
  InvalidShardCount,
  #[error("{0} must be non-zero")]
  ZeroDuration(&'static str),
  #[error("buffered sink max_buffered must be positive")]
  InvalidBufferSize,
}

//
// AggregationConfig
//

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationConfig {
  // How long past the end of a window late data is still accepted.
  #[serde(with = "humantime_serde")]
  pub grace_period: Duration,
  #[serde(with = "humantime_serde")]
  pub bucket_check_interval: Duration,
  #[serde(with = "humantime_serde")]
  pub bookkeeper_interval: Duration,
  #[serde(with = "humantime_serde")]
  pub bookkeeper_initial_delay: Duration,
  // An aggregator with no traffic for this long asks to be passivated.
  #[serde(with = "humantime_serde")]
  pub idle_timeout: Duration,
  pub cluster_host_suffix: String,
}

impl Default for AggregationConfig {
  fn default() -> Self {
    Self {
      grace_period: Duration::from_secs(60),
      bucket_check_interval: Duration::from_secs(5),
      bookkeeper_interval: Duration::from_secs(60 * 60),
      bookkeeper_initial_delay: Duration::ZERO,
      idle_timeout: Duration::from_secs(30 * 60),
      cluster_host_suffix: String::new(),
    }
  }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
  pub shard_count: u32,
}

impl Default for RouterConfig {
  fn default() -> Self {
    Self {
      shard_count: DEFAULT_SHARD_COUNT,
    }
  }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BookkeeperConfig {
  #[serde(with = "humantime_serde")]
  pub refresh_interval: Duration,
}

impl Default for BookkeeperConfig {
  fn default() -> Self {
    Self {
      refresh_interval: Duration::from_secs(10 * 60),
    }
  }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
  #[serde(with = "humantime_serde")]
  pub ask_timeout: Duration,
  #[serde(with = "humantime_serde")]
  pub cluster_poll_interval: Duration,
}

impl Default for StatusConfig {
  fn default() -> Self {
    Self {
      ask_timeout: Duration::from_secs(3),
      cluster_poll_interval: Duration::from_secs(10),
    }
  }
}

//
// SinkConfig
//

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
  Log,
  Buffered {
    max_buffered: usize,
    inner: Box<SinkConfig>,
  },
}

impl SinkConfig {
  fn validate(&self) -> Result<(), ConfigError> {
    match self {
      Self::Log => Ok(()),
      Self::Buffered {
        max_buffered,
        inner,
      } => {
        if *max_buffered == 0 {
          return Err(ConfigError::InvalidBufferSize);
        }
        inner.validate()
      },
    }
  }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EmitterConfig {
  pub sinks: Vec<SinkConfig>,
}

impl Default for EmitterConfig {
  fn default() -> Self {
    Self {
      sinks: vec![SinkConfig::Log],
    }
  }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AdminConfig {
  pub bind: String,
}

impl Default for AdminConfig {
  fn default() -> Self {
    Self {
      bind: "0.0.0.0:9088".to_string(),
    }
  }
}

//
// Config
//

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub aggregation: AggregationConfig,
  pub router: RouterConfig,
  pub bookkeeper: BookkeeperConfig,
  pub status: StatusConfig,
  pub emitter: EmitterConfig,
  pub admin: AdminConfig,
  // Name of the root stats scope.
  pub meta_prefix: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      aggregation: AggregationConfig::default(),
      router: RouterConfig::default(),
      bookkeeper: BookkeeperConfig::default(),
      status: StatusConfig::default(),
      emitter: EmitterConfig::default(),
      admin: AdminConfig::default(),
      meta_prefix: "cagg".to_string(),
    }
  }
}

impl Config {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.router.shard_count == 0 {
      return Err(ConfigError::InvalidShardCount);
    }
    for (name, duration) in [
      (
        "aggregation.bucket_check_interval",
        self.aggregation.bucket_check_interval,
      ),
      (
        "aggregation.bookkeeper_interval",
        self.aggregation.bookkeeper_interval,
      ),
      ("aggregation.idle_timeout", self.aggregation.idle_timeout),
      ("bookkeeper.refresh_interval", self.bookkeeper.refresh_interval),
      ("status.ask_timeout", self.status.ask_timeout),
      (
        "status.cluster_poll_interval",
        self.status.cluster_poll_interval,
      ),
    ] {
      if duration.is_zero() {
        return Err(ConfigError::ZeroDuration(name));
      }
    }
    self.emitter.sinks.iter().try_for_each(SinkConfig::validate)
  }
}

pub fn from_yaml(yaml: &str) -> anyhow::Result<Config> {
  let config: Config = serde_yaml::from_str(yaml)?;
  config.validate()?;
  Ok(config)
}

pub fn load_from_file(path: &str) -> anyhow::Result<Config> {
  let file_contents =
    std::fs::read_to_string(path).with_context(|| format!("unable to read config '{path}'"))?;
  from_yaml(&file_contents).with_context(|| format!("invalid config '{path}'"))
}
