// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Meter configuration.
//!
//! Loaded from `INVOCATION_METER_*` environment variables by [`MeterConfig::from_env`]:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `INVOCATION_METER_HOST` | `localhost` |
//! | `INVOCATION_METER_PORT` | none, required |
//! | `INVOCATION_METER_ATTACH_TIMEOUT_MS` | `30000` |
//! | `INVOCATION_METER_EVENT_TIMEOUT_MS` | unset (wait forever) |
//! | `INVOCATION_METER_PER_INSTANCE` | `false` |
//! | `INVOCATION_METER_VERBOSE` | `false` |
//!
//! A missing port is an error rather than a fallback: without a live target the meter
//! has nothing to measure.

use std::time::Duration;

use figment::providers::Env;
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix of the environment variables read by [`MeterConfig::from_env`].
pub const ENV_PREFIX: &str = "INVOCATION_METER_";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 30_000;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_attach_timeout_ms() -> u64 {
    DEFAULT_ATTACH_TIMEOUT_MS
}

/// Where the target listens and how the meter behaves while attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Bounds attach, the wait for breakpoints to be armed and the wait for the reader to
    /// exit on `stop()`.
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    /// Gives up with `TIMED_OUT` if the target is silent this long.
    #[serde(default)]
    pub event_timeout_ms: Option<u64>,
    /// Count per receiving instance instead of per method only.
    #[serde(default)]
    pub per_instance: bool,
    /// Print the per-class report to stdout after each `stop()`.
    #[serde(default)]
    pub verbose: bool,
}

impl MeterConfig {
    /// Configuration for `host:port` with every other setting at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            event_timeout_ms: None,
            per_instance: false,
            verbose: false,
        }
    }

    /// Reads the `INVOCATION_METER_*` environment.
    pub fn from_env() -> Result<Self> {
        Self::from_figment(Figment::from(Env::prefixed(ENV_PREFIX)))
    }

    /// Extracts and validates a configuration from any figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: MeterConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.attach_timeout_ms == 0 {
            return Err(Error::Config("attach_timeout_ms must be positive".to_string()));
        }
        if self.event_timeout_ms == Some(0) {
            return Err(Error::Config("event_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn with_per_instance(mut self, per_instance: bool) -> Self {
        self.per_instance = per_instance;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn event_timeout(&self) -> Option<Duration> {
        self.event_timeout_ms.map(Duration::from_millis)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().clamp(1, u64::MAX as u128) as u64
}
