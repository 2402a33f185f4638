// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Limiter configuration.
//!
//! Field names on the wire are normative for interoperability with
//! existing pipeline deployments (`allow_msec`, `backoff_timeout_msec`,
//! `flow_control_percentage_key`, `latency_threshold_msec`,
//! `plugins_concerned`, `probe_percentage`). [`RawConfig`] mirrors those
//! names directly; [`Config::try_from`] is the only way to get a
//! [`Config`], so an invalid record can never reach the rest of the
//! crate.
//!
//! # Example
//!
//! ```
//! use latency_admission_limiter::config::RawConfig;
//!
//! let raw: RawConfig = toml::from_str(r#"
//!     allow_msec = 1000
//!     backoff_timeout_msec = 100
//!     latency_threshold_msec = 800
//!     plugins_concerned = ["validator"]
//!     probe_percentage = 10
//! "#).unwrap();
//! let config = raw.validate().unwrap();
//! assert_eq!(config.latency_threshold_msec(), 800);
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

fn default_flow_control_key() -> String {
    String::new()
}

/// Pre-validation shadow of [`Config`], deserializable directly from the
/// wire format of the pipeline host (TOML or JSON, see
/// [`RawConfig::from_toml`] / [`RawConfig::from_json`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(rename = "allow_msec")]
    pub allow_window_msec: u32,

    #[serde(rename = "backoff_timeout_msec")]
    pub backoff_timeout_msec: i64,

    #[serde(rename = "latency_threshold_msec")]
    pub latency_threshold_msec: i64,

    #[serde(rename = "plugins_concerned")]
    pub plugins_concerned: Vec<String>,

    #[serde(rename = "probe_percentage")]
    pub probe_percentage: i64,

    #[serde(rename = "flow_control_percentage_key", default = "default_flow_control_key")]
    pub flow_control_percentage_key: String,
}

impl RawConfig {
    /// Parse from a TOML document, mirroring the host's own
    /// `HookConfig::from_toml` convenience constructor.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Parse from a JSON document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Validate and freeze into a [`Config`]. This is the only path to a
    /// usable configuration — the limiter never operates on unvalidated
    /// input.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.plugins_concerned.is_empty() {
            return Err(ConfigError::NoPluginsConcerned);
        }
        for (i, name) in self.plugins_concerned.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ConfigError::BlankPluginName(i));
            }
        }
        if self.latency_threshold_msec < 1 {
            return Err(ConfigError::LatencyThresholdTooLow(self.latency_threshold_msec));
        }
        if self.backoff_timeout_msec < -1 {
            return Err(ConfigError::BackOffTimeoutTooLow(self.backoff_timeout_msec));
        }
        if self.backoff_timeout_msec > 10_000 {
            return Err(ConfigError::BackOffTimeoutTooHigh(self.backoff_timeout_msec));
        }
        if !(1..=99).contains(&self.probe_percentage) {
            return Err(ConfigError::ProbePercentageOutOfRange(self.probe_percentage));
        }
        if self.allow_window_msec as u64 > 65535 {
            return Err(ConfigError::AllowWindowTooHigh(self.allow_window_msec));
        }

        if self.backoff_timeout_msec == -1 {
            tracing::warn!(
                "backoff_timeout_msec = -1 configured: admission will wait forever while fused"
            );
        } else if self.backoff_timeout_msec == 0 {
            tracing::warn!(
                "backoff_timeout_msec = 0 configured: admission fuses immediately with no back-off"
            );
        }

        Ok(Config {
            allow_window_msec: self.allow_window_msec,
            backoff_timeout_msec: self.backoff_timeout_msec,
            latency_threshold_msec: self.latency_threshold_msec as u64,
            plugins_concerned: self.plugins_concerned,
            probe_percentage: self.probe_percentage as u8,
            flow_control_percentage_key: self.flow_control_percentage_key.trim().to_string(),
        })
    }
}

/// Validated, immutable limiter configuration. Constructed only via
/// [`RawConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    allow_window_msec: u32,
    backoff_timeout_msec: i64,
    latency_threshold_msec: u64,
    plugins_concerned: Vec<String>,
    probe_percentage: u8,
    flow_control_percentage_key: String,
}

impl Config {
    pub fn allow_window_msec(&self) -> u32 {
        self.allow_window_msec
    }

    pub fn backoff_timeout_msec(&self) -> i64 {
        self.backoff_timeout_msec
    }

    pub fn latency_threshold_msec(&self) -> u64 {
        self.latency_threshold_msec
    }

    pub fn plugins_concerned(&self) -> &[String] {
        &self.plugins_concerned
    }

    pub fn probe_percentage(&self) -> u8 {
        self.probe_percentage
    }

    /// Empty means "do not annotate the task".
    pub fn flow_control_percentage_key(&self) -> &str {
        &self.flow_control_percentage_key
    }

    /// `None` means "wait forever" (`backoff_timeout_msec == -1`).
    pub fn backoff_timeout(&self) -> Option<std::time::Duration> {
        if self.backoff_timeout_msec < 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.backoff_timeout_msec as u64))
        }
    }

    /// Poll step per §4.3: `1ms` when the back-off budget is `<=10ms`,
    /// else a tenth of the budget. Meaningless (and unused) when
    /// `backoff_timeout_msec == -1`; callers still need *a* poll step
    /// while waiting forever, so this falls back to `1ms` in that case.
    pub fn poll_step(&self) -> std::time::Duration {
        let ms = if self.backoff_timeout_msec <= 10 {
            1
        } else {
            (self.backoff_timeout_msec / 10) as u64
        };
        std::time::Duration::from_millis(ms)
    }
}
