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

//! Error taxonomy for the admission limiter.
//!
//! Three classes, matching the host's own separation between fatal
//! configuration problems, swallowed runtime noise, and semantic
//! admission-denied outcomes:
//!
//! - [`ConfigError`] — fatal at validation time.
//! - [`StatsError`] / [`BucketError`] — transient, always logged and
//!   swallowed by the admission path; never surfaced to callers.
//! - [`ResultKind`] + [`AdmissionError`] — not bugs, the limiter's actual
//!   product: a typed rejection reported back through the task.

use thiserror::Error;

/// Errors raised while validating a [`crate::config::RawConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("plugins_concerned must not be empty")]
    NoPluginsConcerned,

    #[error("plugins_concerned contains a blank name at index {0}")]
    BlankPluginName(usize),

    #[error("latency_threshold_msec must be >= 1, got {0}")]
    LatencyThresholdTooLow(i64),

    #[error("backoff_timeout_msec must be >= -1, got {0}")]
    BackOffTimeoutTooLow(i64),

    #[error("backoff_timeout_msec must be <= 10000 when positive, got {0}")]
    BackOffTimeoutTooHigh(i64),

    #[error("probe_percentage must be in [1, 99], got {0}")]
    ProbePercentageOutOfRange(i64),

    #[error("allow_msec must be <= 65535, got {0}")]
    AllowWindowTooHigh(u32),
}

/// Transient failure querying the statistics collaborator. Always
/// swallowed: the admission path logs it at `warn` and proceeds as if
/// nothing were observed.
#[derive(Debug, Error, Clone)]
pub enum StatsError {
    #[error("throughput rate unavailable for {scope}")]
    ThroughputUnavailable { scope: String },

    #[error("execution time percentile unavailable for plugin {plugin}")]
    PercentileUnavailable { plugin: String },
}

/// Transient failure resolving the per-plugin shared data bucket. Always
/// swallowed: admission proceeds as if the counter were absent (i.e. admit).
#[derive(Debug, Error, Clone)]
#[error("data bucket lookup failed for plugin {plugin}: {reason}")]
pub struct BucketError {
    pub plugin: String,
    pub reason: String,
}

/// The two rejection kinds the limiter is allowed to emit. No other
/// result kind is produced by admission logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Fused (immediate or after a back-off timeout).
    FlowControl,
    /// The task's own cancellation signal fired while waiting.
    TaskCancelled,
}

/// A semantic admission-denied outcome, reported to the task's error
/// channel rather than returned as a library error from `run`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AdmissionError {
    pub kind: ResultKind,
    pub message: String,
    /// Present only for `ResultKind::TaskCancelled`: the original cause
    /// propagated from the task's cancellation signal.
    pub cancel_cause: Option<String>,
}

impl AdmissionError {
    /// `backOffTimeoutMs == 0` and fused and not probing (P7).
    pub fn fused_immediately() -> Self {
        Self {
            kind: ResultKind::FlowControl,
            message: "service unavailable caused by latency limit".to_string(),
            cancel_cause: None,
        }
    }

    /// The back-off timer elapsed before the counter recovered.
    pub fn backoff_timed_out() -> Self {
        Self {
            kind: ResultKind::FlowControl,
            message: "service unavailable caused by latency limit backoff timeout".to_string(),
            cancel_cause: None,
        }
    }

    /// The task's cancellation signal fired during back-off (P6).
    pub fn task_cancelled(cause: Option<String>) -> Self {
        let suffix = cause.clone().unwrap_or_else(|| "unknown cause".to_string());
        Self {
            kind: ResultKind::TaskCancelled,
            message: format!("task is cancelled by {suffix}"),
            cancel_cause: cause,
        }
    }
}
