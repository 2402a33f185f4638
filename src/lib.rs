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

//! Adaptive latency-based admission limiter.
//!
//! A pipeline-host plugin that throttles inbound traffic whenever
//! observed downstream tail latency exceeds a configured threshold. It
//! is not a token-bucket or fixed-window rate limiter: admission is
//! driven entirely by a saturation counter fed from downstream p90
//! latency samples.
//!
//! # Architecture
//!
//! ```text
//!               ┌──────────────────┐
//! task ────────►│ AdmissionController │──admit/reject──► downstream
//!               └─────────┬────────┘
//!                         │ attaches
//!                         ▼
//!               ┌──────────────────┐        ┌─────────────┐
//!               │ CompletionObserver │──────►│ LatencyCounter │
//!               └──────────────────┘        │   (actor)      │
//!                                            └─────────────┘
//!                         ▲
//!                         │ consults
//!               ┌──────────────────┐
//!               │   ProbePolicy      │
//!               └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use latency_admission_limiter::config::RawConfig;
//! use latency_admission_limiter::Limiter;
//!
//! # fn build() {
//! let raw = RawConfig {
//!     allow_window_msec: 1000,
//!     backoff_timeout_msec: 100,
//!     latency_threshold_msec: 800,
//!     plugins_concerned: vec!["validator".to_string()],
//!     probe_percentage: 10,
//!     flow_control_percentage_key: String::new(),
//! };
//! let config = raw.validate().expect("valid config");
//! let limiter = Limiter::new("my-limiter", config);
//! assert_eq!(limiter.name(), "my-limiter");
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod counter;
pub mod error;
pub mod host;
pub mod observer;
pub mod probe;

use std::sync::Arc;

pub use admission::{AdmissionController, AdmissionOutcome};
pub use config::{Config, RawConfig};
pub use counter::LatencyCounterHandle;
pub use error::{AdmissionError, BucketError, ConfigError, ResultKind, StatsError};
pub use host::{DataBucket, PipelineContext, StatisticsProvider, StatsScope, Task};
pub use observer::CompletionObserver;
pub use probe::ProbePolicy;

/// Plugin name suffix used for the filename hosts typically expect
/// (`limiter.toml`, `limiter.json`, ...). Not load-bearing, purely a
/// convention surfaced for hosts that want one.
pub const DEFAULT_MANIFEST_FILENAME: &str = "latency-limiter.toml";

/// The pipeline-host plugin surface (§6): `prepare`, `run`, `cleanup`,
/// `close`, `name`. Only `run` carries non-trivial semantics; the rest
/// are lifecycle hooks most hosts call unconditionally.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the plugin handles any task. Infallible
    /// failures here are host-lifecycle errors, not admission errors.
    async fn prepare(&self, ctx: &Arc<dyn PipelineContext>) -> anyhow::Result<()>;

    /// Admit, back off, or reject `task`. See [`AdmissionController::run`].
    async fn run(
        &self,
        ctx: &Arc<dyn PipelineContext>,
        task: &Arc<dyn Task>,
    ) -> Result<AdmissionOutcome, AdmissionError>;

    /// Called after each `run` regardless of outcome, for per-task
    /// teardown. The limiter itself has nothing to clean up per task;
    /// provided for host-interface parity.
    async fn cleanup(&self, ctx: &Arc<dyn PipelineContext>);

    /// Called once when the plugin is torn down. The latency counter
    /// itself outlives this call — it belongs to the pipeline's shared
    /// bucket (§3 lifecycle) and is closed when that bucket is torn
    /// down, not when any one plugin instance closes.
    async fn close(&self);
}

/// The admission limiter plugin: validated [`Config`] plus the wiring
/// that makes it a [`Plugin`].
pub struct Limiter {
    name: String,
    controller: AdmissionController,
}

impl Limiter {
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        let name = name.into();
        let config = Arc::new(config);
        Self { controller: AdmissionController::new(name.clone(), config), name }
    }
}

#[async_trait::async_trait]
impl Plugin for Limiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _ctx: &Arc<dyn PipelineContext>) -> anyhow::Result<()> {
        tracing::info!(limiter = %self.name, "admission limiter prepared");
        Ok(())
    }

    async fn run(
        &self,
        ctx: &Arc<dyn PipelineContext>,
        task: &Arc<dyn Task>,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        self.controller.run(ctx, task).await
    }

    async fn cleanup(&self, _ctx: &Arc<dyn PipelineContext>) {}

    async fn close(&self) {
        tracing::info!(limiter = %self.name, "admission limiter closed");
    }
}
