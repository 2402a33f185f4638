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

//! Capabilities consumed from the surrounding pipeline host.
//!
//! The limiter never links against a concrete pipeline engine. Instead it
//! is generic over these traits, which a host adapter implements. This
//! mirrors how the plugin system's own hook handlers are boundary traits
//! rather than concrete types (`HookHandler` / `AsyncHookHandler`).

use crate::error::{BucketError, StatsError};
use async_trait::async_trait;
use std::sync::Arc;

/// Statistics window a query is taken over. The limiter only ever uses
/// `AllStatistics`; the type exists so host implementations can be
/// reused for other consumers that need a narrower scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsScope {
    AllStatistics,
}

/// Throughput and latency percentiles for plugins in the pipeline.
/// Implemented by the host; queries are expected to be non-blocking or
/// fast. Any error is logged and swallowed by the admission path.
#[async_trait]
pub trait StatisticsProvider: Send + Sync {
    /// 1-second-window throughput estimate (requests/sec) for `name`.
    async fn throughput_rate1(&self, name: &str, scope: StatsScope) -> Result<f64, StatsError>;

    /// `q`-th percentile execution time, in milliseconds, for `name`
    /// over its statistics window. `q` is e.g. `0.9` for p90.
    async fn execution_time_percentile(
        &self,
        name: &str,
        scope: StatsScope,
        q: f64,
    ) -> Result<f64, StatsError>;
}

/// A keyed, per-plugin shared store. `query_or_bind` returns the value
/// under `key`, constructing it via `factory` on first access.
#[async_trait]
pub trait DataBucket: Send + Sync {
    /// Look up `key` in the bucket for `plugin_name`, creating it with
    /// `factory` if absent. `factory` returns `None` only if it declines
    /// to create a value (never invoked concurrently for the same key).
    async fn query_or_bind(
        &self,
        plugin_name: &str,
        key: &str,
        factory: Box<dyn FnOnce() -> Arc<dyn std::any::Any + Send + Sync> + Send>,
    ) -> Result<Arc<dyn std::any::Any + Send + Sync>, BucketError>;
}

/// The task object the limiter attaches a completion callback to and,
/// on rejection, reports an error against.
#[async_trait]
pub trait Task: Send + Sync {
    /// Register `callback` to run when the task finishes, regardless of
    /// outcome. `name` is a stable identifier so re-registration (e.g.
    /// across retries of the same limiter) replaces rather than stacks.
    fn add_finished_callback(&self, name: &str, callback: Arc<dyn Fn() + Send + Sync>);

    /// Annotate the task with a value under `key` (used for the
    /// flow-controlled-rate annotation of §3).
    fn with_value(&self, key: &str, value: String);

    /// Report a rejection. `kind` must be one of the two result kinds
    /// the limiter is allowed to emit.
    fn set_error(&self, kind: crate::error::ResultKind, message: String);

    /// Resolves when the task's cancellation signal fires. Pending
    /// forever if the task is never cancelled.
    async fn cancelled(&self);

    /// The cause supplied when the task was cancelled, if any and if it
    /// has already fired.
    fn cancel_cause(&self) -> Option<String>;
}

/// Per-pipeline context: plugin inventory, diagnostics, statistics, the
/// shared bucket, and the two fire-and-forget rate refreshers.
#[async_trait]
pub trait PipelineContext: Send + Sync {
    fn pipeline_name(&self) -> &str;

    fn plugin_names(&self) -> Vec<String>;

    fn statistics(&self) -> Arc<dyn StatisticsProvider>;

    fn bucket(&self) -> Arc<dyn DataBucket>;

    /// Fire-and-forget refresh of the inbound throughput estimate.
    /// Failure must never affect admission.
    fn refresh_inbound_rate_async(&self);

    /// Fire-and-forget refresh of the flow-controlled rate estimate.
    fn refresh_flow_controlled_rate_async(&self);

    /// Current flow-controlled rate (requests/sec), used to annotate
    /// admitted tasks when `flow_control_percentage_key` is set.
    async fn flow_controlled_rate(&self) -> f64;
}
