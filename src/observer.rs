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

//! CompletionObserver - the task-finished callback that feeds the
//! counter.
//!
//! Queries the 90th-percentile execution time of every concerned plugin
//! that is still part of the pipeline, sums them (§4.4's contract is
//! summation, not averaging), and drives the counter accordingly. Plugins
//! no longer present, or whose percentile query fails, are skipped
//! silently rather than treated as zero or as a hard error.

use crate::counter::LatencyCounterHandle;
use crate::host::{PipelineContext, StatsScope};
use std::collections::HashSet;
use std::sync::Arc;

pub struct CompletionObserver {
    counter: LatencyCounterHandle,
    plugins_concerned: Vec<String>,
    latency_threshold_msec: u64,
}

impl CompletionObserver {
    pub fn new(
        counter: LatencyCounterHandle,
        plugins_concerned: Vec<String>,
        latency_threshold_msec: u64,
    ) -> Self {
        Self { counter, plugins_concerned, latency_threshold_msec }
    }

    /// Run the observer's sampling pass (§4.4 steps 1-3). Called from the
    /// task's finished callback.
    pub async fn on_finished(&self, ctx: &Arc<dyn PipelineContext>) {
        let present: HashSet<String> = ctx.plugin_names().into_iter().collect();
        let stats = ctx.statistics();

        let mut latency = 0.0f64;
        let mut sampled_any = false;

        for plugin in &self.plugins_concerned {
            if !present.contains(plugin) {
                continue;
            }
            match stats.execution_time_percentile(plugin, StatsScope::AllStatistics, 0.9).await {
                Ok(sample) if sample >= 0.0 => {
                    latency += sample;
                    sampled_any = true;
                }
                Ok(_negative) => {
                    // Defensively ignored per §4.4.
                }
                Err(err) => {
                    tracing::warn!(plugin = %plugin, error = %err, "p90 sample unavailable, skipping plugin");
                }
            }
        }

        if !sampled_any {
            return;
        }

        if latency < self.latency_threshold_msec as f64 {
            self.counter.decrease().await;
        } else {
            self.counter.increase().await;
        }
        tracing::debug!(
            latency_msec = latency,
            threshold_msec = self.latency_threshold_msec,
            "completion observer sampled aggregate latency"
        );
    }
}
