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

//! AdmissionController - the per-task entry point (§4.3).

use crate::config::Config;
use crate::counter::LatencyCounterHandle;
use crate::error::AdmissionError;
use crate::host::{DataBucket, PipelineContext, StatsScope, Task};
use crate::observer::CompletionObserver;
use crate::probe::ProbePolicy;
use std::any::Any;
use std::sync::Arc;

/// A positive admission decision.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    /// Set when `flow_control_percentage_key` is configured: the
    /// currently observed flow-controlled rate, as a string, under that
    /// key (§3 "task annotation").
    pub flow_control_annotation: Option<(String, String)>,
}

const COUNTER_BUCKET_KEY: &str = "latency_counter";

pub struct AdmissionController {
    name: String,
    config: Arc<Config>,
}

impl AdmissionController {
    pub fn new(name: impl Into<String>, config: Arc<Config>) -> Self {
        Self { name: name.into(), config }
    }

    /// §4.3 steps 1-9. Returns `Ok(AdmissionOutcome)` on admission,
    /// `Err(AdmissionError)` on rejection. Runtime sampling errors are
    /// logged and degrade to admission; they never reach the caller as
    /// an `Err`.
    pub async fn run(
        &self,
        ctx: &Arc<dyn PipelineContext>,
        task: &Arc<dyn Task>,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        // Step 1: attach the completion callback before any admission
        // decision, so even a task we are about to reject still feeds
        // the counter (§4.3 "Ordering", §9).
        let counter = self.resolve_counter(ctx).await;
        self.attach_completion_callback(ctx, task, counter.clone());

        // Step 2: fire-and-forget inbound rate refresh.
        ctx.refresh_inbound_rate_async();

        let counter = match counter {
            Some(counter) => counter,
            None => return Ok(self.admit(ctx, task).await),
        };

        // Step 4: sample inbound/outbound rates. Any failure: admit.
        let stats = ctx.statistics();
        let outbound_rate = match stats.throughput_rate1(&self.name, StatsScope::AllStatistics).await {
            Ok(rate) => rate,
            Err(err) => {
                tracing::warn!(limiter = %self.name, error = %err, "outbound rate sample unavailable, admitting");
                return Ok(self.admit(ctx, task).await);
            }
        };
        let inbound_rate = match stats
            .throughput_rate1(ctx.pipeline_name(), StatsScope::AllStatistics)
            .await
        {
            Ok(rate) => rate,
            Err(err) => {
                tracing::warn!(limiter = %self.name, error = %err, "inbound rate sample unavailable, admitting");
                return Ok(self.admit(ctx, task).await);
            }
        };

        // Step 5.
        let counter_threshold =
            (outbound_rate * self.config.allow_window_msec() as f64 / 1000.0).floor().max(0.0) as u64;
        let count = counter.count().await;

        tracing::debug!(
            limiter = %self.name,
            count,
            counter_threshold,
            outbound_rate,
            inbound_rate,
            "admission check"
        );

        // Step 6.
        if count <= counter_threshold {
            return Ok(self.admit(ctx, task).await);
        }

        // Step 7: fused. Refresh the flow-controlled rate, consult the
        // probe policy, then either admit (probe) or back off.
        ctx.refresh_flow_controlled_rate_async();
        if ProbePolicy::is_probe(outbound_rate, inbound_rate, self.config.probe_percentage()) {
            return Ok(self.admit(ctx, task).await);
        }

        if let Err(err) = self.back_off(task, &counter, counter_threshold).await {
            task.set_error(err.kind, err.message.clone());
            return Err(err);
        }
        Ok(self.admit(ctx, task).await)
    }

    /// The annotation step (§4.3 step 8), shared by every admission path.
    /// Annotates `task` via [`Task::with_value`] when
    /// `flow_control_percentage_key` is configured (§3 "task annotation").
    async fn admit(&self, ctx: &Arc<dyn PipelineContext>, task: &Arc<dyn Task>) -> AdmissionOutcome {
        let key = self.config.flow_control_percentage_key();
        let annotation = if key.is_empty() {
            None
        } else {
            let rate = ctx.flow_controlled_rate().await;
            let value = rate.to_string();
            task.with_value(key, value.clone());
            Some((key.to_string(), value))
        };
        AdmissionOutcome { flow_control_annotation: annotation }
    }

    /// §4.3 "Back-off loop". Waits for counter recovery, an optional
    /// overall timeout, or task cancellation - whichever fires first.
    async fn back_off(
        &self,
        task: &Arc<dyn Task>,
        counter: &LatencyCounterHandle,
        counter_threshold: u64,
    ) -> Result<(), AdmissionError> {
        // `backOffTimeoutMs == 0`: fuse immediately, no wait (P7).
        if self.config.backoff_timeout_msec() == 0 {
            return Err(AdmissionError::fused_immediately());
        }

        let poll_step = self.config.poll_step();
        let overall_timeout = self.config.backoff_timeout(); // None => wait forever (P8).

        let recovered = async {
            loop {
                tokio::time::sleep(poll_step).await;
                if counter.count().await < counter_threshold {
                    return;
                }
            }
        };

        tokio::select! {
            biased;

            _ = task.cancelled() => {
                Err(AdmissionError::task_cancelled(task.cancel_cause()))
            }
            _ = maybe_timeout(overall_timeout) => {
                Err(AdmissionError::backoff_timed_out())
            }
            _ = recovered => {
                Ok(())
            }
        }
    }

    fn attach_completion_callback(
        &self,
        ctx: &Arc<dyn PipelineContext>,
        task: &Arc<dyn Task>,
        counter: Option<LatencyCounterHandle>,
    ) {
        let Some(counter) = counter else { return };
        let observer = Arc::new(CompletionObserver::new(
            counter,
            self.config.plugins_concerned().to_vec(),
            self.config.latency_threshold_msec(),
        ));
        let ctx = ctx.clone();
        let callback_name = format!("{}-completion", self.name);
        task.add_finished_callback(
            &callback_name,
            Arc::new(move || {
                let observer = observer.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    observer.on_finished(&ctx).await;
                });
            }),
        );
    }

    /// §4.3 step 3: resolve (or lazily create) the counter from the
    /// shared bucket. `None` on bucket failure - caller must then admit.
    async fn resolve_counter(&self, ctx: &Arc<dyn PipelineContext>) -> Option<LatencyCounterHandle> {
        let bucket: Arc<dyn DataBucket> = ctx.bucket();
        let stats = ctx.statistics();
        let allow_window_msec = self.config.allow_window_msec();
        let name = self.name.clone();

        let factory_name = name.clone();
        let factory: Box<dyn FnOnce() -> Arc<dyn Any + Send + Sync> + Send> = Box::new(move || {
            let handle = LatencyCounterHandle::spawn(allow_window_msec, stats, factory_name);
            Arc::new(handle) as Arc<dyn Any + Send + Sync>
        });

        match bucket.query_or_bind(&name, COUNTER_BUCKET_KEY, factory).await {
            Ok(any) => any.downcast_ref::<LatencyCounterHandle>().cloned(),
            Err(err) => {
                tracing::warn!(limiter = %self.name, error = %err, "bucket lookup failed, admitting");
                None
            }
        }
    }
}

async fn maybe_timeout(timeout: Option<std::time::Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        // `backOffTimeoutMs == -1`: never fires (P8).
        None => std::future::pending::<()>().await,
    }
}
