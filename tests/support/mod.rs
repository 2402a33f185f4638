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

//! In-memory host fixture driving the scenario tests of §8. Deterministic
//! and DashMap-backed, mirroring how the host codebase's own sharded
//! metrics aggregator models concurrent state.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use latency_admission_limiter::{
    BucketError, DataBucket, PipelineContext, ResultKind, StatisticsProvider, StatsError, StatsScope,
    Task,
};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

static TRACING_INIT: Once = Once::new();

/// Install a test-scoped `tracing` subscriber exactly once per process, so
/// the library's `tracing::debug!`/`warn!` admission/counter/observer
/// output surfaces under `cargo test -- --nocapture` instead of being
/// silently discarded by the default no-op subscriber. Call at the top of
/// every scenario test.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Controllable statistics double. Rates and percentiles are set by
/// name; lookups for unset names report an error (mirrors "plugin not
/// present" / "sampling unavailable" rather than silently defaulting).
pub struct FixtureStats {
    rates: DashMap<String, f64>,
    percentiles: DashMap<String, f64>,
    fail_rates: AtomicBool,
    fail_percentiles: AtomicBool,
}

impl FixtureStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rates: DashMap::new(),
            percentiles: DashMap::new(),
            fail_rates: AtomicBool::new(false),
            fail_percentiles: AtomicBool::new(false),
        })
    }

    pub fn set_rate(&self, name: &str, rate: f64) {
        self.rates.insert(name.to_string(), rate);
    }

    pub fn set_percentile(&self, plugin: &str, p90_msec: f64) {
        self.percentiles.insert(plugin.to_string(), p90_msec);
    }

    pub fn clear_percentile(&self, plugin: &str) {
        self.percentiles.remove(plugin);
    }

    pub fn fail_all_rates(&self, fail: bool) {
        self.fail_rates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatisticsProvider for FixtureStats {
    async fn throughput_rate1(&self, name: &str, _scope: StatsScope) -> Result<f64, StatsError> {
        if self.fail_rates.load(Ordering::SeqCst) {
            return Err(StatsError::ThroughputUnavailable { scope: name.to_string() });
        }
        self.rates
            .get(name)
            .map(|r| *r)
            .ok_or_else(|| StatsError::ThroughputUnavailable { scope: name.to_string() })
    }

    async fn execution_time_percentile(
        &self,
        name: &str,
        _scope: StatsScope,
        _q: f64,
    ) -> Result<f64, StatsError> {
        if self.fail_percentiles.load(Ordering::SeqCst) {
            return Err(StatsError::PercentileUnavailable { plugin: name.to_string() });
        }
        self.percentiles
            .get(name)
            .map(|p| *p)
            .ok_or_else(|| StatsError::PercentileUnavailable { plugin: name.to_string() })
    }
}

/// In-memory keyed shared store, one DashMap slot per `(plugin, key)`.
pub struct FixtureBucket {
    slots: DashMap<(String, String), Arc<dyn Any + Send + Sync>>,
}

impl FixtureBucket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: DashMap::new() })
    }
}

#[async_trait]
impl DataBucket for FixtureBucket {
    async fn query_or_bind(
        &self,
        plugin_name: &str,
        key: &str,
        factory: Box<dyn FnOnce() -> Arc<dyn Any + Send + Sync> + Send>,
    ) -> Result<Arc<dyn Any + Send + Sync>, BucketError> {
        let slot_key = (plugin_name.to_string(), key.to_string());
        if let Some(existing) = self.slots.get(&slot_key) {
            return Ok(existing.clone());
        }
        let value = factory();
        self.slots.insert(slot_key, value.clone());
        Ok(value)
    }
}

pub struct FixtureContext {
    pipeline_name: String,
    plugin_names: Mutex<Vec<String>>,
    stats: Arc<FixtureStats>,
    bucket: Arc<FixtureBucket>,
    flow_controlled_rate: Mutex<f64>,
    inbound_refreshes: AtomicBool,
    flow_refreshes: AtomicBool,
}

impl FixtureContext {
    pub fn new(pipeline_name: &str, plugin_names: Vec<&str>, stats: Arc<FixtureStats>, bucket: Arc<FixtureBucket>) -> Arc<Self> {
        Arc::new(Self {
            pipeline_name: pipeline_name.to_string(),
            plugin_names: Mutex::new(plugin_names.into_iter().map(|s| s.to_string()).collect()),
            stats,
            bucket,
            flow_controlled_rate: Mutex::new(0.0),
            inbound_refreshes: AtomicBool::new(false),
            flow_refreshes: AtomicBool::new(false),
        })
    }

    pub fn set_flow_controlled_rate(&self, rate: f64) {
        *self.flow_controlled_rate.lock() = rate;
    }
}

#[async_trait]
impl PipelineContext for FixtureContext {
    fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    fn plugin_names(&self) -> Vec<String> {
        self.plugin_names.lock().clone()
    }

    fn statistics(&self) -> Arc<dyn StatisticsProvider> {
        self.stats.clone()
    }

    fn bucket(&self) -> Arc<dyn DataBucket> {
        self.bucket.clone()
    }

    fn refresh_inbound_rate_async(&self) {
        self.inbound_refreshes.store(true, Ordering::SeqCst);
    }

    fn refresh_flow_controlled_rate_async(&self) {
        self.flow_refreshes.store(true, Ordering::SeqCst);
    }

    async fn flow_controlled_rate(&self) -> f64 {
        *self.flow_controlled_rate.lock()
    }
}

/// A task double whose cancellation is driven explicitly by the test,
/// and whose "finished" callback the test can invoke to simulate the
/// task runtime completing it.
pub struct FixtureTask {
    cancel_notify: tokio::sync::Notify,
    cancelled: AtomicBool,
    cancel_cause: Mutex<Option<String>>,
    finished_callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    last_error: Mutex<Option<(ResultKind, String)>>,
    annotations: Mutex<Vec<(String, String)>>,
}

impl FixtureTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel_notify: tokio::sync::Notify::new(),
            cancelled: AtomicBool::new(false),
            cancel_cause: Mutex::new(None),
            finished_callback: Mutex::new(None),
            last_error: Mutex::new(None),
            annotations: Mutex::new(Vec::new()),
        })
    }

    /// Simulate task-runtime cancellation with `cause`.
    pub fn cancel(&self, cause: impl Into<String>) {
        *self.cancel_cause.lock() = Some(cause.into());
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    /// Simulate the task runtime firing the finished callback.
    pub fn fire_finished(&self) {
        if let Some(callback) = self.finished_callback.lock().clone() {
            callback();
        }
    }

    pub fn last_error(&self) -> Option<(ResultKind, String)> {
        self.last_error.lock().clone()
    }

    pub fn annotations(&self) -> Vec<(String, String)> {
        self.annotations.lock().clone()
    }
}

#[async_trait]
impl Task for FixtureTask {
    fn add_finished_callback(&self, _name: &str, callback: Arc<dyn Fn() + Send + Sync>) {
        *self.finished_callback.lock() = Some(callback);
    }

    fn with_value(&self, key: &str, value: String) {
        self.annotations.lock().push((key.to_string(), value));
    }

    fn set_error(&self, kind: ResultKind, message: String) {
        *self.last_error.lock() = Some((kind, message));
    }

    async fn cancelled(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.cancel_notify.notified().await;
    }

    fn cancel_cause(&self) -> Option<String> {
        self.cancel_cause.lock().clone()
    }
}
