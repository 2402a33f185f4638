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

//! LatencyCounter - the limiter's saturation signal.
//!
//! Modeled as a single-consumer actor: one background task owns
//! `value`/`ceiling`/`closed`, fed by a bounded `mpsc` channel. Writers
//! (`increase`/`decrease`) never block on each other and never race on
//! the read-modify-write of `value`, because only the consumer task ever
//! touches it. Readers (`count`) use a read-barrier round trip through
//! the same channel rather than a spin-wait, so "all writes submitted
//! before this call are observed" holds without polling.
//!
//! ## Architecture
//!
//! ```text
//! increase()/decrease() ──┐
//!                         ├──► inbox (mpsc, cap 32768) ──► consumer task
//! count()/close() ────────┘                                   │
//!        ▲                                                     │
//!        └─────────────── oneshot reply ──────────────────────┘
//! ```

use crate::host::{StatisticsProvider, StatsScope};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Bounded inbox capacity. 32K headroom is assumed sufficient at
/// realistic pipeline fan-out (§5); producers see back-pressure beyond
/// this, which is preferable to unbounded memory growth under flooding.
const INBOX_CAPACITY: usize = 32_768;

enum CounterMessage {
    Increase,
    Decrease,
    Read { reply: oneshot::Sender<u64> },
    Close,
}

/// Cheap, cloneable handle to a running [`LatencyCounter`] actor.
#[derive(Clone)]
pub struct LatencyCounterHandle {
    sender: mpsc::Sender<CounterMessage>,
    closed: Arc<AtomicBool>,
}

impl LatencyCounterHandle {
    /// Spawn the counter actor and return a handle to it.
    ///
    /// `allow_window_msec` sizes the ceiling from the outbound rate
    /// sampled on each `increase()` (§3/§4.1); `stats` is queried for
    /// that rate lazily, only when an increase is attempted, so a dead
    /// statistics collaborator never blocks `decrease`/`count`.
    pub fn spawn(
        allow_window_msec: u32,
        stats: Arc<dyn StatisticsProvider>,
        throughput_name: String,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(INBOX_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let actor = LatencyCounterActor {
            value: 0,
            ceiling: 1,
            closed: false,
            allow_window_msec,
            stats,
            throughput_name,
        };
        tokio::spawn(actor.run(receiver));

        Self { sender, closed }
    }

    /// §4.1 `increase()`. Samples outbound throughput, recomputes the
    /// ceiling, and clamps `value + 1` to it. Silently skipped if the
    /// sample is unavailable (defensive: a stats failure never pushes
    /// the counter up) or if the counter is closed.
    pub async fn increase(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.sender.send(CounterMessage::Increase).await;
    }

    /// §4.1 `decrease()`. Halves `value` via integer division (fast
    /// recovery). No-op if already 0 or closed.
    pub async fn decrease(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.sender.send(CounterMessage::Decrease).await;
    }

    /// §4.1 `count()`. Returns 0 immediately if closed (no round trip
    /// needed); otherwise posts a read-barrier message and awaits the
    /// consumer's reply, guaranteeing every write submitted before this
    /// call is observed.
    pub async fn count(&self) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let (reply, rx) = oneshot::channel();
        if self.sender.send(CounterMessage::Read { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Idempotent close: subsequent writes become no-ops and subsequent
    /// reads return 0 without needing the consumer task at all, once the
    /// close is observed. The close message itself still goes through
    /// the channel so it is ordered with respect to any write the same
    /// caller issued just before it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(CounterMessage::Close).await;
    }
}

struct LatencyCounterActor {
    value: u64,
    ceiling: u64,
    closed: bool,
    allow_window_msec: u32,
    stats: Arc<dyn StatisticsProvider>,
    throughput_name: String,
}

impl LatencyCounterActor {
    async fn run(mut self, mut receiver: mpsc::Receiver<CounterMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                CounterMessage::Increase => self.handle_increase().await,
                CounterMessage::Decrease => self.handle_decrease(),
                CounterMessage::Read { reply } => {
                    let _ = reply.send(if self.closed { 0 } else { self.value });
                }
                CounterMessage::Close => {
                    self.closed = true;
                    self.value = 0;
                }
            }
        }
        tracing::debug!(plugin = %self.throughput_name, "latency counter actor shut down");
    }

    async fn handle_increase(&mut self) {
        if self.closed {
            return;
        }
        let rate = match self
            .stats
            .throughput_rate1(&self.throughput_name, StatsScope::AllStatistics)
            .await
        {
            Ok(rate) => rate,
            Err(err) => {
                tracing::warn!(error = %err, plugin = %self.throughput_name, "outbound rate sample unavailable, skipping increase");
                return;
            }
        };
        self.ceiling = ceiling_from_rate(rate, self.allow_window_msec);
        self.value = (self.value + 1).min(self.ceiling);
    }

    fn handle_decrease(&mut self) {
        if self.closed {
            return;
        }
        if self.value > 0 {
            self.value /= 2;
        }
    }
}

/// `max(1, floor(rate * allow_window_msec / 1000 + 0.5))` — round-half-up
/// in the positive domain this always operates in, per §3/DESIGN.md.
pub(crate) fn ceiling_from_rate(rate: f64, allow_window_msec: u32) -> u64 {
    let raw = rate * allow_window_msec as f64 / 1000.0 + 0.5;
    let rounded = raw.floor().max(0.0) as u64;
    rounded.max(1)
}
