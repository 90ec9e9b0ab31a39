//! Adaptive flow-control limiter.
//!
//! Paces outgoing calls against the remote platform and reacts to
//! flood-wait ("slow down for N seconds") signals. In adaptive mode the
//! pacing interval grows multiplicatively on each flood-wait and decays
//! back toward the minimum once a recovery window passes without one.
//! Every adjustment is recorded in an append-only audit trail.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};
use crate::progress::FloodWaitEvent;

/// Per-second countdown callback during an induced flood wait:
/// `(seconds_remaining, operation_name)`.
pub type CountdownCallback = Arc<dyn Fn(u64, &str) + Send + Sync>;

/// Limiter parameters. All durations are milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Base pacing interval between grants.
    pub batch_delay_ms: u64,

    /// Lower clamp for the adaptive interval.
    pub min_batch_delay_ms: u64,

    /// Upper clamp for the adaptive interval.
    pub max_batch_delay_ms: u64,

    /// Requests-per-minute ceiling, enforced as an interval floor.
    pub requests_per_minute: u64,

    /// Flood waits longer than this are logged as suspicious.
    pub flood_wait_threshold_secs: u64,

    /// Whether the interval adapts to flood-wait signals.
    pub adaptive: bool,

    /// Interval multiplier applied on each flood wait.
    pub backoff_multiplier: f64,

    /// Interval multiplier applied on recovery.
    pub decay_factor: f64,

    /// Quiet period without flood waits before the interval decays.
    pub recovery_window_secs: u64,

    /// Consecutive flood-wait retries before giving up.
    /// `None` retries indefinitely.
    pub max_flood_retries: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: 1_000,
            min_batch_delay_ms: 250,
            max_batch_delay_ms: 30_000,
            requests_per_minute: 120,
            flood_wait_threshold_secs: 300,
            adaptive: true,
            backoff_multiplier: 2.0,
            decay_factor: 0.75,
            recovery_window_secs: 300,
            max_flood_retries: None,
        }
    }
}

/// Partial update for [`RateLimitConfig`]; `None` fields keep their
/// current value.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPatch {
    pub batch_delay_ms: Option<u64>,
    pub min_batch_delay_ms: Option<u64>,
    pub max_batch_delay_ms: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub flood_wait_threshold_secs: Option<u64>,
    pub adaptive: Option<bool>,
    pub backoff_multiplier: Option<f64>,
    pub decay_factor: Option<f64>,
    pub recovery_window_secs: Option<u64>,
    pub max_flood_retries: Option<Option<u32>>,
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStats {
    /// Grants handed out so far.
    pub requests: u64,

    /// Flood-wait signals recorded.
    pub flood_waits: u64,

    /// Cumulative signaled wait time in seconds.
    pub total_wait_seconds: u64,

    /// Pacing interval currently in effect.
    pub current_delay_ms: u64,

    /// Throughput implied by the current interval.
    pub effective_requests_per_minute: u64,
}

/// One pacing-interval change in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateAdjustmentEvent {
    pub at: chrono::DateTime<Utc>,
    pub previous_delay_ms: u64,
    pub new_delay_ms: u64,
    pub reason: String,
}

struct LimiterInner {
    config: RateLimitConfig,
    current_delay_ms: u64,
    last_grant: Option<Instant>,
    last_flood: Option<Instant>,
    requests: u64,
    flood_waits: u64,
    total_wait_seconds: u64,
    flood_events: Vec<FloodWaitEvent>,
    adjustments: Vec<RateAdjustmentEvent>,
    countdown: Option<CountdownCallback>,
}

/// Adaptive rate limiter shared by every remote call in a run.
pub struct RateLimiter {
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let current_delay_ms = config
            .batch_delay_ms
            .clamp(config.min_batch_delay_ms, config.max_batch_delay_ms);
        Self {
            inner: Mutex::new(LimiterInner {
                config,
                current_delay_ms,
                last_grant: None,
                last_flood: None,
                requests: 0,
                flood_waits: 0,
                total_wait_seconds: 0,
                flood_events: Vec::new(),
                adjustments: Vec::new(),
                countdown: None,
            }),
        }
    }

    /// Install a per-second countdown callback for induced waits.
    pub async fn set_countdown(&self, cb: CountdownCallback) {
        self.inner.lock().await.countdown = Some(cb);
    }

    /// Suspend until at least the current pacing interval has elapsed
    /// since the previous grant. The first grant never waits.
    ///
    /// The lock is held across the sleep so no two grants can ever be
    /// separated by less than the interval in effect at grant time.
    pub async fn acquire(&self) {
        let mut inner = self.inner.lock().await;
        inner.maybe_decay();

        let delay = inner.effective_delay();
        if let Some(last) = inner.last_grant {
            let elapsed = last.elapsed();
            let delay = Duration::from_millis(delay);
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }

        inner.last_grant = Some(Instant::now());
        inner.requests += 1;
    }

    /// Record a flood-wait signal: append the event, bump counters and,
    /// in adaptive mode, back the pacing interval off toward the
    /// configured maximum.
    pub async fn record_flood_wait(&self, seconds: u64, operation: &str) {
        let mut inner = self.inner.lock().await;
        inner.flood_waits += 1;
        inner.total_wait_seconds += seconds;
        inner.last_flood = Some(Instant::now());
        inner.flood_events.push(FloodWaitEvent {
            at: Utc::now(),
            seconds,
            operation: operation.to_string(),
        });

        if seconds > inner.config.flood_wait_threshold_secs {
            warn!(
                "{}: flood wait of {}s exceeds threshold of {}s",
                operation, seconds, inner.config.flood_wait_threshold_secs
            );
        }

        if inner.config.adaptive {
            let previous = inner.current_delay_ms;
            let raised = (previous as f64 * inner.config.backoff_multiplier) as u64;
            let new = raised.min(inner.config.max_batch_delay_ms);
            if new != previous {
                inner.current_delay_ms = new;
                inner.adjustments.push(RateAdjustmentEvent {
                    at: Utc::now(),
                    previous_delay_ms: previous,
                    new_delay_ms: new,
                    reason: "rate-exceeded".to_string(),
                });
                warn!(
                    "{}: flood wait {}s, pacing interval {}ms -> {}ms",
                    operation, seconds, previous, new
                );
            }
        }
    }

    /// Current limiter parameters.
    pub async fn config(&self) -> RateLimitConfig {
        self.inner.lock().await.config.clone()
    }

    /// Apply a partial configuration update. No side effects beyond
    /// the assignments; the live interval is re-clamped to the new
    /// bounds.
    pub async fn set_config(&self, patch: RateLimitPatch) {
        let mut inner = self.inner.lock().await;
        let c = &mut inner.config;
        if let Some(v) = patch.batch_delay_ms {
            c.batch_delay_ms = v;
        }
        if let Some(v) = patch.min_batch_delay_ms {
            c.min_batch_delay_ms = v;
        }
        if let Some(v) = patch.max_batch_delay_ms {
            c.max_batch_delay_ms = v;
        }
        if let Some(v) = patch.requests_per_minute {
            c.requests_per_minute = v;
        }
        if let Some(v) = patch.flood_wait_threshold_secs {
            c.flood_wait_threshold_secs = v;
        }
        if let Some(v) = patch.adaptive {
            c.adaptive = v;
        }
        if let Some(v) = patch.backoff_multiplier {
            c.backoff_multiplier = v;
        }
        if let Some(v) = patch.decay_factor {
            c.decay_factor = v;
        }
        if let Some(v) = patch.recovery_window_secs {
            c.recovery_window_secs = v;
        }
        if let Some(v) = patch.max_flood_retries {
            c.max_flood_retries = v;
        }
        inner.current_delay_ms = inner
            .current_delay_ms
            .clamp(inner.config.min_batch_delay_ms, inner.config.max_batch_delay_ms);
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> RateLimitStats {
        let inner = self.inner.lock().await;
        let delay = inner.effective_delay().max(1);
        RateLimitStats {
            requests: inner.requests,
            flood_waits: inner.flood_waits,
            total_wait_seconds: inner.total_wait_seconds,
            current_delay_ms: inner.current_delay_ms,
            effective_requests_per_minute: 60_000 / delay,
        }
    }

    /// Interval adjustment audit trail.
    pub async fn adjustments(&self) -> Vec<RateAdjustmentEvent> {
        self.inner.lock().await.adjustments.clone()
    }

    /// Drain recorded flood-wait events so the caller can fold them
    /// into the persisted progress document.
    pub async fn take_flood_events(&self) -> Vec<FloodWaitEvent> {
        std::mem::take(&mut self.inner.lock().await.flood_events)
    }

    /// Run `f`, retrying after each flood-wait signal.
    ///
    /// On a flood-wait error the signaled duration is recorded, counted
    /// down second by second through the countdown callback, waited in
    /// full, and the operation re-invoked. Consecutive flood waits are
    /// retried up to `max_flood_retries` (indefinitely when unset).
    /// Any other error propagates immediately.
    pub async fn retry_flood<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(seconds) = err.flood_wait_seconds() else {
                        return Err(err);
                    };
                    attempts += 1;
                    let cap = self.inner.lock().await.config.max_flood_retries;
                    if let Some(cap) = cap {
                        if attempts > cap {
                            warn!(
                                "{}: giving up after {} flood-wait retries",
                                operation, cap
                            );
                            return Err(err);
                        }
                    }
                    self.record_flood_wait(seconds, operation).await;
                    self.wait_with_countdown(seconds, operation).await;
                }
            }
        }
    }

    async fn wait_with_countdown(&self, seconds: u64, operation: &str) {
        let countdown = self.inner.lock().await.countdown.clone();
        debug!("{}: waiting {}s for flood wait to clear", operation, seconds);
        for remaining in (1..=seconds).rev() {
            if let Some(cb) = &countdown {
                cb(remaining, operation);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

impl LimiterInner {
    /// Pacing interval with the requests-per-minute ceiling applied.
    fn effective_delay(&self) -> u64 {
        let rpm_floor = if self.config.requests_per_minute > 0 {
            60_000 / self.config.requests_per_minute
        } else {
            0
        };
        self.current_delay_ms.max(rpm_floor)
    }

    /// Lazy decay: once a recovery window passes without a flood wait,
    /// ease the interval back toward the minimum.
    fn maybe_decay(&mut self) {
        if !self.config.adaptive {
            return;
        }
        if self.current_delay_ms <= self.config.min_batch_delay_ms {
            return;
        }
        let Some(last_flood) = self.last_flood else {
            return;
        };
        if last_flood.elapsed() < Duration::from_secs(self.config.recovery_window_secs) {
            return;
        }

        let previous = self.current_delay_ms;
        let lowered = (previous as f64 * self.config.decay_factor) as u64;
        let new = lowered.max(self.config.min_batch_delay_ms);
        if new != previous {
            self.current_delay_ms = new;
            // Restart the window so the interval steps down gradually.
            self.last_flood = Some(Instant::now());
            self.adjustments.push(RateAdjustmentEvent {
                at: Utc::now(),
                previous_delay_ms: previous,
                new_delay_ms: new,
                reason: "recovered".to_string(),
            });
            debug!("pacing interval recovered: {}ms -> {}ms", previous, new);
        }
    }
}
