//! Latency-driven adaptive rate governor.
//!
//! The inference backend shares compute with other consumers, so rising
//! response latency is treated as a congestion signal. The governor keeps an
//! exponential moving average (EMA) of observed latencies and runs an
//! additive-increase / multiplicative-decrease controller on the
//! requests-per-minute ceiling:
//!
//! - EMA above `degradation_threshold` → mode `Degraded`, ceiling multiplied
//!   by `decrease_factor` on every sample (never below `min_rpm`).
//! - EMA below `recovery_threshold` → mode `Normal`, ceiling raised by
//!   `increase_step` on every sample (never above `base_rpm`).
//! - In between, nothing changes.
//!
//! The ceiling is enforced over a sliding window (60 s by default) of
//! admission instants. Admission is one locked check-and-record, so a caller
//! that abandons a wait leaves no trace in the window.
//!
//! Time comes from [`tokio::time::Instant`], which behaves like
//! `std::time::Instant` outside a paused test runtime.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::telemetry;
use crate::{HuginnError, Result};

/// Number of recent latency samples retained for stats.
const SAMPLE_HISTORY: usize = 128;

/// Governor tuning.
///
/// ```rust
/// # use huginn::GovernorConfig;
/// # use std::time::Duration;
/// let config = GovernorConfig::new()
///     .base_rpm(120)
///     .min_rpm(10)
///     .degradation_threshold(Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Ceiling under healthy latency. Default: 60.
    pub base_rpm: u32,
    /// Floor under sustained degradation. Default: 5.
    pub min_rpm: u32,
    /// EMA above this enters degraded mode. Default: 5000 ms.
    #[serde(rename = "degradation_threshold_ms", with = "millis")]
    pub degradation_threshold: Duration,
    /// EMA below this relaxes the ceiling. Default: 2000 ms.
    #[serde(rename = "recovery_threshold_ms", with = "millis")]
    pub recovery_threshold: Duration,
    /// EMA smoothing factor in (0, 1]. Default: 0.3.
    pub ema_alpha: f64,
    /// Multiplicative decrease per degraded sample, in (0, 1). Default: 0.8.
    pub decrease_factor: f64,
    /// Additive increase per healthy sample. Default: 5.
    pub increase_step: u32,
    /// Admission window. Default: 60 s.
    #[serde(rename = "window_secs", with = "secs")]
    pub window: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_rpm: 60,
            min_rpm: 5,
            degradation_threshold: Duration::from_millis(5000),
            recovery_threshold: Duration::from_millis(2000),
            ema_alpha: 0.3,
            decrease_factor: 0.8,
            increase_step: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl GovernorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_rpm(mut self, rpm: u32) -> Self {
        self.base_rpm = rpm;
        self
    }

    pub fn min_rpm(mut self, rpm: u32) -> Self {
        self.min_rpm = rpm;
        self
    }

    pub fn degradation_threshold(mut self, latency: Duration) -> Self {
        self.degradation_threshold = latency;
        self
    }

    pub fn recovery_threshold(mut self, latency: Duration) -> Self {
        self.recovery_threshold = latency;
        self
    }

    pub fn ema_alpha(mut self, alpha: f64) -> Self {
        self.ema_alpha = alpha;
        self
    }

    pub fn decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor;
        self
    }

    pub fn increase_step(mut self, step: u32) -> Self {
        self.increase_step = step;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(HuginnError::Configuration(msg));
        if self.min_rpm == 0 {
            return fail("governor min_rpm must be at least 1".into());
        }
        if self.min_rpm > self.base_rpm {
            return fail(format!(
                "governor min_rpm ({}) exceeds base_rpm ({})",
                self.min_rpm, self.base_rpm
            ));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return fail(format!("governor ema_alpha {} not in (0, 1]", self.ema_alpha));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return fail(format!(
                "governor decrease_factor {} not in (0, 1)",
                self.decrease_factor
            ));
        }
        if self.recovery_threshold > self.degradation_threshold {
            return fail("governor recovery_threshold exceeds degradation_threshold".into());
        }
        if self.window.is_zero() {
            return fail("governor window must be non-zero".into());
        }
        Ok(())
    }
}

/// Operating mode of the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorMode {
    Normal,
    Degraded,
}

/// Controller state visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GovernorState {
    pub current_rpm: u32,
    /// `None` until the first sample is recorded.
    pub ema_latency_ms: Option<f64>,
    pub mode: GovernorMode,
}

/// One observed round-trip.
#[derive(Debug, Clone, Copy)]
pub struct RateSample {
    pub at: Instant,
    pub latency: Duration,
}

/// State plus window occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStats {
    pub state: GovernorState,
    /// Admissions inside the current window.
    pub in_window: usize,
    pub samples_recorded: u64,
    /// Mean of the retained samples, in milliseconds.
    pub recent_mean_latency_ms: Option<f64>,
}

struct Inner {
    current_rpm: u32,
    ema_ms: Option<f64>,
    mode: GovernorMode,
    admitted: VecDeque<Instant>,
    samples: VecDeque<RateSample>,
    samples_recorded: u64,
}

impl Inner {
    fn state(&self) -> GovernorState {
        GovernorState {
            current_rpm: self.current_rpm,
            ema_latency_ms: self.ema_ms,
            mode: self.mode,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .admitted
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= window)
        {
            self.admitted.pop_front();
        }
    }
}

/// Adaptive admission controller shared by every call of a client.
pub struct RateGovernor {
    config: GovernorConfig,
    inner: Mutex<Inner>,
}

impl RateGovernor {
    /// Create a governor at `base_rpm`.
    ///
    /// Fails fast on inconsistent configuration (e.g. `min_rpm > base_rpm`).
    pub fn new(config: GovernorConfig) -> Result<Self> {
        config.validate()?;
        let inner = Inner {
            current_rpm: config.base_rpm,
            ema_ms: None,
            mode: GovernorMode::Normal,
            admitted: VecDeque::new(),
            samples: VecDeque::with_capacity(SAMPLE_HISTORY),
            samples_recorded: 0,
        };
        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Admit now if the window has room, otherwise report how long until the
    /// oldest admission ages out.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.config.window);

        if inner.admitted.len() < inner.current_rpm as usize {
            inner.admitted.push_back(now);
            return Ok(());
        }
        // Ceiling may have dropped below the occupancy; wait for enough
        // entries to age out to get back under it.
        let excess = inner.admitted.len() - inner.current_rpm as usize;
        let blocker = inner.admitted[excess];
        Err((blocker + self.config.window).saturating_duration_since(now))
    }

    /// Suspend the current task until admitted.
    ///
    /// Cancel-safe: dropping the future while it sleeps leaves the window
    /// untouched.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let mut waited = false;
        while let Err(wait) = self.try_acquire() {
            waited = true;
            debug!(wait_ms = wait.as_millis() as u64, "rate governor suspending caller");
            tokio::time::sleep(wait).await;
        }
        if waited {
            metrics::histogram!(telemetry::GOVERNOR_WAIT_SECONDS)
                .record(started.elapsed().as_secs_f64());
        }
    }

    /// Block the current thread until admitted.
    ///
    /// Must not be called from inside an async task; use [`acquire`](Self::acquire).
    pub fn wait_if_needed(&self) {
        let started = Instant::now();
        let mut waited = false;
        while let Err(wait) = self.try_acquire() {
            waited = true;
            debug!(wait_ms = wait.as_millis() as u64, "rate governor blocking caller");
            std::thread::sleep(wait);
        }
        if waited {
            metrics::histogram!(telemetry::GOVERNOR_WAIT_SECONDS)
                .record(started.elapsed().as_secs_f64());
        }
    }

    /// Feed one completed call's latency into the controller.
    pub fn record_response_time(&self, latency: Duration) {
        let now = Instant::now();
        let sample_ms = latency.as_secs_f64() * 1000.0;
        let degrade_ms = self.config.degradation_threshold.as_secs_f64() * 1000.0;
        let recover_ms = self.config.recovery_threshold.as_secs_f64() * 1000.0;

        let mut inner = self.inner.lock();
        if inner.samples.len() == SAMPLE_HISTORY {
            inner.samples.pop_front();
        }
        inner.samples.push_back(RateSample { at: now, latency });
        inner.samples_recorded += 1;

        let alpha = self.config.ema_alpha;
        let ema = match inner.ema_ms {
            Some(prev) => alpha * sample_ms + (1.0 - alpha) * prev,
            None => sample_ms,
        };
        inner.ema_ms = Some(ema);

        let before = inner.state();
        if ema > degrade_ms {
            let reduced = (inner.current_rpm as f64 * self.config.decrease_factor).floor() as u32;
            inner.current_rpm = reduced.max(self.config.min_rpm);
            inner.mode = GovernorMode::Degraded;
        } else if ema < recover_ms {
            inner.current_rpm = inner
                .current_rpm
                .saturating_add(self.config.increase_step)
                .min(self.config.base_rpm);
            inner.mode = GovernorMode::Normal;
        }
        let after = inner.state();
        drop(inner);

        metrics::gauge!(telemetry::GOVERNOR_RPM).set(after.current_rpm as f64);
        if before.mode != after.mode {
            info!(
                mode = ?after.mode,
                rpm = after.current_rpm,
                ema_ms = ema as u64,
                "rate governor mode changed"
            );
        } else if before.current_rpm != after.current_rpm {
            debug!(
                from = before.current_rpm,
                to = after.current_rpm,
                ema_ms = ema as u64,
                "rate governor adjusted ceiling"
            );
        }
    }

    pub fn state(&self) -> GovernorState {
        self.inner.lock().state()
    }

    pub fn current_rpm(&self) -> u32 {
        self.inner.lock().current_rpm
    }

    pub fn stats(&self) -> GovernorStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.config.window);
        let recent_mean_latency_ms = (!inner.samples.is_empty()).then(|| {
            let total: f64 = inner
                .samples
                .iter()
                .map(|s| s.latency.as_secs_f64() * 1000.0)
                .sum();
            total / inner.samples.len() as f64
        });
        GovernorStats {
            state: inner.state(),
            in_window: inner.admitted.len(),
            samples_recorded: inner.samples_recorded,
            recent_mean_latency_ms,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
