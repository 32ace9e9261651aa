//! Semantic loop detection for tool-using agents.
//!
//! An agent is considered stuck when either
//!
//! - its last `window_size` non-exempt actions are pairwise near-identical
//!   in embedding space (semantic repetition), or
//! - its progress score has not moved for longer than `stagnation_timeout`
//!   (stagnation).
//!
//! Once flagged, the detector stays flagged until [`LoopDetector::reset`].
//! Planning and user-query tools are exempt from repetition checks, since
//! iterative refinement of a plan legitimately looks repetitive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telemetry;
use crate::traits::Embedder;
use crate::{HuginnError, Result};

/// Detector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Consecutive non-exempt actions compared for repetition. Default: 3.
    pub window_size: usize,
    /// Actions retained in history. Default: 50.
    pub history_limit: usize,
    /// Minimum pairwise cosine similarity counted as a repeat. Default: 0.95.
    pub similarity_threshold: f32,
    /// Time without progress before stagnation fires. Default: 300s.
    #[serde(rename = "stagnation_timeout_secs", with = "secs")]
    pub stagnation_timeout: Duration,
    /// Score movement that counts as progress. Default: 0.01.
    pub progress_epsilon: f64,
    /// Subtracted from the score on a failed tool result. Default: 0.5.
    pub failure_penalty: f64,
    /// Tools never considered for repetition. Default: `plan_actions`, `ask_user`.
    pub exempt_tools: Vec<String>,
    /// Suppress stagnation while the latest action is exempt. Default: false.
    pub exempt_suppresses_stagnation: bool,
    /// Score added when a listed tool succeeds.
    pub progress_weights: HashMap<String, f64>,
    /// Longest text sent to the embedder per action. Default: 2000 chars.
    pub max_embed_chars: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            history_limit: 50,
            similarity_threshold: 0.95,
            stagnation_timeout: Duration::from_secs(300),
            progress_epsilon: 0.01,
            failure_penalty: 0.5,
            exempt_tools: vec!["plan_actions".to_string(), "ask_user".to_string()],
            exempt_suppresses_stagnation: false,
            progress_weights: HashMap::from([
                ("write_file".to_string(), 1.0),
                ("edit_file".to_string(), 1.0),
                ("run_tests".to_string(), 1.0),
            ]),
            max_embed_chars: 2000,
        }
    }
}

impl LoopDetectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_size(mut self, n: usize) -> Self {
        self.window_size = n;
        self
    }

    pub fn history_limit(mut self, n: usize) -> Self {
        self.history_limit = n;
        self
    }

    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn stagnation_timeout(mut self, timeout: Duration) -> Self {
        self.stagnation_timeout = timeout;
        self
    }

    pub fn progress_epsilon(mut self, epsilon: f64) -> Self {
        self.progress_epsilon = epsilon;
        self
    }

    pub fn failure_penalty(mut self, penalty: f64) -> Self {
        self.failure_penalty = penalty;
        self
    }

    pub fn exempt_tools(mut self, tools: Vec<String>) -> Self {
        self.exempt_tools = tools;
        self
    }

    pub fn exempt_suppresses_stagnation(mut self, enabled: bool) -> Self {
        self.exempt_suppresses_stagnation = enabled;
        self
    }

    /// Set (or replace) the progress weight of one tool.
    pub fn progress_weight(mut self, tool: impl Into<String>, weight: f64) -> Self {
        self.progress_weights.insert(tool.into(), weight);
        self
    }

    pub fn max_embed_chars(mut self, n: usize) -> Self {
        self.max_embed_chars = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(HuginnError::Configuration(msg.to_string()));
        if self.window_size < 2 {
            return fail("detector window_size must be at least 2");
        }
        if self.history_limit < self.window_size {
            return fail("detector history_limit must be >= window_size");
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return fail("detector similarity_threshold must be within [-1, 1]");
        }
        if self.progress_epsilon < 0.0 {
            return fail("detector progress_epsilon must be non-negative");
        }
        if self.max_embed_chars == 0 {
            return fail("detector max_embed_chars must be non-zero");
        }
        Ok(())
    }

    fn is_exempt(&self, tool_name: &str) -> bool {
        self.exempt_tools.iter().any(|t| t == tool_name)
    }
}

/// Detector state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Accumulating,
    LoopFlagged,
}

/// What flagged the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopTrigger {
    Repetition,
    Stagnation,
}

impl LoopTrigger {
    fn as_str(self) -> &'static str {
        match self {
            LoopTrigger::Repetition => "repetition",
            LoopTrigger::Stagnation => "stagnation",
        }
    }
}

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: String,
    /// `None` for exempt tools and when embedding failed.
    pub embedding: Option<Vec<f32>>,
    pub recorded_at: DateTime<Utc>,
    /// Text that was (or would have been) embedded.
    #[serde(skip)]
    text: String,
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for empty or mismatched vectors and for zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// `failed`, optionally preceded by a count and one noun ("3 tests failed").
static FAILED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:(\d+)\s+(?:[a-z]+\s+)?)?failed\b").unwrap());

/// Heuristic failure check on a tool result.
///
/// A zero count ("0 failed") is a passing summary, not a failure.
pub fn is_failure_result(result: &str) -> bool {
    let lower = result.trim_start().to_lowercase();
    if lower.starts_with("error") || lower.contains("error:") || lower.contains("traceback") {
        return true;
    }
    FAILED_RE.captures_iter(&lower).any(|caps| {
        caps.get(1)
            .is_none_or(|count| count.as_str().bytes().any(|b| b != b'0'))
    })
}

struct Inner {
    state: DetectorState,
    trigger: Option<LoopTrigger>,
    history: VecDeque<ActionRecord>,
    score: f64,
    score_at_last_progress: f64,
    last_progress_at: Instant,
}

impl Inner {
    fn fresh() -> Self {
        Self {
            state: DetectorState::Accumulating,
            trigger: None,
            history: VecDeque::new(),
            score: 0.0,
            score_at_last_progress: 0.0,
            last_progress_at: Instant::now(),
        }
    }
}

/// Flags agents stuck in repetitive or unproductive tool loops.
///
/// Embeddings are produced outside the detector's lock, so a slow embedder
/// never blocks `detect_loop` or `update_progress` callers.
pub struct LoopDetector {
    config: LoopDetectorConfig,
    embedder: Arc<dyn Embedder>,
    inner: Mutex<Inner>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            embedder,
            inner: Mutex::new(Inner::fresh()),
        })
    }

    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Record one tool invocation.
    ///
    /// Non-exempt actions are embedded first; an embedding failure is logged
    /// and the action falls back to exact-text comparison.
    pub async fn record_action(&self, tool_name: &str, arguments: &Value, result: &str) {
        let text: String = format!("{tool_name}: {arguments} -> {result}")
            .chars()
            .take(self.config.max_embed_chars)
            .collect();

        let embedding = if self.config.is_exempt(tool_name) {
            None
        } else {
            match self.embedder.embed(&text).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(tool = tool_name, error = %e, "failed to embed action, comparing by text");
                    None
                }
            }
        };

        let record = ActionRecord {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            result: result.to_string(),
            embedding,
            recorded_at: Utc::now(),
            text,
        };

        let mut inner = self.inner.lock();
        if inner.history.is_empty() {
            // Idle time before the first action is not stagnation.
            inner.last_progress_at = Instant::now();
        }
        inner.history.push_back(record);
        while inner.history.len() > self.config.history_limit {
            inner.history.pop_front();
        }
        debug!(tool = tool_name, history = inner.history.len(), "action recorded");
    }

    /// Adjust the progress score from a tool outcome.
    ///
    /// Failures subtract `failure_penalty`; successful tools listed in
    /// `progress_weights` add their weight. The stagnation clock restarts
    /// only when the score has moved more than `progress_epsilon` since the
    /// last restart.
    pub fn update_progress(&self, tool_name: &str, result: &str) {
        let delta = if is_failure_result(result) {
            -self.config.failure_penalty
        } else {
            self.config
                .progress_weights
                .get(tool_name)
                .copied()
                .unwrap_or(0.0)
        };

        let mut inner = self.inner.lock();
        inner.score += delta;
        if (inner.score - inner.score_at_last_progress).abs() > self.config.progress_epsilon {
            inner.score_at_last_progress = inner.score;
            inner.last_progress_at = Instant::now();
            debug!(tool = tool_name, score = inner.score, "progress recorded");
        }
    }

    /// Check both triggers. Sticky: once flagged, returns true until reset.
    pub fn detect_loop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == DetectorState::LoopFlagged {
            return true;
        }

        let trigger = if self.repeats(&inner) {
            Some(LoopTrigger::Repetition)
        } else if self.stagnated(&inner) {
            Some(LoopTrigger::Stagnation)
        } else {
            None
        };

        let Some(trigger) = trigger else {
            return false;
        };
        inner.state = DetectorState::LoopFlagged;
        inner.trigger = Some(trigger);
        drop(inner);

        metrics::counter!(telemetry::LOOPS_DETECTED_TOTAL, "trigger" => trigger.as_str())
            .increment(1);
        warn!(trigger = trigger.as_str(), "agent loop detected");
        true
    }

    /// Return to `Accumulating` with empty history and a fresh clock.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::fresh();
        debug!("loop detector reset");
    }

    pub fn state(&self) -> DetectorState {
        self.inner.lock().state
    }

    /// The trigger that flagged the current loop, if any.
    pub fn trigger(&self) -> Option<LoopTrigger> {
        self.inner.lock().trigger
    }

    pub fn progress_score(&self) -> f64 {
        self.inner.lock().score
    }

    /// Snapshot of the retained history, oldest first.
    pub fn history(&self) -> Vec<ActionRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }

    fn repeats(&self, inner: &Inner) -> bool {
        let window: Vec<&ActionRecord> = inner
            .history
            .iter()
            .rev()
            .filter(|a| !self.config.is_exempt(&a.tool_name))
            .take(self.config.window_size)
            .collect();
        if window.len() < self.config.window_size {
            return false;
        }

        window.iter().enumerate().all(|(i, a)| {
            window[i + 1..]
                .iter()
                .all(|b| self.similar(a, b))
        })
    }

    fn similar(&self, a: &ActionRecord, b: &ActionRecord) -> bool {
        match (&a.embedding, &b.embedding) {
            (Some(x), Some(y)) => cosine_similarity(x, y) >= self.config.similarity_threshold,
            _ => a.text == b.text,
        }
    }

    fn stagnated(&self, inner: &Inner) -> bool {
        let Some(latest) = inner.history.back() else {
            return false;
        };
        if self.config.exempt_suppresses_stagnation && self.config.is_exempt(&latest.tool_name) {
            return false;
        }
        inner.last_progress_at.elapsed() > self.config.stagnation_timeout
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
