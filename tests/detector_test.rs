//! Loop detector triggers and state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use huginn::{
    DetectorState, Embedder, HuginnError, LoopDetector, LoopDetectorConfig, LoopTrigger, Result,
};
use serde_json::json;

// ============================================================================
// Mock embedders
// ============================================================================

/// Bag-of-characters embedding: identical text gives identical vectors,
/// texts over disjoint alphabets are orthogonal.
struct CharEmbedder {
    texts: Mutex<Vec<String>>,
}

impl CharEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            texts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.texts.lock().unwrap().len()
    }
}

#[async_trait]
impl Embedder for CharEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.texts.lock().unwrap().push(text.to_string());
        let mut v = vec![0.0f32; 128];
        for b in text.bytes() {
            v[(b % 128) as usize] += 1.0;
        }
        Ok(v)
    }
}

/// Returns a fixed vector per tool name, regardless of arguments.
struct ToolEmbedder {
    vectors: HashMap<&'static str, Vec<f32>>,
}

#[async_trait]
impl Embedder for ToolEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tool = text.split(':').next().unwrap_or_default();
        Ok(self
            .vectors
            .get(tool)
            .cloned()
            .unwrap_or_else(|| vec![0.0, 0.0, 1.0]))
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(HuginnError::Timeout)
    }
}

fn detector(embedder: Arc<dyn Embedder>) -> LoopDetector {
    LoopDetector::new(LoopDetectorConfig::default(), embedder).unwrap()
}

// ============================================================================
// Semantic repetition
// ============================================================================

#[tokio::test]
async fn identical_calls_trigger_loop() {
    let d = detector(CharEmbedder::new());
    let args = json!({"path": "src/lib.rs"});
    for _ in 0..3 {
        d.record_action("read_file", &args, "pub mod cache;").await;
    }
    assert!(d.detect_loop());
    assert_eq!(d.state(), DetectorState::LoopFlagged);
    assert_eq!(d.trigger(), Some(LoopTrigger::Repetition));
}

#[tokio::test]
async fn fewer_than_window_does_not_trigger() {
    let d = detector(CharEmbedder::new());
    let args = json!({"q": "x"});
    d.record_action("search", &args, "nothing").await;
    d.record_action("search", &args, "nothing").await;
    assert!(!d.detect_loop());
    assert_eq!(d.state(), DetectorState::Accumulating);
}

#[tokio::test]
async fn dissimilar_calls_do_not_trigger() {
    let embedder = Arc::new(ToolEmbedder {
        vectors: HashMap::from([
            ("read_file", vec![1.0, 0.0, 0.0]),
            ("write_file", vec![0.0, 1.0, 0.0]),
            ("run_tests", vec![0.0, 0.0, 1.0]),
        ]),
    });
    let d = detector(embedder);
    d.record_action("read_file", &json!({}), "a").await;
    d.record_action("write_file", &json!({}), "b").await;
    d.record_action("run_tests", &json!({}), "c").await;
    assert!(!d.detect_loop());
}

#[tokio::test]
async fn same_tool_with_varied_arguments_repeats() {
    let embedder = Arc::new(ToolEmbedder {
        vectors: HashMap::from([("grep", vec![1.0, 0.01, 0.0])]),
    });
    let d = detector(embedder);
    for i in 0..3 {
        d.record_action("grep", &json!({"pattern": format!("foo{i}")}), "no match")
            .await;
    }
    assert!(d.detect_loop());
}

#[tokio::test]
async fn one_differing_action_in_window_breaks_repetition() {
    let d = detector(CharEmbedder::new());
    let args = json!({"path": "a"});
    d.record_action("read_file", &args, "same").await;
    d.record_action("read_file", &args, "same").await;
    d.record_action("zzz", &json!({"q": "qqqq"}), "wwww").await;
    assert!(!d.detect_loop());
}

#[tokio::test]
async fn planning_tool_never_triggers() {
    let embedder = CharEmbedder::new();
    let d = detector(embedder.clone());
    let args = json!({"steps": ["refine"]});
    for _ in 0..10 {
        d.record_action("plan_actions", &args, "plan updated").await;
    }
    assert!(!d.detect_loop());
    // Exempt actions are not embedded.
    assert_eq!(embedder.calls(), 0);
    assert_eq!(d.history().len(), 10);
}

#[tokio::test]
async fn exempt_actions_are_skipped_within_window() {
    let d = detector(CharEmbedder::new());
    let args = json!({"path": "x"});
    d.record_action("read_file", &args, "same").await;
    d.record_action("ask_user", &json!({"q": "ok?"}), "yes").await;
    d.record_action("read_file", &args, "same").await;
    d.record_action("plan_actions", &json!({}), "plan").await;
    d.record_action("read_file", &args, "same").await;
    assert!(d.detect_loop());
}

#[tokio::test]
async fn embedding_failure_falls_back_to_text_equality() {
    let d = detector(Arc::new(FailingEmbedder));
    let args = json!({"cmd": "ls"});
    for _ in 0..3 {
        d.record_action("shell", &args, "file.txt").await;
    }
    assert!(d.history().iter().all(|a| a.embedding.is_none()));
    assert!(d.detect_loop());

    let d = detector(Arc::new(FailingEmbedder));
    for i in 0..3 {
        d.record_action("shell", &json!({"cmd": format!("ls {i}")}), "file.txt")
            .await;
    }
    assert!(!d.detect_loop());
}

#[tokio::test]
async fn embedded_text_is_truncated() {
    let embedder = CharEmbedder::new();
    let d = LoopDetector::new(
        LoopDetectorConfig::new().max_embed_chars(16),
        embedder.clone(),
    )
    .unwrap();
    d.record_action("read_file", &json!({"path": "a"}), &"x".repeat(1000))
        .await;
    let texts = embedder.texts.lock().unwrap();
    assert_eq!(texts[0].chars().count(), 16);
    assert!(texts[0].starts_with("read_file: "));
}

#[tokio::test]
async fn history_is_bounded() {
    let d = LoopDetector::new(
        LoopDetectorConfig::new().window_size(2).history_limit(4),
        CharEmbedder::new(),
    )
    .unwrap();
    for i in 0..10 {
        d.record_action("tool", &json!({ "i": i }), "r").await;
    }
    let history = d.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].arguments, json!({"i": 6}));
}

// ============================================================================
// State machine
// ============================================================================

#[tokio::test]
async fn flag_is_sticky_until_reset() {
    let d = detector(CharEmbedder::new());
    let args = json!({});
    for _ in 0..3 {
        d.record_action("read_file", &args, "x").await;
    }
    assert!(d.detect_loop());

    // New, different actions do not clear the flag.
    d.record_action("write_file", &json!({"path": "b"}), "ok").await;
    assert!(d.detect_loop());
    assert_eq!(d.state(), DetectorState::LoopFlagged);

    d.reset();
    assert_eq!(d.state(), DetectorState::Accumulating);
    assert!(d.trigger().is_none());
    assert!(d.history().is_empty());
    assert_eq!(d.progress_score(), 0.0);
    assert!(!d.detect_loop());
}

// ============================================================================
// Stagnation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn no_progress_within_timeout_triggers_stagnation() {
    let d = detector(CharEmbedder::new());
    d.record_action("read_file", &json!({"path": "a"}), "contents").await;
    assert!(!d.detect_loop());

    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(d.detect_loop());
    assert_eq!(d.trigger(), Some(LoopTrigger::Stagnation));
}

#[tokio::test(start_paused = true)]
async fn progress_resets_stagnation_clock() {
    let d = detector(CharEmbedder::new());
    d.record_action("write_file", &json!({"path": "a"}), "ok").await;

    tokio::time::advance(Duration::from_secs(200)).await;
    d.update_progress("write_file", "wrote 10 bytes");
    assert_eq!(d.progress_score(), 1.0);

    tokio::time::advance(Duration::from_secs(200)).await;
    assert!(!d.detect_loop());

    tokio::time::advance(Duration::from_secs(101)).await;
    assert!(d.detect_loop());
}

#[tokio::test(start_paused = true)]
async fn failures_lower_score_and_count_as_movement() {
    let d = detector(CharEmbedder::new());
    d.record_action("run_tests", &json!({}), "FAILED").await;

    tokio::time::advance(Duration::from_secs(250)).await;
    d.update_progress("run_tests", "Error: 3 tests FAILED");
    assert_eq!(d.progress_score(), -0.5);

    tokio::time::advance(Duration::from_secs(250)).await;
    assert!(!d.detect_loop());
}

#[tokio::test(start_paused = true)]
async fn idle_time_before_first_action_is_not_stagnation() {
    let d = detector(CharEmbedder::new());
    tokio::time::advance(Duration::from_secs(600)).await;

    d.record_action("read_file", &json!({"path": "a"}), "contents").await;
    assert!(!d.detect_loop());
    assert_eq!(d.trigger(), None);

    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(d.detect_loop());
    assert_eq!(d.trigger(), Some(LoopTrigger::Stagnation));
}

#[tokio::test]
async fn passing_test_runs_raise_the_score() {
    let d = detector(CharEmbedder::new());
    d.update_progress("run_tests", "test result: ok. 12 passed; 0 failed; 0 ignored");
    assert_eq!(d.progress_score(), 1.0);

    d.update_progress("run_tests", "========= 8 passed, 0 failed in 1.02s =========");
    assert_eq!(d.progress_score(), 2.0);

    d.update_progress("run_tests", "test result: FAILED. 11 passed; 1 failed");
    assert_eq!(d.progress_score(), 1.5);
}

#[tokio::test(start_paused = true)]
async fn neutral_outcomes_do_not_reset_clock() {
    let d = detector(CharEmbedder::new());
    d.record_action("read_file", &json!({}), "x").await;

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(80)).await;
        d.update_progress("read_file", "some contents");
    }
    assert_eq!(d.progress_score(), 0.0);
    assert!(d.detect_loop());
}

#[tokio::test(start_paused = true)]
async fn movement_within_epsilon_is_not_progress() {
    let d = LoopDetector::new(
        LoopDetectorConfig::new()
            .progress_weight("touch", 0.001)
            .progress_epsilon(0.01),
        CharEmbedder::new(),
    )
    .unwrap();
    d.record_action("touch", &json!({}), "ok").await;

    tokio::time::advance(Duration::from_secs(200)).await;
    d.update_progress("touch", "ok");
    tokio::time::advance(Duration::from_secs(101)).await;
    assert!(d.detect_loop());
    assert_eq!(d.trigger(), Some(LoopTrigger::Stagnation));
}

#[tokio::test(start_paused = true)]
async fn exempt_suppression_flag_controls_stagnation() {
    for (suppress, expect_loop) in [(false, true), (true, false)] {
        let d = LoopDetector::new(
            LoopDetectorConfig::new().exempt_suppresses_stagnation(suppress),
            CharEmbedder::new(),
        )
        .unwrap();
        d.record_action("read_file", &json!({}), "x").await;
        d.record_action("ask_user", &json!({"q": "continue?"}), "waiting").await;

        tokio::time::advance(Duration::from_secs(400)).await;
        assert_eq!(d.detect_loop(), expect_loop, "suppress = {suppress}");
    }
}

#[tokio::test(start_paused = true)]
async fn idle_detector_without_actions_is_not_stagnant() {
    let d = detector(CharEmbedder::new());
    tokio::time::advance(Duration::from_secs(1000)).await;
    assert!(!d.detect_loop());
}

#[test]
fn invalid_config_is_rejected() {
    let result = LoopDetector::new(
        LoopDetectorConfig::new().window_size(0),
        CharEmbedder::new(),
    );
    assert!(matches!(result, Err(HuginnError::Configuration(_))));
}
