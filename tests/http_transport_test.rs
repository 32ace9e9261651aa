//! Wiremock integration tests for the HTTP transport and the full client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use huginn::{
    ChatOptions, Endpoint, HttpTransport, HuginnError, InferenceClient, Message, Provisioner,
    Result, RetryConfig, Transport,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(server.uri(), Duration::from_secs(5)).unwrap()
}

// ============================================================================
// Transport error mapping
// ============================================================================

#[tokio::test]
async fn posts_json_and_returns_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .and(body_partial_json(json!({"model": "nomic-embed-text"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.5, 0.25]})))
        .expect(1)
        .mount(&server)
        .await;

    let body = json!({"model": "nomic-embed-text", "prompt": "hi"});
    let value = transport(&server)
        .post_json(Endpoint::Embed, &body)
        .await
        .unwrap();
    assert_eq!(value["embedding"][1], 0.25);
}

#[tokio::test]
async fn not_found_maps_to_missing_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post_json(Endpoint::Chat, &json!({"model": "llama3.1"}))
        .await
        .unwrap_err();
    match err {
        HuginnError::ModelNotFound(model) => assert_eq!(model, "llama3.1"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_model_message_on_other_status_is_recognised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_json(
            json!({"error": "model \"qwen2.5\" not found, try pulling it first"}),
        ))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post_json(Endpoint::Chat, &json!({"model": "qwen2.5"}))
        .await
        .unwrap_err();
    assert!(err.is_model_not_found());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post_json(Endpoint::Chat, &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    assert_eq!(err.status(), Some(429));
}

#[tokio::test]
async fn server_error_keeps_status_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "busy"})))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post_json(Endpoint::Chat, &json!({}))
        .await
        .unwrap_err();
    match err {
        HuginnError::Api { status, message } => {
            assert_eq!(status, 503);
            assert_eq!(message, "busy");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn non_json_success_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post_json(Endpoint::Embed, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::MalformedResponse(_)));
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let t = HttpTransport::new(server.uri(), Duration::from_millis(50)).unwrap();
    let err = t.post_json(Endpoint::Chat, &json!({})).await.unwrap_err();
    assert!(matches!(err, HuginnError::Timeout));
    assert!(err.is_transient());
}

#[tokio::test]
async fn connection_refused_is_transient() {
    let t = HttpTransport::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
    let err = t.post_json(Endpoint::Chat, &json!({})).await.unwrap_err();
    assert!(err.is_transient());
}

// ============================================================================
// Full client over HTTP
// ============================================================================

struct RecordingProvisioner {
    calls: AtomicU32,
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn provision(&self, _model: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn client(server: &MockServer, provisioner: Arc<RecordingProvisioner>) -> InferenceClient {
    InferenceClient::builder()
        .base_url(server.uri())
        .retry(
            RetryConfig::new()
                .max_retries(2)
                .backoff_factor(Duration::from_millis(1)),
        )
        .provisioner(provisioner)
        .build()
        .unwrap()
}

#[tokio::test]
async fn client_retries_server_errors_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.1",
            "message": {"role": "assistant", "content": "recovered"},
            "prompt_eval_count": 12,
            "eval_count": 4
        })))
        .mount(&server)
        .await;

    let provisioner = Arc::new(RecordingProvisioner {
        calls: AtomicU32::new(0),
    });
    let client = client(&server, provisioner);
    let response = client
        .chat(&[Message::user("hi")], None, &ChatOptions::new())
        .await
        .unwrap();

    assert_eq!(response.message.content, "recovered");
    assert_eq!(response.usage.total_tokens, 16);
    assert_eq!(client.stats().retries, 1);
}

#[tokio::test]
async fn client_provisions_missing_model_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 0.0]})))
        .expect(1)
        .mount(&server)
        .await;

    let provisioner = Arc::new(RecordingProvisioner {
        calls: AtomicU32::new(0),
    });
    let client = client(&server, provisioner.clone());

    assert_eq!(client.embed("pull me").await.unwrap(), vec![1.0, 0.0]);
    assert_eq!(provisioner.calls.load(Ordering::Relaxed), 1);
    // Cached now: no further HTTP traffic.
    assert_eq!(client.embed("pull me").await.unwrap(), vec![1.0, 0.0]);
}
