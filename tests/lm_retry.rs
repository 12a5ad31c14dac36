//! Retry policy against a faulty HTTP backend.

use std::time::{Duration, Instant};

use stepwise::models::{
    ChatMessage, ChatOptions, LmFailure, NvidiaProvider, RetryPolicy,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "test-model",
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
    })
}

fn provider(server: &MockServer) -> NvidiaProvider {
    NvidiaProvider::new(
        "test-model".into(),
        "test-key".into(),
        Some(format!("{}/v1/chat/completions", server.uri())),
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(200),
        multiplier: 2.0,
        max_delay: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn two_gateway_timeouts_then_success() {
    let server = MockServer::start().await;

    // Two 504s, then the real reply.  Earlier-mounted mocks win until
    // their quota is spent.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(504).set_body_string("gateway timeout"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
        .mount(&server)
        .await;

    let p = provider(&server);
    let messages = vec![ChatMessage::new("user", "hello")];
    let started = Instant::now();
    let reply = fast_retry()
        .chat(&p, &messages, &ChatOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(reply.content, "recovered");

    // One initial call plus two retries reached the server.
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    // Backoff delays: ~200 ms + ~400 ms, each with ±20% jitter.
    assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?} too fast");
    assert!(elapsed < Duration::from_millis(1500), "elapsed {elapsed:?} too slow");
}

#[tokio::test]
async fn client_error_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let p = provider(&server);
    let messages = vec![ChatMessage::new("user", "hello")];
    let err = fast_retry()
        .chat(&p, &messages, &ChatOptions::default())
        .await
        .unwrap_err();

    assert!(err.downcast_ref::<LmFailure>().is_some());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn persistent_gateway_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let p = provider(&server);
    let policy = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(50),
        multiplier: 2.0,
        max_delay: Duration::from_secs(1),
    };
    let messages = vec![ChatMessage::new("user", "hello")];
    let err = policy
        .chat(&p, &messages, &ChatOptions::default())
        .await
        .unwrap_err();

    assert!(err.downcast_ref::<LmFailure>().is_some());
    // Initial attempt + 2 retries.
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn reasoning_spans_are_stripped_from_replies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "<think>the user greeted me</think>Hello there!",
        )))
        .mount(&server)
        .await;

    let p = provider(&server);
    let messages = vec![ChatMessage::new("user", "hi")];
    let reply = fast_retry()
        .chat(&p, &messages, &ChatOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.content, "Hello there!");
}
