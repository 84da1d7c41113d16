//! Integration tests for the Compass API.
//!
//! Each test builds its own router over an in-memory database and a
//! scripted model backend, then drives it with `oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use compass_api::handlers::{HealthResponse, TurnsResponse};
use compass_api::{create_router, AppState, TokenTable};
use compass_chat::{ChatPipeline, ScriptedBackend};
use compass_core::config::CompassConfig;
use compass_core::types::{Role, UserId};
use compass_core::wire::WireFrame;
use compass_insight::{DeadLetterLog, RefreshQueue, RefreshReceiver, SynthesisCache};
use compass_storage::Database;

// =============================================================================
// Helpers
// =============================================================================

const TEST_TOKEN: &str = "test-token-12345";
const OTHER_TOKEN: &str = "other-token-67890";

struct TestApp {
    router: axum::Router,
    _receiver: RefreshReceiver,
}

fn make_app(backend: ScriptedBackend) -> TestApp {
    let config = CompassConfig::default();
    let db = Arc::new(Database::in_memory().unwrap());
    let (queue, receiver) = RefreshQueue::channel();
    let cache = Arc::new(SynthesisCache::new(
        Arc::clone(&db),
        &config.synthesis,
        queue.clone(),
    ));
    let pipeline = ChatPipeline::new(db, cache, queue.clone(), Arc::new(backend), &config);

    let mut tokens = TokenTable::default();
    tokens.insert(TEST_TOKEN, UserId::new("user-1"));
    tokens.insert(OTHER_TOKEN, UserId::new("user-2"));

    let state = AppState::new(config, pipeline, Arc::new(tokens), queue, DeadLetterLog::new());
    TestApp {
        router: create_router(state),
        _receiver: receiver,
    }
}

fn promotion_backend() -> ScriptedBackend {
    ScriptedBackend::new([
        "That sounds ",
        "exhausting. ",
        "[MEM",
        "ORY: promotion ",
        "case]",
    ])
}

fn chat_request(token: &str, body: Value) -> Request<Body> {
    Request::post("/chat/stream")
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_get(token: &str, uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Parse every `data:` line of an SSE body into a frame.
fn frames(body: &[u8]) -> Vec<WireFrame> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}

fn token_text(frames: &[WireFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            WireFrame::Token { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Health / auth
// =============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.backend, "scripted");
    assert_eq!(health.dead_letters, 0);
}

#[tokio::test]
async fn test_chat_stream_requires_auth() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(
            Request::post("/chat/stream")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"userMessage": "hi", "conversationId": Uuid::new_v4()}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(authed_get("not-a-token", &format!("/conversations/{}/turns", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Chat stream
// =============================================================================

#[tokio::test]
async fn test_promotion_case_stream() {
    let app = make_app(promotion_backend());
    let conversation_id = Uuid::new_v4();
    let resp = app
        .router
        .clone()
        .oneshot(chat_request(
            TEST_TOKEN,
            json!({
                "userMessage": "I've been stuck on my promotion case for weeks",
                "conversationId": conversation_id,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let frames = frames(&body_bytes(resp).await);
    assert_eq!(
        token_text(&frames),
        "That sounds exhausting. [MEMORY: promotion case]"
    );

    let signals: Vec<_> = frames.iter().filter_map(WireFrame::signal_tag).collect();
    assert_eq!(signals.len(), 1);

    let last = frames.last().unwrap();
    assert!(matches!(last, WireFrame::Done { .. }));
    let flags = last.flags().unwrap();
    assert!(flags.memory);
    assert!(!flags.pattern);
    assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);

    // The stored assistant turn has the marker stripped.
    let resp = app
        .router
        .oneshot(authed_get(
            TEST_TOKEN,
            &format!("/conversations/{}/turns", conversation_id),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let history: TurnsResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(history.turns.len(), 2);
    assert_eq!(history.turns[0].role, Role::User);
    assert_eq!(history.turns[1].role, Role::Assistant);
    assert_eq!(history.turns[1].text, "That sounds exhausting.");
    if let WireFrame::Done { message_id, .. } = last {
        assert_eq!(*message_id, history.turns[1].id);
    }
}

#[tokio::test]
async fn test_empty_message_is_bad_request() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(chat_request(
            TEST_TOKEN,
            json!({"userMessage": "   ", "conversationId": Uuid::new_v4()}),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_snake_case_body_is_bad_request() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(chat_request(
            TEST_TOKEN,
            json!({"user_message": "hello", "conversation_id": Uuid::new_v4()}),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_other_users_conversation_is_not_found() {
    let app = make_app(promotion_backend());
    let conversation_id = Uuid::new_v4();
    let resp = app
        .router
        .clone()
        .oneshot(chat_request(
            TEST_TOKEN,
            json!({"userMessage": "hello", "conversationId": conversation_id}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let _ = body_bytes(resp).await;

    let resp = app
        .router
        .clone()
        .oneshot(chat_request(
            OTHER_TOKEN,
            json!({"userMessage": "hello", "conversationId": conversation_id}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .router
        .oneshot(authed_get(
            OTHER_TOKEN,
            &format!("/conversations/{}/turns", conversation_id),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_model_failure_is_warm_retryable_frame() {
    let app = make_app(ScriptedBackend::failing_on_start());
    let conversation_id = Uuid::new_v4();
    let resp = app
        .router
        .clone()
        .oneshot(chat_request(
            TEST_TOKEN,
            json!({"userMessage": "hello there", "conversationId": conversation_id}),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let frames = frames(&body_bytes(resp).await);
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        WireFrame::Error { message, retryable } => {
            assert!(*retryable);
            assert!(message.starts_with("I'm sorry"));
        }
        other => panic!("unexpected frame {:?}", other),
    }

    // Only the user turn was persisted.
    let resp = app
        .router
        .oneshot(authed_get(
            TEST_TOKEN,
            &format!("/conversations/{}/turns", conversation_id),
        ))
        .await
        .unwrap();
    let history: TurnsResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(history.turns.len(), 1);
    assert_eq!(history.turns[0].role, Role::User);
}

#[tokio::test]
async fn test_retry_after_interruption_reuses_user_turn() {
    let app = make_app(promotion_backend().failing_after(2));
    let conversation_id = Uuid::new_v4();
    let body = json!({"userMessage": "Can we talk about work?", "conversationId": conversation_id});

    for _ in 0..2 {
        let resp = app
            .router
            .clone()
            .oneshot(chat_request(TEST_TOKEN, body.clone()))
            .await
            .unwrap();
        let frames = frames(&body_bytes(resp).await);
        assert!(matches!(frames.last(), Some(WireFrame::Error { retryable: true, .. })));
    }

    let resp = app
        .router
        .oneshot(authed_get(
            TEST_TOKEN,
            &format!("/conversations/{}/turns", conversation_id),
        ))
        .await
        .unwrap();
    let history: TurnsResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(history.turns.len(), 1);
}

// =============================================================================
// Turns
// =============================================================================

#[tokio::test]
async fn test_turns_of_unknown_conversation_is_not_found() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(authed_get(
            TEST_TOKEN,
            &format!("/conversations/{}/turns", Uuid::new_v4()),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_turns_rejects_malformed_id() {
    let app = make_app(promotion_backend());
    let resp = app
        .router
        .oneshot(authed_get(TEST_TOKEN, "/conversations/not-a-uuid/turns"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
