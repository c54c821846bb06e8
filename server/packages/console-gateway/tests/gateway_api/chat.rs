use super::*;

#[tokio::test]
async fn models_list_configured_providers() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/chat/models",
        None,
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let models = parse_json(&body);
    assert_eq!(models["defaultModel"], "claude");
    let keys: Vec<&str> = models["models"]
        .as_array()
        .expect("models")
        .iter()
        .filter_map(|model| model["key"].as_str())
        .collect();
    assert_eq!(keys, ["claude", "claude-opus"]);
}

#[tokio::test]
async fn collected_chat_returns_full_reply() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({ "prompt": "say hello" })),
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["reply"], "Hello, world");
    assert_eq!(test_app.chat_calls(), 1);
}

#[tokio::test]
async fn streamed_chat_emits_chunks_then_end() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    let (status, headers, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat/stream",
        Some(json!({
            "model": "claude",
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" }
            ],
            "prompt": "again"
        })),
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/event-stream"));
    let events = parse_sse(&body);
    assert_eq!(chunk_text(&events), "Hello, world");
    assert_eq!(end_event(&events)["status"], "completed");
}

#[tokio::test]
async fn unknown_and_unconfigured_models_are_rejected() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    for model in ["llama", "gpt"] {
        let (status, _, body) = send_request(
            &test_app.app,
            Method::POST,
            "/v1/chat/stream",
            Some(json!({ "model": model, "prompt": "hi" })),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{model}");
        let problem = parse_json(&body);
        assert_eq!(problem["type"], "urn:console-gateway:error:unknown_model");
        assert_eq!(problem["model"], model);
    }
    assert_eq!(test_app.chat_calls(), 0);
}

#[tokio::test]
async fn empty_conversation_is_invalid() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({ "prompt": "   " })),
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        problem_type(&body),
        "urn:console-gateway:error:invalid_request"
    );
}

#[tokio::test]
async fn upstream_failure_ends_stream_with_error() {
    let test_app = TestApp::with_chat(
        vec![
            Ok("partial".to_string()),
            Err(GatewayError::ProviderError {
                provider: "anthropic".to_string(),
                message: "overloaded".to_string(),
            }),
        ],
        |_| {},
    );
    let auth = test_app.bearer(ALLOWED);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat/stream",
        Some(json!({ "prompt": "hi" })),
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    assert_eq!(chunk_text(&events), "partial");
    let end = end_event(&events);
    assert_eq!(end["status"], "failed");
    assert_eq!(
        end["error"]["type"],
        "urn:console-gateway:error:provider_error"
    );

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({ "prompt": "hi" })),
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        problem_type(&body),
        "urn:console-gateway:error:provider_error"
    );
}
