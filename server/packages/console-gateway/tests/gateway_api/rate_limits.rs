use super::*;

fn one_per_minute() -> RateLimit {
    RateLimit {
        max_requests: 1,
        window: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn chat_limit_rejects_before_reaching_provider() {
    let test_app = TestApp::with_config(|config| {
        config.chat_rate_limit = one_per_minute();
    });
    let auth = test_app.bearer(ALLOWED);
    let headers = [("authorization", auth.as_str())];

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({ "prompt": "first" })),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(test_app.chat_calls(), 1);

    let (status, response_headers, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat/stream",
        Some(json!({ "prompt": "second" })),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response_headers[header::RETRY_AFTER]
        .to_str()
        .expect("ascii")
        .parse()
        .expect("seconds");
    assert!((1..=60).contains(&retry_after));
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:console-gateway:error:rate_limited");
    assert_eq!(problem["capability"], "chat");
    assert_eq!(test_app.chat_calls(), 1);
}

#[tokio::test]
async fn limits_are_per_identity_and_capability() {
    let test_app = TestApp::with_config(|config| {
        config.chat_rate_limit = one_per_minute();
        config.terminal_rate_limit = one_per_minute();
    });
    let ada = test_app.bearer(ALLOWED);
    let grace = test_app.bearer("grace@example.com");

    for auth in [&ada, &grace] {
        let (status, _, _) = send_request(
            &test_app.app,
            Method::POST,
            "/v1/chat",
            Some(json!({ "prompt": "hi" })),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // Terminal budget is separate from chat; an empty command still spends it.
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/terminal/exec",
        Some(json!({ "command": "" })),
        &[("authorization", ada.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/terminal/exec",
        Some(json!({ "command": "touch limited-marker" })),
        &[("authorization", ada.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(!test_app.root.path().join("limited-marker").exists());
}

#[tokio::test]
async fn file_access_is_not_limited() {
    let test_app = TestApp::with_config(|config| {
        config.chat_rate_limit = one_per_minute();
        config.terminal_rate_limit = one_per_minute();
    });
    let auth = test_app.bearer(ALLOWED);
    for _ in 0..10 {
        let (status, _, _) = send_request(
            &test_app.app,
            Method::GET,
            "/v1/files",
            None,
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
