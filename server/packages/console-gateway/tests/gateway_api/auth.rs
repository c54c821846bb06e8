use super::*;

#[tokio::test]
async fn health_and_root_are_public() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let health = parse_json(&body);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["activeStreams"], 0);

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("Console Gateway"));
}

#[tokio::test]
async fn unknown_route_is_problem_json() {
    let test_app = TestApp::new();
    let (status, headers, body) =
        send_request(&test_app.app, Method::GET, "/v1/nope", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(problem_type(&body), "urn:console-gateway:error:not_found");
}

#[tokio::test]
async fn privileged_routes_require_a_session() {
    let test_app = TestApp::new();

    for (method, uri, body) in [
        (Method::GET, "/v1/session", None),
        (Method::GET, "/v1/files", None),
        (Method::GET, "/v1/chat/models", None),
        (Method::POST, "/v1/chat", Some(json!({ "prompt": "hi" }))),
        (
            Method::POST,
            "/v1/terminal/exec",
            Some(json!({ "command": "echo hi" })),
        ),
    ] {
        let (status, headers, response) =
            send_request(&test_app.app, method, uri, body, &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
        assert_eq!(
            problem_type(&response),
            "urn:console-gateway:error:unauthorized"
        );
    }
    assert_eq!(test_app.chat_calls(), 0);
}

#[tokio::test]
async fn unauthenticated_write_has_no_side_effects() {
    let test_app = TestApp::new();
    let (status, _, _) = send_request_raw(
        &test_app.app,
        Method::PUT,
        "/v1/files/content?path=planted.txt",
        b"payload".to_vec(),
        &[("authorization", "Bearer not-a-token")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(!test_app.root.path().join("planted.txt").exists());
}

#[tokio::test]
async fn forged_and_expired_tokens_are_rejected() {
    let test_app = TestApp::new();

    let other_app = TestApp::with_config(|config| {
        config.signing_secret = "a-completely-different-secret-0123456789".to_string();
    });
    let forged = other_app.bearer(ALLOWED);
    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/session",
        None,
        &[("authorization", forged.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let long_ago = OffsetDateTime::now_utc() - time::Duration::days(2);
    let expired = test_app
        .state
        .sessions()
        .issue_at(&Identity::new(ALLOWED.to_string(), long_ago), long_ago)
        .expect("issue expired session");
    let header_value = format!("Bearer {}", expired.token);
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/session",
        None,
        &[("authorization", header_value.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(parse_json(&body)["reason"], "session expired");
}

#[tokio::test]
async fn login_redirects_to_provider() {
    let test_app = TestApp::new();
    let (status, headers, _) =
        send_request(&test_app.app, Method::GET, "/auth/google", None, &[]).await;
    assert!(status.is_redirection());
    assert_eq!(
        headers[header::LOCATION],
        "https://accounts.test/o/oauth2/auth?client_id=client"
    );
}

#[tokio::test]
async fn callback_sets_session_cookie() {
    let test_app = TestApp::new();
    let (status, headers, _) = send_request(
        &test_app.app,
        Method::GET,
        "/auth/google/callback?code=ada-code",
        None,
        &[],
    )
    .await;
    assert!(status.is_redirection());
    let set_cookie = headers[header::SET_COOKIE].to_str().expect("ascii cookie");
    assert!(set_cookie.starts_with("session_token="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));

    let cookie = cookie_pair(&headers);
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/session",
        None,
        &[("cookie", cookie.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session = parse_json(&body);
    assert_eq!(session["email"], "Ada@Example.com");
    assert!(session["expiresAt"].is_string());
}

#[tokio::test]
async fn callback_rejects_accounts_outside_allow_list() {
    let test_app = TestApp::new();
    let (status, headers, body) = send_request(
        &test_app.app,
        Method::GET,
        "/auth/google/callback?code=eve-code",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(headers.get(header::SET_COOKIE).is_none());
    assert_eq!(problem_type(&body), "urn:console-gateway:error:not_allowed");
}

#[tokio::test]
async fn callback_surfaces_provider_failures() {
    let test_app = TestApp::new();
    for uri in [
        "/auth/google/callback?code=bogus",
        "/auth/google/callback?error=access_denied",
        "/auth/google/callback?code=unverified-code",
        "/auth/google/callback",
    ] {
        let (status, headers, body) =
            send_request(&test_app.app, Method::GET, uri, None, &[]).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY, "{uri}");
        assert!(headers.get(header::SET_COOKIE).is_none());
        assert_eq!(
            problem_type(&body),
            "urn:console-gateway:error:auth_provider_error"
        );
    }
}

#[tokio::test]
async fn logout_clears_cookie() {
    let test_app = TestApp::new();
    let (status, headers, _) =
        send_request(&test_app.app, Method::POST, "/auth/logout", None, &[]).await;
    assert!(status.is_redirection());
    let set_cookie = headers[header::SET_COOKIE].to_str().expect("ascii cookie");
    assert!(set_cookie.starts_with("session_token=;"));
    assert!(set_cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn aging_session_is_refreshed() {
    let test_app = TestApp::new();
    let now = OffsetDateTime::now_utc();

    let fresh = test_app.bearer(ALLOWED);
    let (status, headers, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/session",
        None,
        &[("authorization", fresh.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::SET_COOKIE).is_none());

    let earlier = now - time::Duration::hours(5);
    let aging = test_app
        .state
        .sessions()
        .issue_at(&Identity::new(ALLOWED.to_string(), earlier), earlier)
        .expect("issue aging session");
    let header_value = format!("Bearer {}", aging.token);
    let (status, headers, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/session",
        None,
        &[("authorization", header_value.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let refreshed = cookie_pair(&headers);
    let token = refreshed
        .strip_prefix("session_token=")
        .expect("session cookie");
    let session = test_app.state.sessions().verify(token).expect("valid token");
    assert!(session.expires_at > aging.expires_at);
}
