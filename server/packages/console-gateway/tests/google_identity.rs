use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use console_gateway::config::OAuthClientConfig;
use console_gateway::identity::{AllowList, GoogleIdentityProvider, IdentityVerifier};
use console_gateway_error::GatewayError;
use serde_json::json;

const REDIRECT_URI: &str = "http://localhost:8080/auth/google/callback";

async fn token(Form(form): Form<HashMap<String, String>>) -> impl IntoResponse {
    let authorized = form.get("grant_type").map(String::as_str) == Some("authorization_code")
        && form.get("client_id").map(String::as_str) == Some("client")
        && form.get("client_secret").map(String::as_str) == Some("secret")
        && form.get("redirect_uri").map(String::as_str) == Some(REDIRECT_URI);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_client" })),
        );
    }
    match form.get("code").map(String::as_str) {
        Some("ada-code") => (StatusCode::OK, Json(json!({ "access_token": "ada-token" }))),
        Some("unverified-code") => (
            StatusCode::OK,
            Json(json!({ "access_token": "unverified-token" })),
        ),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "Bad Request" })),
        ),
    }
}

async fn userinfo(headers: HeaderMap) -> impl IntoResponse {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    match bearer {
        "Bearer ada-token" => (
            StatusCode::OK,
            Json(json!({ "email": "ada@example.com", "email_verified": true, "name": "Ada" })),
        ),
        "Bearer unverified-token" => (
            StatusCode::OK,
            Json(json!({ "email": "ada@example.com", "email_verified": false })),
        ),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_token" }))),
    }
}

async fn serve_provider() -> String {
    let app = Router::new()
        .route("/token", post(token))
        .route("/userinfo", get(userinfo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind provider");
    let address = listener.local_addr().expect("provider address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{address}")
}

async fn verifier(allowed: &[&str]) -> IdentityVerifier {
    let base = serve_provider().await;
    let mut config = OAuthClientConfig::google("client", "secret");
    config.token_url = format!("{base}/token");
    config.userinfo_url = format!("{base}/userinfo");
    let provider =
        GoogleIdentityProvider::new(config, REDIRECT_URI.to_string()).expect("build provider");
    IdentityVerifier::new(Arc::new(provider), AllowList::new(allowed))
}

#[tokio::test]
async fn code_exchange_resolves_email() {
    let verifier = verifier(&["ada@example.com"]).await;
    let identity = verifier.verify("ada-code").await.expect("verified");
    assert_eq!(identity.email, "ada@example.com");
}

#[tokio::test]
async fn rejected_code_is_provider_error() {
    let verifier = verifier(&[]).await;
    let err = verifier.verify("stale-code").await.expect_err("rejected");
    assert!(
        matches!(&err, GatewayError::AuthProviderError { message } if message == "Bad Request"),
        "{err:?}"
    );
}

#[tokio::test]
async fn unverified_email_is_refused() {
    let verifier = verifier(&[]).await;
    let err = verifier.verify("unverified-code").await.expect_err("rejected");
    assert!(matches!(err, GatewayError::AuthProviderError { .. }), "{err:?}");
}

#[tokio::test]
async fn allow_list_applies_after_exchange() {
    let verifier = verifier(&["grace@example.com"]).await;
    let err = verifier.verify("ada-code").await.expect_err("not allowed");
    assert!(
        matches!(&err, GatewayError::NotAllowed { email } if email == "ada@example.com"),
        "{err:?}"
    );
}
