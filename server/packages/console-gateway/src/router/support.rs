use super::*;

use time::format_description::well_known::Rfc3339;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub(super) async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: ErrorType::NotFound.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    };

    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, PROBLEM_JSON)],
        Json(problem),
    )
        .into_response()
}

/// Verifies the session token and exposes the identity to handlers. Nothing
/// behind this layer runs for an unauthenticated request.
pub(super) async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = extract_token(request.headers()) else {
        return Err(GatewayError::Unauthorized {
            message: Some("missing session".to_string()),
        }
        .into());
    };
    let session = state.sessions.verify(&token).map_err(|err| {
        let reason = match err {
            GatewayError::InvalidSession { message } => message,
            other => other.to_string(),
        };
        tracing::debug!(reason = %reason, "session rejected");
        GatewayError::Unauthorized {
            message: Some(reason),
        }
    })?;

    let refresh = session.needs_refresh(OffsetDateTime::now_utc());
    let identity = session.identity.clone();
    request.extensions_mut().insert(identity.clone());
    request.extensions_mut().insert(session);

    let mut response = next.run(request).await;
    if refresh {
        match state
            .sessions
            .issue(&identity)
            .and_then(|issued| state.sessions.cookie(&issued))
        {
            Ok(cookie) => {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            Err(err) => tracing::warn!(error = %err, "failed to refresh session"),
        }
    }
    Ok(response)
}

/// Charges one request against the caller's budget for a capability.
pub(super) async fn enforce_rate_limit(
    State((state, capability)): State<(Arc<AppState>, Capability)>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(identity) = request.extensions().get::<Identity>() else {
        return Err(GatewayError::Unauthorized { message: None }.into());
    };
    state.rate_limiter.check(&identity.email, capability)?;
    Ok(next.run(request).await)
}

pub(super) fn sse_response(
    stream: MultiplexedStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream.map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match event {
        StreamEvent::Chunk(text) => Event::default()
            .event("chunk")
            .json_data(ChunkPayload { text })
            .unwrap_or_else(|err| {
                tracing::error!(error = %err, "failed to encode chunk event");
                Event::default().event("chunk").data(text)
            }),
        StreamEvent::End(end) => Event::default()
            .event("end")
            .json_data(end.payload())
            .unwrap_or_else(|err| {
                tracing::error!(error = %err, "failed to encode end event");
                Event::default()
                    .event("end")
                    .data(format!("{{\"status\":\"{}\"}}", end.status()))
            }),
    }
}

pub(super) fn format_time(time: OffsetDateTime) -> String {
    time.format(&Rfc3339).unwrap_or_else(|_| time.unix_timestamp().to_string())
}

pub(super) fn http_logging_enabled() -> bool {
    !matches!(
        std::env::var("CONSOLE_GATEWAY_LOG_HTTP"),
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false")
    )
}

/// Header value safe to write to logs.
pub(super) fn loggable_header(name: &str, value: &HeaderValue) -> String {
    if name.eq_ignore_ascii_case("authorization")
        || name.eq_ignore_ascii_case("cookie")
        || name.eq_ignore_ascii_case("set-cookie")
    {
        "<redacted>".to_string()
    } else {
        value.to_str().unwrap_or("<binary>").to_string()
    }
}
