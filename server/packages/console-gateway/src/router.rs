use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Redirect, Response, Sse};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use console_gateway_error::{ErrorType, GatewayError, ProblemDetails};

use crate::chat::{ChatProxy, ChatRequest, ChatResponse, ModelInfo};
use crate::config::{ConfigError, GatewayConfig};
use crate::filesystem::{FileEntry, FileStore};
use crate::identity::{AllowList, Identity, IdentityProvider, IdentityVerifier};
use crate::rate_limit::{Capability, RateLimiter};
use crate::session::{extract_token, SessionIssuer, VerifiedSession};
use crate::stream::{ChunkPayload, MultiplexedStream, Multiplexer, StreamEnd, StreamEvent};
use crate::terminal::{CommandExecutor, ExecRequest, ExecResponse};

mod support;
mod types;

use self::support::*;
pub use self::types::*;

const PROBLEM_JSON: &str = "application/problem+json";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;
const SERVER_INFO: &str = "This is a Console Gateway server. Sign in at /auth/google; \
authenticated clients use the /v1 API for files, chat and terminal access.";

/// Everything a request handler may touch, built once at startup.
#[derive(Debug)]
pub struct AppState {
    config: GatewayConfig,
    sessions: SessionIssuer,
    identity: IdentityVerifier,
    rate_limiter: RateLimiter,
    files: FileStore,
    chat: ChatProxy,
    executor: CommandExecutor,
    multiplexer: Multiplexer,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        identity_provider: Arc<dyn IdentityProvider>,
        chat: ChatProxy,
    ) -> Result<Self, ConfigError> {
        let files = FileStore::open(&config.file_root)?;
        let identity = IdentityVerifier::new(
            identity_provider,
            AllowList::new(&config.allowed_emails),
        );
        Ok(Self {
            sessions: SessionIssuer::from_config(&config),
            rate_limiter: RateLimiter::from_config(&config),
            executor: CommandExecutor::from_config(&config),
            multiplexer: Multiplexer::new(config.stream_buffer),
            identity,
            files,
            chat,
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionIssuer {
        &self.sessions
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let chat_router = Router::new()
        .route("/v1/chat", post(post_chat))
        .route("/v1/chat/stream", post(post_chat_stream))
        .route_layer(axum::middleware::from_fn_with_state(
            (shared.clone(), Capability::Chat),
            enforce_rate_limit,
        ));

    let terminal_router = Router::new()
        .route("/v1/terminal/exec", post(post_exec))
        .route("/v1/terminal/exec/stream", post(post_exec_stream))
        .route_layer(axum::middleware::from_fn_with_state(
            (shared.clone(), Capability::Terminal),
            enforce_rate_limit,
        ));

    let privileged_router = Router::new()
        .route("/v1/session", get(get_session))
        .route("/v1/files", get(list_files).delete(delete_file))
        .route(
            "/v1/files/content",
            get(read_file)
                .put(write_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/v1/files/mkdir", post(make_directory))
        .route("/v1/chat/models", get(list_models))
        .merge(chat_router)
        .merge(terminal_router)
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_session,
        ));

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/v1/health", get(get_health))
        .route("/auth/google", get(login))
        .route("/auth/google/callback", get(login_callback))
        .route("/auth/logout", post(logout))
        .merge(privileged_router)
        .fallback(not_found)
        .with_state(shared.clone());

    if http_logging_enabled() {
        let include_headers = std::env::var("CONSOLE_GATEWAY_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let headers: Vec<(String, String)> = req
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (name.to_string(), loggable_header(name.as_str(), value))
                        })
                        .collect();
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri().path(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri().path()
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_session,
        list_files,
        read_file,
        write_file,
        delete_file,
        make_directory,
        list_models,
        post_chat,
        post_chat_stream,
        post_exec,
        post_exec_stream
    ),
    components(
        schemas(
            HealthResponse,
            SessionResponse,
            FileListResponse,
            FileEntry,
            MkdirRequest,
            ModelsResponse,
            ModelInfo,
            crate::chat::Provider,
            crate::chat::Role,
            crate::chat::ChatMessage,
            ChatRequest,
            ChatResponse,
            ExecRequest,
            ExecResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "session", description = "Login session"),
        (name = "files", description = "File store"),
        (name = "chat", description = "AI chat proxy"),
        (name = "terminal", description = "Shell command execution")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new(
            crate::config::DEFAULT_BASE_URL,
        )]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Gateway(err) = self;
        let problem = err.to_problem_details();
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        let mut response = (
            status,
            [(header::CONTENT_TYPE, PROBLEM_JSON)],
            Json(problem),
        )
            .into_response();
        if let Some(retry_after) = err.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

async fn get_root() -> &'static str {
    SERVER_INFO
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_streams: state.multiplexer.active_streams(),
    })
}

async fn login(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::to(&state.identity.authorize_url())
}

async fn login_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = query.error {
        return Err(GatewayError::AuthProviderError { message: error }.into());
    }
    let code = query.code.unwrap_or_default();
    let identity = state.identity.verify(&code).await?;
    let issued = state.sessions.issue(&identity)?;
    let cookie = state.sessions.cookie(&issued)?;
    tracing::info!(email = %identity.email, "session issued");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Redirect::to(&state.config.base_path_url()),
    )
        .into_response())
}

/// Deletes the cookie. The token itself stays valid until it expires.
async fn logout(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let cookie = state.sessions.clear_cookie()?;
    Ok((
        [(header::SET_COOKIE, cookie)],
        Redirect::to(&state.config.base_path_url()),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/v1/session",
    responses(
        (status = 200, body = SessionResponse),
        (status = 401, body = ProblemDetails)
    ),
    tag = "session"
)]
async fn get_session(Extension(session): Extension<VerifiedSession>) -> Json<SessionResponse> {
    Json(SessionResponse {
        email: session.identity.email.clone(),
        verified_at: format_time(session.identity.verified_at),
        issued_at: format_time(session.issued_at),
        expires_at: format_time(session.expires_at),
    })
}

#[utoipa::path(
    get,
    path = "/v1/files",
    params(("path" = Option<String>, Query, description = "Directory relative to the file root")),
    responses(
        (status = 200, body = FileListResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilePathQuery>,
) -> Result<Json<FileListResponse>, ApiError> {
    let entries = state.files.list(query.path()).await?;
    Ok(Json(FileListResponse {
        path: query.path().to_string(),
        entries,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/files/content",
    params(("path" = String, Query, description = "File relative to the file root")),
    responses(
        (status = 200, description = "Raw file bytes"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn read_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilePathQuery>,
) -> Result<Response, ApiError> {
    let content = state.files.read(query.path()).await?;
    Ok(([(header::CONTENT_TYPE, content.mime)], content.bytes).into_response())
}

#[utoipa::path(
    put,
    path = "/v1/files/content",
    params(("path" = String, Query, description = "File relative to the file root")),
    request_body(content = Vec<u8>, description = "Raw file bytes", content_type = "application/octet-stream"),
    responses(
        (status = 200, body = FileEntry),
        (status = 400, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn write_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilePathQuery>,
    body: Bytes,
) -> Result<Json<FileEntry>, ApiError> {
    Ok(Json(state.files.write(query.path(), &body).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/files",
    params(("path" = String, Query, description = "File or directory relative to the file root")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn delete_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilePathQuery>,
) -> Result<StatusCode, ApiError> {
    state.files.delete(query.path()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/files/mkdir",
    request_body = MkdirRequest,
    responses(
        (status = 200, body = FileEntry),
        (status = 400, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn make_directory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MkdirRequest>,
) -> Result<Json<FileEntry>, ApiError> {
    Ok(Json(state.files.mkdir(&request.path).await?))
}

#[utoipa::path(
    get,
    path = "/v1/chat/models",
    responses((status = 200, body = ModelsResponse)),
    tag = "chat"
)]
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.chat.models();
    let default_model = state
        .chat
        .resolve_model(None)
        .ok()
        .map(|model| model.key().to_string());
    Json(ModelsResponse {
        models,
        default_model,
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, body = ChatResponse),
        (status = 400, body = ProblemDetails),
        (status = 429, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let exchange = state.chat.prepare(request)?;
    let label = exchange.model().label();
    tracing::info!(email = %identity.email, model = exchange.model().key(), "chat request");
    let collected = state
        .multiplexer
        .spawn(Box::new(exchange))
        .collect_output()
        .await;
    match collected.end {
        StreamEnd::Failed(err) => Err(err.into()),
        _ => Ok(Json(ChatResponse {
            reply: collected.output,
            model: label.to_string(),
        })),
    }
}

#[utoipa::path(
    post,
    path = "/v1/chat/stream",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of chunk events and one end event"),
        (status = 400, body = ProblemDetails),
        (status = 429, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat_stream(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let exchange = state.chat.prepare(request)?;
    tracing::info!(email = %identity.email, model = exchange.model().key(), "chat stream");
    Ok(sse_response(state.multiplexer.spawn(Box::new(exchange))))
}

async fn start_command(
    state: &AppState,
    identity: &Identity,
    request: ExecRequest,
) -> Result<MultiplexedStream, ApiError> {
    let cwd = state
        .files
        .resolve_directory(request.cwd.as_deref().unwrap_or(""))
        .await?;
    let execution = state.executor.prepare(&request.command, cwd)?;
    tracing::info!(email = %identity.email, command = %request.command, "terminal command");
    Ok(state.multiplexer.spawn(Box::new(execution)))
}

#[utoipa::path(
    post,
    path = "/v1/terminal/exec",
    request_body = ExecRequest,
    responses(
        (status = 200, body = ExecResponse),
        (status = 400, body = ProblemDetails),
        (status = 403, body = ProblemDetails),
        (status = 429, body = ProblemDetails)
    ),
    tag = "terminal"
)]
async fn post_exec(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    let collected = start_command(&state, &identity, request)
        .await?
        .collect_output()
        .await;
    Ok(Json(ExecResponse {
        output: collected.output,
        status: collected.end.status().to_string(),
        exit_code: collected.end.exit_code(),
        error: collected.end.error().map(|err| err.to_problem_details()),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/terminal/exec/stream",
    request_body = ExecRequest,
    responses(
        (status = 200, description = "SSE stream of chunk events and one end event"),
        (status = 400, body = ProblemDetails),
        (status = 403, body = ProblemDetails),
        (status = 429, body = ProblemDetails)
    ),
    tag = "terminal"
)]
async fn post_exec_stream(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<ExecRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = start_command(&state, &identity, request).await?;
    Ok(sse_response(stream))
}
