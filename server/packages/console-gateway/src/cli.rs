use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use console_gateway_error::GatewayError;

use crate::chat::sse::{SseAccumulator, SseFrame};
use crate::chat::{ChatProxy, ChatRequest};
use crate::config::{
    default_file_root, parse_base_url, ChatProvidersConfig, ConfigError, GatewayConfig,
    OAuthClientConfig, ProviderCredentials, RateLimit, DEFAULT_BASE_URL,
    DEFAULT_BLOCKED_PATTERNS, DEFAULT_CHAT_MAX_TOKENS, DEFAULT_CHAT_TIMEOUT,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_OUTPUT_CAP_BYTES, DEFAULT_SESSION_TTL,
    DEFAULT_STREAM_BUFFER, DEFAULT_SYSTEM_PROMPT,
};
use crate::identity::{AllowList, GoogleIdentityProvider, Identity};
use crate::router::{build_router_with_state, ApiDoc, AppState, MkdirRequest};
use crate::session::SessionIssuer;
use crate::terminal::ExecRequest;

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "console-gateway", bin_name = "console-gateway")]
#[command(about = "Self-hosted console gateway", version = env!("CARGO_PKG_VERSION"))]
#[command(arg_required_else_help = true)]
pub struct ConsoleGatewayCli {
    #[command(subcommand)]
    command: Command,

    /// Session token used by `api` commands.
    #[arg(
        long,
        short = 't',
        global = true,
        env = "CONSOLE_GATEWAY_TOKEN",
        hide_env_values = true
    )]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Server(ServerArgs),
    /// Mint a session token for an email without going through OAuth.
    IssueToken(IssueTokenArgs),
    /// Print the OpenAPI document.
    Openapi,
    /// Call the HTTP API without writing client code.
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    #[command(flatten)]
    settings: GatewaySettings,
}

/// Deployment settings, each readable from the environment.
#[derive(Args, Debug)]
pub struct GatewaySettings {
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL.as_secs())]
    session_ttl_secs: u64,

    #[arg(long, env = "ALLOWED_EMAILS", value_delimiter = ',')]
    allowed_emails: Vec<String>,

    #[arg(long, env = "APP_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    google_client_id: Option<String>,

    #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true)]
    google_client_secret: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_BASE_URL", default_value = ChatProvidersConfig::ANTHROPIC_BASE_URL)]
    anthropic_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = ChatProvidersConfig::OPENAI_BASE_URL)]
    openai_base_url: String,

    #[arg(long, env = "FILE_ROOT")]
    file_root: Option<PathBuf>,

    #[arg(long, env = "CHAT_RATE_LIMIT", default_value_t = 30)]
    chat_rate_limit: u32,

    #[arg(long, env = "TERMINAL_RATE_LIMIT", default_value_t = 20)]
    terminal_rate_limit: u32,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    rate_limit_window_secs: u64,

    #[arg(long, env = "COMMAND_TIMEOUT_SECS", default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    command_timeout_secs: u64,

    #[arg(long, env = "COMMAND_OUTPUT_CAP_BYTES", default_value_t = DEFAULT_OUTPUT_CAP_BYTES)]
    command_output_cap_bytes: usize,

    #[arg(long, env = "BLOCKED_COMMAND_PATTERNS", value_delimiter = ',')]
    blocked_command_patterns: Option<Vec<String>>,

    #[arg(long, env = "CHAT_TIMEOUT_SECS", default_value_t = DEFAULT_CHAT_TIMEOUT.as_secs())]
    chat_timeout_secs: u64,

    #[arg(long, env = "CHAT_MAX_TOKENS", default_value_t = DEFAULT_CHAT_MAX_TOKENS)]
    chat_max_tokens: u32,

    #[arg(long, env = "CHAT_SYSTEM_PROMPT")]
    chat_system_prompt: Option<String>,

    #[arg(long, env = "STREAM_BUFFER", default_value_t = DEFAULT_STREAM_BUFFER)]
    stream_buffer: usize,
}

impl GatewaySettings {
    /// Builds and validates the runtime configuration.
    pub fn to_config(&self) -> Result<GatewayConfig, ConfigError> {
        let file_root = self.file_root.clone().unwrap_or_else(default_file_root);
        let mut config = GatewayConfig::new(self.secret_key.clone().unwrap_or_default(), file_root);
        config.base_url = parse_base_url(&self.base_url)?;
        config.session_ttl = Duration::from_secs(self.session_ttl_secs);
        config.allowed_emails = self
            .allowed_emails
            .iter()
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty())
            .collect();
        config.oauth = OAuthClientConfig::google(
            self.google_client_id.clone().unwrap_or_default(),
            self.google_client_secret.clone().unwrap_or_default(),
        );
        config.providers = ChatProvidersConfig {
            anthropic: credentials(&self.anthropic_api_key, &self.anthropic_base_url),
            openai: credentials(&self.openai_api_key, &self.openai_base_url),
        };
        let window = Duration::from_secs(self.rate_limit_window_secs);
        config.chat_rate_limit = RateLimit {
            max_requests: self.chat_rate_limit,
            window,
        };
        config.terminal_rate_limit = RateLimit {
            max_requests: self.terminal_rate_limit,
            window,
        };
        config.command_timeout = Duration::from_secs(self.command_timeout_secs);
        config.output_cap_bytes = self.command_output_cap_bytes;
        config.blocked_patterns = match &self.blocked_command_patterns {
            Some(patterns) => patterns
                .iter()
                .map(|pattern| pattern.trim().to_string())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
            None => DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
        };
        config.chat_timeout = Duration::from_secs(self.chat_timeout_secs);
        config.chat_max_tokens = self.chat_max_tokens;
        config.system_prompt = self
            .chat_system_prompt
            .clone()
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        config.stream_buffer = self.stream_buffer;
        config.validate()?;
        Ok(config)
    }
}

fn credentials(api_key: &Option<String>, base_url: &str) -> Option<ProviderCredentials> {
    api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| ProviderCredentials {
            api_key: key.to_string(),
            base_url: base_url.to_string(),
        })
}

#[derive(Args, Debug)]
pub struct IssueTokenArgs {
    email: String,

    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL.as_secs())]
    session_ttl_secs: u64,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Show the identity behind the current token.
    Whoami(ClientArgs),
    /// List the chat models this server can reach.
    Models(ClientArgs),
    /// Browse and modify the file store.
    Files(FilesArgs),
    /// Ask a model and stream the reply.
    Chat(ChatArgs),
    /// Run a shell command and stream its output.
    Exec(ExecArgs),
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, short = 'e', env = "CONSOLE_GATEWAY_ENDPOINT")]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct FilesArgs {
    #[command(subcommand)]
    command: FilesCommand,
}

#[derive(Subcommand, Debug)]
pub enum FilesCommand {
    /// List a directory.
    Ls(FilePathArgs),
    /// Print a file's contents.
    Cat(FilePathArgs),
    /// Upload a local file.
    Put(FilePutArgs),
    /// Delete a file or directory.
    Rm(FilePathArgs),
    /// Create a directory.
    Mkdir(FilePathArgs),
}

#[derive(Args, Debug)]
pub struct FilePathArgs {
    #[arg(default_value = "")]
    path: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct FilePutArgs {
    path: String,
    source: PathBuf,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    prompt: String,
    #[arg(long, short = 'm')]
    model: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    command: String,
    #[arg(long, short = 'd')]
    cwd: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("stream ended with status {0}")]
    StreamFailed(String),
}

pub fn run_console_gateway() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let cli = ConsoleGatewayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command, cli.token.as_deref())
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command, token: Option<&str>) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::IssueToken(args) => issue_token(args),
        Command::Openapi => write_stdout_line(&ApiDoc::openapi().to_pretty_json()?),
        Command::Api(subcommand) => run_api(&subcommand.command, token),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = server.settings.to_config()?;
    let identity = Arc::new(GoogleIdentityProvider::from_config(&config)?);
    let chat = ChatProxy::from_config(&config)?;
    let allow_list = AllowList::new(&config.allowed_emails);
    tracing::info!(
        file_root = %config.file_root.display(),
        allowed_emails = allow_list.len(),
        base_url = %config.base_url,
        "configuration loaded"
    );
    if allow_list.is_empty() {
        tracing::warn!("ALLOWED_EMAILS is empty; any verified account may sign in");
    }

    let state = Arc::new(AppState::new(config, identity, chat)?);
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn issue_token(args: &IssueTokenArgs) -> Result<(), CliError> {
    if args.secret_key.is_empty() {
        return Err(ConfigError::Missing("SECRET_KEY").into());
    }
    let issuer = SessionIssuer::new(
        args.secret_key.as_bytes(),
        Duration::from_secs(args.session_ttl_secs),
    );
    let issued = issuer.issue(&Identity::verified_now(args.email.trim()))?;
    tracing::info!(email = %args.email.trim(), expires_at = %issued.expires_at, "token issued");
    write_stdout_line(&issued.token)
}

fn run_api(command: &ApiCommand, token: Option<&str>) -> Result<(), CliError> {
    match command {
        ApiCommand::Whoami(args) => {
            let ctx = ClientContext::new(token, args)?;
            print_json_response(ctx.get(&format!("{API_PREFIX}/session"), &[])?)
        }
        ApiCommand::Models(args) => {
            let ctx = ClientContext::new(token, args)?;
            print_json_response(ctx.get(&format!("{API_PREFIX}/chat/models"), &[])?)
        }
        ApiCommand::Files(subcommand) => run_files(&subcommand.command, token),
        ApiCommand::Chat(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let body = ChatRequest {
                model: args.model.clone(),
                messages: Vec::new(),
                prompt: Some(args.prompt.clone()),
            };
            stream_events(ctx.post(&format!("{API_PREFIX}/chat/stream"), &body)?)
        }
        ApiCommand::Exec(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let body = ExecRequest {
                command: args.command.clone(),
                cwd: args.cwd.clone(),
            };
            stream_events(ctx.post(&format!("{API_PREFIX}/terminal/exec/stream"), &body)?)
        }
    }
}

fn run_files(command: &FilesCommand, token: Option<&str>) -> Result<(), CliError> {
    match command {
        FilesCommand::Ls(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let response = ctx.get(&format!("{API_PREFIX}/files"), &[("path", &args.path)])?;
            print_json_response(response)
        }
        FilesCommand::Cat(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let response =
                ctx.get(&format!("{API_PREFIX}/files/content"), &[("path", &args.path)])?;
            print_bytes_response(response)
        }
        FilesCommand::Put(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let bytes = std::fs::read(&args.source)?;
            let response = ctx
                .request(Method::PUT, &format!("{API_PREFIX}/files/content"))
                .query(&[("path", &args.path)])
                .body(bytes)
                .send()?;
            print_json_response(response)
        }
        FilesCommand::Rm(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let response = ctx
                .request(Method::DELETE, &format!("{API_PREFIX}/files"))
                .query(&[("path", &args.path)])
                .send()?;
            print_empty_response(response)
        }
        FilesCommand::Mkdir(args) => {
            let ctx = ClientContext::new(token, &args.client)?;
            let body = MkdirRequest {
                path: args.path.clone(),
            };
            print_json_response(ctx.post(&format!("{API_PREFIX}/files/mkdir"), &body)?)
        }
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No origins configured: same-origin only.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    token: Option<String>,
    client: HttpClient,
}

impl ClientContext {
    fn new(token: Option<&str>, args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        // Streams may legitimately stay open for minutes.
        let client = HttpClient::builder().timeout(None).build()?;
        Ok(Self {
            endpoint,
            token: token.map(str::to_string),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let url = self.url(path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn get(
        &self,
        path: &str,
        query: &[(&str, &String)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        let mut request = self.request(Method::GET, path);
        for (key, value) in query {
            if !value.is_empty() {
                request = request.query(&[(key, value)]);
            }
        }
        Ok(request.send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }
}

/// Copies `chunk` text to stdout as it arrives and reports the `end` event.
fn stream_events(mut response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text()?;
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let mut sse = SseAccumulator::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = response.read(&mut buf)?;
        if read == 0 {
            break;
        }
        for frame in sse.push(&buf[..read]) {
            if let Some(end) = handle_frame(&frame)? {
                return end;
            }
        }
    }
    if let Some(frame) = sse.finish() {
        if let Some(end) = handle_frame(&frame)? {
            return end;
        }
    }
    Err(CliError::StreamFailed("disconnected".to_string()))
}

/// Returns the command's final result once the `end` event is seen.
fn handle_frame(frame: &SseFrame) -> Result<Option<Result<(), CliError>>, CliError> {
    let payload: Value = serde_json::from_str(&frame.data)?;
    match frame.event.as_deref() {
        Some("chunk") => {
            if let Some(text) = payload.get("text").and_then(Value::as_str) {
                write_stdout(text)?;
            }
            Ok(None)
        }
        Some("end") => {
            write_stdout("\n")?;
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("failed")
                .to_string();
            let summary = json!({
                "status": status,
                "exitCode": payload.get("exitCode"),
                "error": payload.get("error"),
            });
            write_stderr_line(&serde_json::to_string(&summary)?)?;
            if status == "failed" {
                Ok(Some(Err(CliError::StreamFailed(status))))
            } else {
                Ok(Some(Ok(())))
            }
        }
        _ => Ok(None),
    }
}

fn print_json_response(response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: Value = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_bytes_response(response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text()?;
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let bytes = response.bytes()?;
    let mut out = std::io::stdout();
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

fn print_empty_response(response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text()?;
    print_error_body(&text)?;
    Err(CliError::HttpStatus(status))
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SETTINGS_ENV: &[&str] = &[
        "SECRET_KEY",
        "GOOGLE_CLIENT_ID",
        "GOOGLE_CLIENT_SECRET",
        "ALLOWED_EMAILS",
        "ANTHROPIC_API_KEY",
        "OPENAI_API_KEY",
        "BLOCKED_COMMAND_PATTERNS",
        "FILE_ROOT",
        "APP_BASE_URL",
    ];

    fn server_args(extra: &[&str]) -> Result<ServerArgs, clap::Error> {
        for name in SETTINGS_ENV {
            std::env::remove_var(name);
        }
        let mut argv = vec!["console-gateway", "server"];
        argv.extend_from_slice(extra);
        match ConsoleGatewayCli::try_parse_from(argv)?.command {
            Command::Server(args) => Ok(args),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn settings_build_a_valid_config() {
        let root = tempfile::tempdir().expect("tempdir");
        let root_arg = root.path().to_string_lossy().to_string();
        let args = server_args(&[
            "--secret-key",
            "0123456789abcdef0123456789abcdef",
            "--google-client-id",
            "client",
            "--google-client-secret",
            "secret",
            "--allowed-emails",
            "ada@example.com, grace@example.com",
            "--anthropic-api-key",
            "sk-test",
            "--openai-api-key",
            "",
            "--blocked-command-patterns",
            "sudo,halt",
            "--file-root",
            &root_arg,
        ])
        .expect("parse");
        let config = args.settings.to_config().expect("config");
        assert_eq!(config.allowed_emails, ["ada@example.com", "grace@example.com"]);
        assert!(config.providers.anthropic.is_some());
        assert!(config.providers.openai.is_none());
        assert_eq!(config.blocked_patterns, ["sudo", "halt"]);
        assert_eq!(config.chat_rate_limit.max_requests, 30);
        assert_eq!(config.file_root, root.path());
    }

    #[test]
    #[serial]
    fn missing_secret_fails_startup() {
        let args = server_args(&[
            "--google-client-id",
            "client",
            "--google-client-secret",
            "secret",
        ])
        .expect("parse");
        assert!(matches!(
            args.settings.to_config(),
            Err(ConfigError::Missing("SECRET_KEY"))
        ));
    }

    #[test]
    fn end_frame_reports_failure() {
        let frame = SseFrame {
            event: Some("end".to_string()),
            data: r#"{"status":"failed","error":{"status":504}}"#.to_string(),
        };
        assert!(matches!(
            handle_frame(&frame),
            Ok(Some(Err(CliError::StreamFailed(status)))) if status == "failed"
        ));
        let frame = SseFrame {
            event: Some("end".to_string()),
            data: r#"{"status":"completed","exitCode":1}"#.to_string(),
        };
        assert!(matches!(handle_frame(&frame), Ok(Some(Ok(())))));
    }
}
