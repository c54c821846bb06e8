//! Multi-provider AI chat proxy.

mod anthropic;
mod openai;
pub mod sse;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use console_gateway_error::GatewayError;

use crate::config::GatewayConfig;
use crate::stream::{Producer, ProducerFuture, StreamEnd, StreamSink};

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
use sse::{SseAccumulator, SseFrame};

pub const DEFAULT_MODEL: ModelId = ModelId::Claude;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of selectable models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelId {
    Claude,
    ClaudeOpus,
    Gpt,
    GptMini,
}

impl ModelId {
    pub const ALL: [ModelId; 4] = [
        ModelId::Claude,
        ModelId::ClaudeOpus,
        ModelId::Gpt,
        ModelId::GptMini,
    ];

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|model| model.key() == key)
    }

    /// Key clients send in the `model` field.
    pub fn key(&self) -> &'static str {
        match self {
            ModelId::Claude => "claude",
            ModelId::ClaudeOpus => "claude-opus",
            ModelId::Gpt => "gpt",
            ModelId::GptMini => "gpt-mini",
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            ModelId::Claude | ModelId::ClaudeOpus => Provider::Anthropic,
            ModelId::Gpt | ModelId::GptMini => Provider::OpenAi,
        }
    }

    /// Model name sent upstream.
    pub fn upstream_name(&self) -> &'static str {
        match self {
            ModelId::Claude => "claude-sonnet-4-6",
            ModelId::ClaudeOpus => "claude-opus-4-6",
            ModelId::Gpt => "gpt-4o",
            ModelId::GptMini => "gpt-4o-mini",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelId::Claude => "Claude Sonnet 4.6",
            ModelId::ClaudeOpus => "Claude Opus 4.6",
            ModelId::Gpt => "GPT-4o",
            ModelId::GptMini => "GPT-4o Mini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub reply: String,
    /// Display label of the model that answered.
    pub model: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelInfo {
    pub key: String,
    pub label: String,
    pub provider: Provider,
    pub model: String,
}

impl From<ModelId> for ModelInfo {
    fn from(model: ModelId) -> Self {
        Self {
            key: model.key().to_string(),
            label: model.label().to_string(),
            provider: model.provider(),
            model: model.upstream_name().to_string(),
        }
    }
}

/// Provider-neutral streaming completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: ModelId,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<FragmentStream, GatewayError>> + Send + 'a>>;

/// An upstream API that streams completion text.
pub trait CompletionProvider: Send + Sync + 'static {
    fn provider(&self) -> Provider;

    /// Starts the completion. Dropping the returned stream aborts the
    /// upstream request.
    fn stream(&self, request: CompletionRequest) -> CompletionFuture<'_>;
}

pub struct ChatProxy {
    providers: HashMap<Provider, Arc<dyn CompletionProvider>>,
    system_prompt: String,
    max_tokens: u32,
    timeout: Duration,
}

impl fmt::Debug for ChatProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatProxy")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ChatProxy {
    pub fn new(system_prompt: impl Into<String>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            system_prompt: system_prompt.into(),
            max_tokens,
            timeout,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers.insert(provider.provider(), provider);
        self
    }

    /// Registers a provider for every credential present in the config.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut proxy = Self::new(
            config.system_prompt.clone(),
            config.chat_max_tokens,
            config.chat_timeout,
        );
        if let Some(credentials) = &config.providers.anthropic {
            proxy = proxy.with_provider(Arc::new(AnthropicProvider::new(credentials.clone())?));
        }
        if let Some(credentials) = &config.providers.openai {
            proxy = proxy.with_provider(Arc::new(OpenAiProvider::new(credentials.clone())?));
        }
        if proxy.providers.is_empty() {
            tracing::warn!("no AI provider credentials configured; chat is disabled");
        }
        Ok(proxy)
    }

    /// Models whose provider is configured.
    pub fn models(&self) -> Vec<ModelInfo> {
        ModelId::ALL
            .into_iter()
            .filter(|model| self.providers.contains_key(&model.provider()))
            .map(ModelInfo::from)
            .collect()
    }

    pub fn resolve_model(&self, key: Option<&str>) -> Result<ModelId, GatewayError> {
        let key = key.map(str::trim).filter(|key| !key.is_empty());
        let model = match key {
            Some(key) => ModelId::parse(key),
            None => Some(DEFAULT_MODEL),
        };
        match model {
            Some(model) if self.providers.contains_key(&model.provider()) => Ok(model),
            _ => Err(GatewayError::UnknownModel {
                model: key.unwrap_or(DEFAULT_MODEL.key()).to_string(),
            }),
        }
    }

    /// Validates the request and binds it to a provider. No upstream call is
    /// made until the returned producer runs.
    pub fn prepare(&self, request: ChatRequest) -> Result<ChatExchange, GatewayError> {
        let model = self.resolve_model(request.model.as_deref())?;
        let provider = self
            .providers
            .get(&model.provider())
            .cloned()
            .ok_or_else(|| GatewayError::UnknownModel {
                model: model.key().to_string(),
            })?;

        let mut messages = request.messages;
        if let Some(prompt) = request.prompt.filter(|prompt| !prompt.trim().is_empty()) {
            messages.push(ChatMessage {
                role: Role::User,
                content: prompt,
            });
        }
        if messages.is_empty() {
            return Err(GatewayError::InvalidRequest {
                message: "conversation is empty".to_string(),
            });
        }

        Ok(ChatExchange {
            provider,
            timeout: self.timeout,
            request: CompletionRequest {
                model,
                system: self.system_prompt.clone(),
                messages,
                max_tokens: self.max_tokens,
            },
        })
    }
}

/// One streamed completion, owned by the stream it feeds.
pub struct ChatExchange {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
    request: CompletionRequest,
}

impl ChatExchange {
    pub fn model(&self) -> ModelId {
        self.request.model
    }
}

impl fmt::Debug for ChatExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatExchange")
            .field("model", &self.request.model)
            .field("messages", &self.request.messages.len())
            .finish_non_exhaustive()
    }
}

impl Producer for ChatExchange {
    fn run(self: Box<Self>, sink: StreamSink) -> ProducerFuture {
        Box::pin(async move {
            let ChatExchange {
                provider,
                timeout,
                request,
            } = *self;
            let model = request.model;
            let upstream = provider.provider();
            tracing::info!(model = model.key(), provider = %upstream, "chat exchange started");

            let relay = async {
                let mut fragments = provider.stream(request).await?;
                while let Some(fragment) = fragments.next().await {
                    if sink.send(fragment?).await.is_err() {
                        return Err(GatewayError::StreamError {
                            message: "client disconnected".to_string(),
                        });
                    }
                }
                Ok::<(), GatewayError>(())
            };

            let end = match tokio::time::timeout(timeout, relay).await {
                Ok(Ok(())) => StreamEnd::Completed { exit_code: None },
                Ok(Err(err)) => StreamEnd::Failed(err),
                Err(_) => StreamEnd::Failed(GatewayError::ProviderError {
                    provider: upstream.to_string(),
                    message: format!("no completion within {}s", timeout.as_secs()),
                }),
            };
            if let StreamEnd::Failed(err) = &end {
                tracing::warn!(model = model.key(), error = %err, "chat exchange failed");
            }
            end
        })
    }
}

/// What one upstream SSE frame means for the fragment stream.
pub(crate) enum FrameAction {
    Text(String),
    Skip,
    Done,
}

struct FragmentState<S, F> {
    body: Pin<Box<S>>,
    sse: SseAccumulator,
    pending: VecDeque<Result<String, GatewayError>>,
    finished: bool,
    provider: Provider,
    parse: F,
}

impl<S, F> FragmentState<S, F>
where
    F: FnMut(&SseFrame) -> Result<FrameAction, GatewayError>,
{
    fn apply(&mut self, frame: SseFrame) {
        if self.finished {
            return;
        }
        match (self.parse)(&frame) {
            Ok(FrameAction::Text(text)) => {
                if !text.is_empty() {
                    self.pending.push_back(Ok(text));
                }
            }
            Ok(FrameAction::Skip) => {}
            Ok(FrameAction::Done) => self.finished = true,
            Err(err) => {
                self.pending.push_back(Err(err));
                self.finished = true;
            }
        }
    }

    fn fail(&mut self, message: String) {
        self.pending.push_back(Err(GatewayError::ProviderError {
            provider: self.provider.to_string(),
            message,
        }));
        self.finished = true;
    }
}

/// Turns an upstream SSE body into text fragments. The stream ends after the
/// provider's completion marker; a body that ends without one is an error.
pub(crate) fn fragment_stream<S, B, E, F>(provider: Provider, body: S, parse: F) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
    F: FnMut(&SseFrame) -> Result<FrameAction, GatewayError> + Send + 'static,
{
    let state = FragmentState {
        body: Box::pin(body),
        sse: SseAccumulator::new(),
        pending: VecDeque::new(),
        finished: false,
        provider,
        parse,
    };
    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for frame in state.sse.push(bytes.as_ref()) {
                        state.apply(frame);
                    }
                }
                Some(Err(err)) => state.fail(format!("stream interrupted: {err}")),
                None => {
                    if let Some(frame) = state.sse.finish() {
                        state.apply(frame);
                    }
                    if !state.finished {
                        state.fail("stream ended before completion".to_string());
                    }
                }
            }
        }
    }))
}

/// Maps a non-success upstream response to a provider error, pulling the
/// message out of the usual `{"error": {"message": ..}}` body.
pub(crate) async fn check_status(
    provider: Provider,
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| error_message(&value))
        .unwrap_or(body);
    Err(GatewayError::ProviderError {
        provider: provider.to_string(),
        message: format!("{status}: {detail}"),
    })
}

pub(crate) fn error_message(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> GatewayError {
    GatewayError::ProviderError {
        provider: provider.to_string(),
        message: err.to_string(),
    }
}

pub(crate) fn malformed(provider: Provider, err: serde_json::Error) -> GatewayError {
    GatewayError::ProviderError {
        provider: provider.to_string(),
        message: format!("malformed stream event: {err}"),
    }
}
