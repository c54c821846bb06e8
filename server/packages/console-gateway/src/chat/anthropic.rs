use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use console_gateway_error::GatewayError;

use super::sse::SseFrame;
use super::{
    check_status, error_message, fragment_stream, malformed, transport_error, CompletionFuture,
    CompletionProvider, CompletionRequest, FragmentStream, FrameAction, Provider,
};
use crate::config::ProviderCredentials;

const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Anthropic Messages API in streaming mode.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    credentials: ProviderCredentials,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(credentials: ProviderCredentials) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Internal {
                message: format!("failed to build anthropic client: {err}"),
            })?;
        Ok(Self {
            credentials,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/messages",
            self.credentials.base_url.trim_end_matches('/')
        )
    }

    async fn start(&self, request: CompletionRequest) -> Result<FragmentStream, GatewayError> {
        let body = json!({
            "model": request.model.upstream_name(),
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": request.messages,
            "stream": true,
        });
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.credentials.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(Provider::Anthropic, err))?;
        let response = check_status(Provider::Anthropic, response).await?;
        Ok(fragment_stream(
            Provider::Anthropic,
            response.bytes_stream(),
            parse_event,
        ))
    }
}

impl CompletionProvider for AnthropicProvider {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn stream(&self, request: CompletionRequest) -> CompletionFuture<'_> {
        Box::pin(self.start(request))
    }
}

fn parse_event(frame: &SseFrame) -> Result<FrameAction, GatewayError> {
    let value: Value =
        serde_json::from_str(&frame.data).map_err(|err| malformed(Provider::Anthropic, err))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .or(frame.event.as_deref())
        .unwrap_or_default();
    match kind {
        "content_block_delta" => Ok(value
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .map(|text| FrameAction::Text(text.to_string()))
            .unwrap_or(FrameAction::Skip)),
        "message_stop" => Ok(FrameAction::Done),
        "error" => Err(GatewayError::ProviderError {
            provider: Provider::Anthropic.to_string(),
            message: error_message(&value).unwrap_or_else(|| "upstream error".to_string()),
        }),
        _ => Ok(FrameAction::Skip),
    }
}
