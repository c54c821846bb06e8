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

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DONE_MARKER: &str = "[DONE]";

/// OpenAI Chat Completions in streaming mode.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    credentials: ProviderCredentials,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(credentials: ProviderCredentials) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Internal {
                message: format!("failed to build openai client: {err}"),
            })?;
        Ok(Self {
            credentials,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.credentials.base_url.trim_end_matches('/')
        )
    }

    async fn start(&self, request: CompletionRequest) -> Result<FragmentStream, GatewayError> {
        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        messages.extend(
            request
                .messages
                .iter()
                .map(|message| json!({ "role": message.role, "content": message.content })),
        );
        let body = json!({
            "model": request.model.upstream_name(),
            "max_tokens": request.max_tokens,
            "messages": messages,
            "stream": true,
        });
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.credentials.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(Provider::OpenAi, err))?;
        let response = check_status(Provider::OpenAi, response).await?;
        Ok(fragment_stream(
            Provider::OpenAi,
            response.bytes_stream(),
            parse_chunk,
        ))
    }
}

impl CompletionProvider for OpenAiProvider {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn stream(&self, request: CompletionRequest) -> CompletionFuture<'_> {
        Box::pin(self.start(request))
    }
}

fn parse_chunk(frame: &SseFrame) -> Result<FrameAction, GatewayError> {
    if frame.data.trim() == DONE_MARKER {
        return Ok(FrameAction::Done);
    }
    let value: Value =
        serde_json::from_str(&frame.data).map_err(|err| malformed(Provider::OpenAi, err))?;
    if let Some(message) = error_message(&value) {
        return Err(GatewayError::ProviderError {
            provider: Provider::OpenAi.to_string(),
            message,
        });
    }
    Ok(value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(|text| FrameAction::Text(text.to_string()))
        .unwrap_or(FrameAction::Skip))
}
