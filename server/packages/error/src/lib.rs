use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    AuthProviderError,
    NotAllowed,
    InvalidSession,
    Unauthorized,
    RateLimited,
    UnknownModel,
    ProviderError,
    ExecutionTimeout,
    OutputTruncated,
    InvalidPath,
    InvalidRequest,
    NotFound,
    CommandBlocked,
    StreamError,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::AuthProviderError => "urn:console-gateway:error:auth_provider_error",
            Self::NotAllowed => "urn:console-gateway:error:not_allowed",
            Self::InvalidSession => "urn:console-gateway:error:invalid_session",
            Self::Unauthorized => "urn:console-gateway:error:unauthorized",
            Self::RateLimited => "urn:console-gateway:error:rate_limited",
            Self::UnknownModel => "urn:console-gateway:error:unknown_model",
            Self::ProviderError => "urn:console-gateway:error:provider_error",
            Self::ExecutionTimeout => "urn:console-gateway:error:execution_timeout",
            Self::OutputTruncated => "urn:console-gateway:error:output_truncated",
            Self::InvalidPath => "urn:console-gateway:error:invalid_path",
            Self::InvalidRequest => "urn:console-gateway:error:invalid_request",
            Self::NotFound => "urn:console-gateway:error:not_found",
            Self::CommandBlocked => "urn:console-gateway:error:command_blocked",
            Self::StreamError => "urn:console-gateway:error:stream_error",
            Self::Internal => "urn:console-gateway:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::AuthProviderError => "Auth Provider Error",
            Self::NotAllowed => "Not Allowed",
            Self::InvalidSession => "Invalid Session",
            Self::Unauthorized => "Unauthorized",
            Self::RateLimited => "Rate Limited",
            Self::UnknownModel => "Unknown Model",
            Self::ProviderError => "Provider Error",
            Self::ExecutionTimeout => "Execution Timeout",
            Self::OutputTruncated => "Output Truncated",
            Self::InvalidPath => "Invalid Path",
            Self::InvalidRequest => "Invalid Request",
            Self::NotFound => "Not Found",
            Self::CommandBlocked => "Command Blocked",
            Self::StreamError => "Stream Error",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::AuthProviderError => 502,
            Self::NotAllowed => 403,
            Self::InvalidSession => 401,
            Self::Unauthorized => 401,
            Self::RateLimited => 429,
            Self::UnknownModel => 400,
            Self::ProviderError => 502,
            Self::ExecutionTimeout => 504,
            Self::OutputTruncated => 413,
            Self::InvalidPath => 400,
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::CommandBlocked => 403,
            Self::StreamError => 502,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Errors surfaced by the gateway, either as an HTTP problem response or as
/// the terminal event of a stream.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("auth provider error: {message}")]
    AuthProviderError { message: String },
    #[error("not allowed: {email}")]
    NotAllowed { email: String },
    #[error("invalid session: {message}")]
    InvalidSession { message: String },
    #[error("unauthorized")]
    Unauthorized { message: Option<String> },
    #[error("rate limited: {capability}")]
    RateLimited {
        capability: String,
        retry_after_secs: u64,
    },
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("provider error: {provider}: {message}")]
    ProviderError { provider: String, message: String },
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },
    #[error("output truncated at {limit_bytes} bytes")]
    OutputTruncated { limit_bytes: usize },
    #[error("invalid path: {path}")]
    InvalidPath { path: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("command blocked: matches `{pattern}`")]
    CommandBlocked { pattern: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::AuthProviderError { .. } => ErrorType::AuthProviderError,
            Self::NotAllowed { .. } => ErrorType::NotAllowed,
            Self::InvalidSession { .. } => ErrorType::InvalidSession,
            Self::Unauthorized { .. } => ErrorType::Unauthorized,
            Self::RateLimited { .. } => ErrorType::RateLimited,
            Self::UnknownModel { .. } => ErrorType::UnknownModel,
            Self::ProviderError { .. } => ErrorType::ProviderError,
            Self::ExecutionTimeout { .. } => ErrorType::ExecutionTimeout,
            Self::OutputTruncated { .. } => ErrorType::OutputTruncated,
            Self::InvalidPath { .. } => ErrorType::InvalidPath,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::CommandBlocked { .. } => ErrorType::CommandBlocked,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    /// Seconds a client should wait before retrying, when the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::NotAllowed { email } => {
                map.insert("email".to_string(), Value::String(email.clone()));
            }
            Self::Unauthorized {
                message: Some(message),
            } => {
                map.insert("reason".to_string(), Value::String(message.clone()));
            }
            Self::RateLimited {
                capability,
                retry_after_secs,
            } => {
                map.insert(
                    "capability".to_string(),
                    Value::String(capability.clone()),
                );
                map.insert(
                    "retryAfterSecs".to_string(),
                    Value::Number((*retry_after_secs).into()),
                );
            }
            Self::UnknownModel { model } => {
                map.insert("model".to_string(), Value::String(model.clone()));
            }
            Self::ProviderError { provider, .. } => {
                map.insert("provider".to_string(), Value::String(provider.clone()));
            }
            Self::ExecutionTimeout { timeout_ms } => {
                map.insert("timeoutMs".to_string(), Value::Number((*timeout_ms).into()));
            }
            Self::OutputTruncated { limit_bytes } => {
                map.insert(
                    "limitBytes".to_string(),
                    Value::Number((*limit_bytes as u64).into()),
                );
            }
            Self::InvalidPath { path } | Self::NotFound { path } => {
                map.insert("path".to_string(), Value::String(path.clone()));
            }
            Self::CommandBlocked { pattern } => {
                map.insert("pattern".to_string(), Value::String(pattern.clone()));
            }
            _ => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}
