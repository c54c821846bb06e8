//! Static startup configuration for the gateway.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CHAT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_STREAM_BUFFER: usize = 32;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant embedded in a self-hosted \
console that manages files and runs commands on the user's server. Be concise, friendly and \
educational.";

/// Patterns the original console refused to run. Matching is a plain substring
/// test on the raw command and is not a security boundary.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf",
    "mkfs",
    "dd if=",
    ":(){:|:&};:",
    "shutdown",
    "reboot",
    "passwd",
];

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid base url {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },
    #[error("invalid setting {name}: {message}")]
    Invalid { name: &'static str, message: String },
    #[error("file root {path}: {message}")]
    FileRoot { path: PathBuf, message: String },
}

/// Fixed-window rate limit for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl OAuthClientConfig {
    pub const GOOGLE_AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    pub const GOOGLE_TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    pub const GOOGLE_USERINFO_URL: &'static str = "https://www.googleapis.com/oauth2/v3/userinfo";

    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: Self::GOOGLE_AUTH_URL.to_string(),
            token_url: Self::GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: Self::GOOGLE_USERINFO_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatProvidersConfig {
    pub anthropic: Option<ProviderCredentials>,
    pub openai: Option<ProviderCredentials>,
}

impl ChatProvidersConfig {
    pub const ANTHROPIC_BASE_URL: &'static str = "https://api.anthropic.com";
    pub const OPENAI_BASE_URL: &'static str = "https://api.openai.com";
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Url,
    pub signing_secret: String,
    pub session_ttl: Duration,
    pub allowed_emails: Vec<String>,
    pub oauth: OAuthClientConfig,
    pub providers: ChatProvidersConfig,
    pub file_root: PathBuf,
    pub chat_rate_limit: RateLimit,
    pub terminal_rate_limit: RateLimit,
    pub command_timeout: Duration,
    pub output_cap_bytes: usize,
    pub blocked_patterns: Vec<String>,
    pub chat_timeout: Duration,
    pub chat_max_tokens: u32,
    pub system_prompt: String,
    pub stream_buffer: usize,
}

impl GatewayConfig {
    /// Configuration with defaults for everything except the secret and the
    /// file root. OAuth client credentials are left empty.
    pub fn new(signing_secret: impl Into<String>, file_root: impl Into<PathBuf>) -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url is valid"),
            signing_secret: signing_secret.into(),
            session_ttl: DEFAULT_SESSION_TTL,
            allowed_emails: Vec::new(),
            oauth: OAuthClientConfig::google("", ""),
            providers: ChatProvidersConfig::default(),
            file_root: file_root.into(),
            chat_rate_limit: RateLimit::per_minute(30),
            terminal_rate_limit: RateLimit::per_minute(20),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            chat_timeout: DEFAULT_CHAT_TIMEOUT,
            chat_max_tokens: DEFAULT_CHAT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Checks the settings whose absence makes the process unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_secret.is_empty() {
            return Err(ConfigError::Missing("SECRET_KEY"));
        }
        if self.signing_secret.len() < MIN_SECRET_LEN {
            tracing::warn!(
                min_len = MIN_SECRET_LEN,
                "SECRET_KEY is short; use at least 32 random bytes"
            );
        }
        if self.oauth.client_id.is_empty() {
            return Err(ConfigError::Missing("GOOGLE_CLIENT_ID"));
        }
        if self.oauth.client_secret.is_empty() {
            return Err(ConfigError::Missing("GOOGLE_CLIENT_SECRET"));
        }
        if self.session_ttl.is_zero() {
            return Err(ConfigError::Invalid {
                name: "SESSION_TTL_SECS",
                message: "must be greater than zero".to_string(),
            });
        }
        for (name, limit) in [
            ("CHAT_RATE_LIMIT", self.chat_rate_limit),
            ("TERMINAL_RATE_LIMIT", self.terminal_rate_limit),
        ] {
            if limit.window.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    message: "rate limit window must be greater than zero".to_string(),
                });
            }
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::Invalid {
                name: "STREAM_BUFFER",
                message: "must be at least 1".to_string(),
            });
        }
        if self.output_cap_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "COMMAND_OUTPUT_CAP_BYTES",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Redirect URI registered with the OAuth provider.
    pub fn oauth_redirect_uri(&self) -> String {
        format!("{}/auth/google/callback", self.base_path_url())
    }

    /// Base URL without a trailing slash.
    pub fn base_path_url(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    /// Path the session cookie is scoped to.
    pub fn cookie_path(&self) -> String {
        let path = self.base_url.path();
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    }

    pub fn secure_cookies(&self) -> bool {
        self.base_url.scheme() == "https"
    }
}

pub fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        message: err.to_string(),
    })?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            message: "expected an http(s) url".to_string(),
        });
    }
    Ok(url)
}

/// Normalizes an allow-list entry or a resolved email for comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn default_file_root() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("console-gateway").join("files"))
        .unwrap_or_else(|| PathBuf::from(".").join(".console-gateway").join("files"))
}
