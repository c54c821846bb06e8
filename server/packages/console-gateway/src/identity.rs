//! OAuth identity verification and allow-list enforcement.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use console_gateway_error::GatewayError;

use crate::config::{normalize_email, GatewayConfig, OAuthClientConfig};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub verified_at: OffsetDateTime,
}

impl Identity {
    pub fn new(email: String, verified_at: OffsetDateTime) -> Self {
        Self { email, verified_at }
    }

    /// Identity vouched for right now, truncated to whole seconds so it
    /// survives a round trip through a session token.
    pub fn verified_now(email: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self::new(email.into(), now.replace_nanosecond(0).unwrap_or(now))
    }
}

/// Account details returned by the provider after a successful exchange.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderAccount {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The third-party side of the authorization-code flow.
pub trait IdentityProvider: Send + Sync + 'static {
    /// URL the browser is redirected to for consent.
    fn authorize_url(&self) -> String;

    /// Exchanges an authorization code for the account it was issued to.
    fn exchange(
        &self,
        code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderAccount, GatewayError>> + Send + '_>>;
}

/// Closed set of identities permitted to log in; empty means unrestricted.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    emails: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            emails: emails
                .into_iter()
                .map(|email| normalize_email(email.as_ref()))
                .filter(|email| !email.is_empty())
                .collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.emails.is_empty()
    }

    pub fn permits(&self, email: &str) -> bool {
        self.is_unrestricted() || self.emails.contains(&normalize_email(email))
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

pub struct IdentityVerifier {
    provider: Arc<dyn IdentityProvider>,
    allow_list: AllowList,
}

impl std::fmt::Debug for IdentityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityVerifier")
            .field("allow_list", &self.allow_list)
            .finish_non_exhaustive()
    }
}

impl IdentityVerifier {
    pub fn new(provider: Arc<dyn IdentityProvider>, allow_list: AllowList) -> Self {
        Self {
            provider,
            allow_list,
        }
    }

    pub fn authorize_url(&self) -> String {
        self.provider.authorize_url()
    }

    pub async fn verify(&self, code: &str) -> Result<Identity, GatewayError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(GatewayError::AuthProviderError {
                message: "authorization code is empty".to_string(),
            });
        }

        let account = self.provider.exchange(code).await?;
        if account.email_verified == Some(false) {
            return Err(GatewayError::AuthProviderError {
                message: "provider reports the email as unverified".to_string(),
            });
        }
        let email = account
            .email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty())
            .ok_or_else(|| GatewayError::AuthProviderError {
                message: "identity assertion has no email claim".to_string(),
            })?;

        if !self.allow_list.permits(&email) {
            tracing::warn!(email = %email, "login rejected by allow-list");
            return Err(GatewayError::NotAllowed { email });
        }

        tracing::info!(email = %email, "identity verified");
        Ok(Identity::verified_now(email))
    }
}

/// Google's OAuth 2.0 endpoints, overridable for tests and other providers
/// that speak the same token/userinfo protocol.
#[derive(Debug, Clone)]
pub struct GoogleIdentityProvider {
    config: OAuthClientConfig,
    redirect_uri: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl GoogleIdentityProvider {
    pub fn new(config: OAuthClientConfig, redirect_uri: String) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Internal {
                message: format!("failed to build oauth client: {err}"),
            })?;
        Ok(Self {
            config,
            redirect_uri,
            client,
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Self::new(config.oauth.clone(), config.oauth_redirect_uri())
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderAccount, GatewayError> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(provider_error)?;

        let status = response.status();
        let token: TokenResponse = response.json().await.map_err(provider_error)?;
        if let Some(error) = token.error {
            return Err(GatewayError::AuthProviderError {
                message: token.error_description.unwrap_or(error),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::AuthProviderError {
                message: format!("token endpoint returned {status}"),
            });
        }
        let access_token = token
            .access_token
            .ok_or_else(|| GatewayError::AuthProviderError {
                message: "token response has no access_token".to_string(),
            })?;

        let response = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(provider_error)?;
        if !response.status().is_success() {
            return Err(GatewayError::AuthProviderError {
                message: format!("userinfo endpoint returned {}", response.status()),
            });
        }
        response.json::<ProviderAccount>().await.map_err(provider_error)
    }
}

impl IdentityProvider for GoogleIdentityProvider {
    fn authorize_url(&self) -> String {
        match Url::parse_with_params(
            &self.config.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", "openid email profile"),
                ("access_type", "online"),
            ],
        ) {
            Ok(url) => url.to_string(),
            Err(err) => {
                tracing::error!(error = %err, url = %self.config.auth_url, "invalid oauth auth url");
                self.config.auth_url.clone()
            }
        }
    }

    fn exchange(
        &self,
        code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderAccount, GatewayError>> + Send + '_>> {
        let code = code.to_string();
        Box::pin(async move { self.exchange_code(&code).await })
    }
}

fn provider_error(err: reqwest::Error) -> GatewayError {
    GatewayError::AuthProviderError {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(ProviderAccount);

    impl IdentityProvider for FixedProvider {
        fn authorize_url(&self) -> String {
            "https://provider.test/auth".to_string()
        }

        fn exchange(
            &self,
            _code: &str,
        ) -> Pin<Box<dyn Future<Output = Result<ProviderAccount, GatewayError>> + Send + '_>>
        {
            let account = self.0.clone();
            Box::pin(async move { Ok(account) })
        }
    }

    fn verifier(email: Option<&str>, allowed: &[&str]) -> IdentityVerifier {
        let account = ProviderAccount {
            email: email.map(str::to_string),
            email_verified: Some(true),
            name: None,
        };
        IdentityVerifier::new(Arc::new(FixedProvider(account)), AllowList::new(allowed))
    }

    #[tokio::test]
    async fn empty_allow_list_accepts_any_account() {
        let identity = verifier(Some("anyone@example.com"), &[])
            .verify("code")
            .await
            .expect("verify");
        assert_eq!(identity.email, "anyone@example.com");
    }

    #[tokio::test]
    async fn allow_list_rejects_absent_email() {
        let err = verifier(Some("eve@example.com"), &["ada@example.com"])
            .verify("code")
            .await
            .expect_err("rejected");
        assert!(matches!(err, GatewayError::NotAllowed { email } if email == "eve@example.com"));
    }

    #[tokio::test]
    async fn allow_list_match_ignores_case() {
        verifier(Some("Ada@Example.com"), &[" ada@example.com "])
            .verify("code")
            .await
            .expect("verify");
    }

    #[test]
    fn allow_list_collapses_duplicates_and_blanks() {
        let list = AllowList::new(["ada@example.com", " ADA@example.com", "  ", ""]);
        assert_eq!(list.len(), 1);
        assert!(!list.is_empty());
        assert!(AllowList::new(["   "]).is_empty());
    }

    #[tokio::test]
    async fn missing_email_is_provider_error() {
        let err = verifier(None, &[]).verify("code").await.expect_err("no email");
        assert!(matches!(err, GatewayError::AuthProviderError { .. }));
    }

    #[tokio::test]
    async fn empty_code_never_reaches_provider() {
        let err = verifier(Some("a@b.c"), &[]).verify("  ").await.expect_err("empty");
        assert!(matches!(err, GatewayError::AuthProviderError { .. }));
    }

    #[test]
    fn authorize_url_carries_client_and_redirect() {
        let provider = GoogleIdentityProvider::new(
            OAuthClientConfig::google("client-1", "secret"),
            "http://localhost:8080/auth/google/callback".to_string(),
        )
        .expect("provider");
        let url = Url::parse(&provider.authorize_url()).expect("url");
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["response_type"], "code");
        assert_eq!(
            params["redirect_uri"],
            "http://localhost:8080/auth/google/callback"
        );
    }
}
