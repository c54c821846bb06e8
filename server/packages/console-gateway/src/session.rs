//! Stateless session tokens.
//!
//! A session is an HS256 JWT carrying the verified email as `sub`. Any process
//! holding the signing secret can verify any token; there is no server-side
//! session table, so logout only deletes the client cookie and a leaked token
//! stays valid until `exp`.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use console_gateway_error::GatewayError;

use crate::config::GatewayConfig;
use crate::identity::Identity;

pub const SESSION_COOKIE: &str = "session_token";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Unix time at which the identity provider vouched for `sub`.
    pub vat: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub identity: Identity,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl VerifiedSession {
    /// True once less than half of the lifetime is left; the router then
    /// attaches a fresh cookie so active users never hit expiry.
    pub fn needs_refresh(&self, now: OffsetDateTime) -> bool {
        let lifetime = self.expires_at - self.issued_at;
        self.expires_at - now < lifetime / 2
    }
}

#[derive(Clone)]
pub struct SessionIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
    cookie_path: String,
    secure: bool,
}

impl std::fmt::Debug for SessionIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIssuer")
            .field("ttl", &self.ttl)
            .field("cookie_path", &self.cookie_path)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl SessionIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
            cookie_path: "/".to_string(),
            secure: false,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut issuer = Self::new(config.signing_secret.as_bytes(), config.session_ttl);
        issuer.cookie_path = config.cookie_path();
        issuer.secure = config.secure_cookies();
        issuer
    }

    pub fn issue(&self, identity: &Identity) -> Result<IssuedSession, GatewayError> {
        self.issue_at(identity, OffsetDateTime::now_utc())
    }

    pub fn issue_at(
        &self,
        identity: &Identity,
        now: OffsetDateTime,
    ) -> Result<IssuedSession, GatewayError> {
        let issued_at = now.replace_nanosecond(0).unwrap_or(now);
        let expires_at = issued_at + self.ttl;
        let claims = SessionClaims {
            sub: identity.email.clone(),
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            vat: identity.verified_at.unix_timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| GatewayError::Internal {
                message: format!("failed to sign session token: {err}"),
            })?;
        Ok(IssuedSession {
            token,
            issued_at,
            expires_at,
        })
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedSession, GatewayError> {
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| GatewayError::InvalidSession {
                message: match err.kind() {
                    ErrorKind::ExpiredSignature => "session expired".to_string(),
                    ErrorKind::InvalidSignature => "bad signature".to_string(),
                    _ => "malformed session token".to_string(),
                },
            })?
            .claims;

        let timestamp = |value: i64| {
            OffsetDateTime::from_unix_timestamp(value).map_err(|_| GatewayError::InvalidSession {
                message: "malformed session timestamps".to_string(),
            })
        };
        Ok(VerifiedSession {
            identity: Identity::new(claims.sub, timestamp(claims.vat)?),
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
        })
    }

    /// `Set-Cookie` value carrying a freshly issued session.
    pub fn cookie(&self, session: &IssuedSession) -> Result<HeaderValue, GatewayError> {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Lax",
            session.token,
            self.cookie_path,
            self.ttl.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        header_value(cookie)
    }

    /// `Set-Cookie` value that deletes the session cookie.
    pub fn clear_cookie(&self) -> Result<HeaderValue, GatewayError> {
        let mut cookie = format!(
            "{SESSION_COOKIE}=; Path={}; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax",
            self.cookie_path
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        header_value(cookie)
    }
}

fn header_value(value: String) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(&value).map_err(|err| GatewayError::Internal {
        message: format!("invalid cookie header: {err}"),
    })
}

/// Pulls the session token out of the cookie header, falling back to an
/// `Authorization: Bearer` header for non-browser clients.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, token)) = pair.trim().split_once('=') {
                if name == SESSION_COOKIE && !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = rest.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}
