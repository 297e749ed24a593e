//! Credential gate: decides whether a presented credential is currently valid.
//!
//! Two mutually exclusive schemes exist. Token mode verifies a bearer JWT
//! against an environment-scoped key; secret mode compares a shared secret
//! against the single current value held by a [`SecretStore`]. The mode is
//! picked once per connection (from the UI-source tag) and carried with the
//! session as an [`AuthMode`].

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::AuthError;

/// UI-source tag (case-insensitive) that selects secret authentication.
pub const SECRET_UI_SOURCE: &str = "slack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Prod,
    NonProd,
    Dev,
    Local,
}

impl Environment {
    /// Environment assumed when a client does not name one.
    pub const DEFAULT: Environment = Environment::Dev;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "PROD",
            Self::NonProd => "NONPROD",
            Self::Dev => "DEV",
            Self::Local => "LOCAL",
        }
    }

    /// Parse a client-supplied name. Unknown names select the production key.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or(Self::Prod)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PROD" => Ok(Self::Prod),
            "NONPROD" => Ok(Self::NonProd),
            "DEV" => Ok(Self::Dev),
            "LOCAL" => Ok(Self::Local),
            other => Err(format!("unknown environment {other}")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    Secret,
}

impl AuthMode {
    pub fn for_ui_source(ui_source: Option<&str>) -> Self {
        match ui_source {
            Some(tag) if tag.trim().eq_ignore_ascii_case(SECRET_UI_SOURCE) => Self::Secret,
            _ => Self::Token,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Secret => "secret",
        }
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "token" => Ok(Self::Token),
            "secret" => Ok(Self::Secret),
            other => Err(format!("unknown auth mode {other}")),
        }
    }
}

/// The credential a session was accepted with, kept to re-validate later.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub mode: AuthMode,
    /// Bare bearer token in token mode, shared secret in secret mode.
    pub value: String,
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("mode", &self.mode)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Extract the token from a `Bearer <token>` value.
pub fn extract_bearer(header: &str) -> Result<&str, AuthError> {
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(AuthError::MalformedAuthorization),
    }
}

// ---------------------------------------------------------------------------
// Token verification
// ---------------------------------------------------------------------------

struct EnvironmentKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

/// Verifies bearer tokens against one key per environment.
pub struct TokenVerifier {
    keys: HashMap<Environment, EnvironmentKey>,
    audience: Option<String>,
}

impl TokenVerifier {
    pub fn new(audience: Option<String>) -> Self {
        Self {
            keys: HashMap::new(),
            audience,
        }
    }

    /// Register an RS256 public key (PEM) for an environment.
    pub fn with_rsa_pem(
        mut self,
        env: Environment,
        pem: &[u8],
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        let key = DecodingKey::from_rsa_pem(pem)?;
        self.keys.insert(
            env,
            EnvironmentKey {
                key,
                algorithm: Algorithm::RS256,
            },
        );
        Ok(self)
    }

    /// Register an HS256 shared key for an environment.
    pub fn with_hmac_secret(mut self, env: Environment, secret: &[u8]) -> Self {
        self.keys.insert(
            env,
            EnvironmentKey {
                key: DecodingKey::from_secret(secret),
                algorithm: Algorithm::HS256,
            },
        );
        self
    }

    pub fn configured_environments(&self) -> Vec<Environment> {
        self.keys.keys().copied().collect()
    }

    pub fn verify(&self, token: &str, env: Environment) -> Result<Value, AuthError> {
        let Some(entry) = self.keys.get(&env) else {
            return Err(AuthError::NoKey(env.to_string()));
        };

        let mut validation = Validation::new(entry.algorithm);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        jsonwebtoken::decode::<Value>(token, &entry.key, &validation)
            .map(|data| data.claims)
            .map_err(|error| AuthError::InvalidToken(error.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Shared secrets
// ---------------------------------------------------------------------------

/// Source of the single current shared secret.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn current_secret(&self) -> Result<String, AuthError>;
}

/// A secret fixed at startup.
pub struct StaticSecretStore {
    secret: Option<String>,
}

impl StaticSecretStore {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn current_secret(&self) -> Result<String, AuthError> {
        self.secret
            .clone()
            .ok_or_else(|| AuthError::SecretUnavailable("no shared secret configured".into()))
    }
}

/// Fetches the secret from an HTTP endpoint (plain-text body) and caches it
/// for `ttl` so rotations are picked up.
pub struct HttpSecretStore {
    url: String,
    client: reqwest::Client,
    ttl: Duration,
    cache: RwLock<Option<(String, Instant)>>,
}

impl HttpSecretStore {
    pub fn new(url: impl Into<String>, ttl: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<String, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|error| AuthError::SecretUnavailable(error.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::SecretUnavailable(format!(
                "HTTP {} from secret store",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|error| AuthError::SecretUnavailable(error.to_string()))?;
        let secret = body.trim().to_string();
        if secret.is_empty() {
            return Err(AuthError::SecretUnavailable("secret store returned empty value".into()));
        }
        Ok(secret)
    }
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn current_secret(&self) -> Result<String, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some((secret, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(secret.clone());
                }
            }
        }

        let secret = self.fetch().await.inspect_err(|error| {
            tracing::warn!(target = "session_relay::auth", url = %self.url, error = %error, "secret fetch failed");
        })?;
        *self.cache.write().await = Some((secret.clone(), Instant::now()));
        Ok(secret)
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CredentialGate {
    verifier: Arc<TokenVerifier>,
    secrets: Arc<dyn SecretStore>,
}

impl CredentialGate {
    pub fn new(verifier: TokenVerifier, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            verifier: Arc::new(verifier),
            secrets,
        }
    }

    /// Validate a freshly presented credential. In token mode `presented` is
    /// an `Authorization` value; in secret mode it is the secret itself.
    pub async fn authenticate(
        &self,
        mode: AuthMode,
        presented: Option<&str>,
        env: Environment,
    ) -> Result<SessionCredential, AuthError> {
        let presented = presented.map(str::trim).filter(|value| !value.is_empty());
        match mode {
            AuthMode::Token => {
                let header = presented.ok_or(AuthError::Missing("Authorization"))?;
                let token = extract_bearer(header)?;
                self.check_token(token, env)?;
                Ok(SessionCredential {
                    mode,
                    value: token.to_string(),
                })
            }
            AuthMode::Secret => {
                let secret = presented.ok_or(AuthError::Missing("secret"))?;
                self.check_secret(secret).await?;
                Ok(SessionCredential {
                    mode,
                    value: secret.to_string(),
                })
            }
        }
    }

    /// Re-run the gate for a stored credential.
    pub async fn revalidate(
        &self,
        credential: &SessionCredential,
        env: Environment,
    ) -> Result<(), AuthError> {
        match credential.mode {
            AuthMode::Token => self.check_token(&credential.value, env).map(|_| ()),
            AuthMode::Secret => self.check_secret(&credential.value).await,
        }
    }

    pub fn check_token(&self, token: &str, env: Environment) -> Result<Value, AuthError> {
        self.verifier.verify(token, env).inspect_err(|error| {
            tracing::info!(target = "session_relay::auth", env = %env, error = %error, "token rejected");
        })
    }

    pub async fn check_secret(&self, presented: &str) -> Result<(), AuthError> {
        if presented.is_empty() {
            return Err(AuthError::Missing("secret"));
        }
        let current = self.secrets.current_secret().await?;
        if digest(presented) == digest(&current) {
            Ok(())
        } else {
            tracing::info!(target = "session_relay::auth", "secret mismatch");
            Err(AuthError::SecretMismatch)
        }
    }
}
