// Service-account authentication for the Drive API (OAuth2 JWT bearer grant).
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{AppError, Result};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Refresh a little early so a token never expires mid-request.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The fields of a Google service-account key file we rely on.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Auth(format!("failed to read service account file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::Auth(format!("failed to parse service account file {}: {}", path.display(), e))
        })
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Builds the RS256-signed assertion exchanged for an access token.
fn build_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String> {
    let header = JwtHeader { alg: "RS256", typ: "JWT" };
    let claims = JwtClaims {
        iss: key.client_email.clone(),
        scope: DRIVE_SCOPE.to_string(),
        aud: key.token_uri().to_string(),
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );

    let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key)
        .map_err(|e| AppError::Auth(format!("invalid service account private key: {}", e)))?;
    let signature = SigningKey::<Sha256>::new(private_key).sign(signing_input.as_bytes());

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature.to_bytes())))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

enum TokenSource {
    ServiceAccount(PathBuf),
    #[cfg(test)]
    Fixed(String),
}

/// Hands out bearer tokens, loading the credential on first use.
pub struct Authenticator {
    source: TokenSource,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl Authenticator {
    pub fn service_account(credential_path: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            source: TokenSource::ServiceAccount(credential_path.into()),
            http,
            cached: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn fixed(token: &str) -> Self {
        Self {
            source: TokenSource::Fixed(token.to_string()),
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String> {
        let credential_path = match &self.source {
            TokenSource::ServiceAccount(path) => path,
            #[cfg(test)]
            TokenSource::Fixed(token) => return Ok(token.clone()),
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let key = ServiceAccountKey::load(credential_path).await?;
        let token = self.exchange(&key).await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn exchange(&self, key: &ServiceAccountKey) -> Result<CachedToken> {
        let now = Utc::now();
        let assertion = build_assertion(key, now)?;
        debug!(client_email = %key.client_email, token_uri = key.token_uri(), "Requesting access token");

        let response = self
            .http
            .post(key.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AppError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Auth(format!("token endpoint returned {}: {}", status, body.trim())));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Auth(format!("malformed token response: {}", e)))?;
        let lifetime = token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);

        Ok(CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds((lifetime - EXPIRY_MARGIN_SECS).max(0)),
        })
    }
}
