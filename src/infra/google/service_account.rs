// =============================================================================
// SERVICE ACCOUNT AUTHENTICATION
// =============================================================================
//
// OAuth2 JWT-bearer flow for a Google service account. The agent creates
// folders and spreadsheets in the service account's own Drive, so it needs
// read/write scopes for both Drive and Sheets.
//
// **Environment Variables:**
// - `GOOGLE_CREDENTIALS_PATH` - Path to the service account JSON key file
// - `GOOGLE_SERVICE_ACCOUNT_JSON` - The JSON content directly (for deployment)

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use super::GoogleApiError;
use crate::core::agent::agent_config::SheetsSettings;

pub const GOOGLE_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/drive",
];

/// Service account credentials from the JSON key file.
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountCredentials {
    /// The service account email (used as issuer in JWT).
    client_email: String,

    /// The private key in PEM format.
    private_key: String,

    /// Where to exchange the JWT for an access token.
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// JWT claims for Google OAuth2.
#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    /// At most one hour after `iat`.
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// Authenticator that handles OAuth2 with service account credentials.
pub struct ServiceAccountAuth {
    credentials: ServiceAccountCredentials,
    client: Client,
    cached_token: Arc<RwLock<Option<CachedToken>>>,
}

impl ServiceAccountAuth {
    /// Creates a new authenticator from a JSON key file path.
    pub async fn from_file(path: &str) -> Result<Self, GoogleApiError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GoogleApiError::Credentials(format!("{}: {}", path, e)))?;
        Self::from_json(&content)
    }

    /// Creates a new authenticator from JSON content.
    pub fn from_json(json: &str) -> Result<Self, GoogleApiError> {
        let credentials: ServiceAccountCredentials = serde_json::from_str(json)
            .map_err(|e| GoogleApiError::Credentials(e.to_string()))?;
        Ok(Self {
            credentials,
            client: Client::new(),
            cached_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Inline JSON wins over the file path when both are configured.
    pub async fn from_settings(settings: &SheetsSettings) -> Result<Self, GoogleApiError> {
        match &settings.credentials_json {
            Some(json) => Self::from_json(json),
            None => Self::from_file(&settings.credentials_path).await,
        }
    }

    pub fn client_email(&self) -> &str {
        &self.credentials.client_email
    }

    /// Gets a valid access token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String, GoogleApiError> {
        {
            let cached = self.cached_token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > SystemTime::now() + Duration::from_secs(60) {
                    return Ok(token.token.clone());
                }
            }
        }

        let (new_token, lifetime) = self.fetch_new_token().await?;

        {
            let mut cached = self.cached_token.write().await;
            *cached = Some(CachedToken {
                token: new_token.clone(),
                expires_at: SystemTime::now() + lifetime,
            });
        }

        Ok(new_token)
    }

    async fn fetch_new_token(&self) -> Result<(String, Duration), GoogleApiError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| GoogleApiError::Credentials(e.to_string()))?
            .as_secs();

        let claims = JwtClaims {
            iss: self.credentials.client_email.clone(),
            scope: GOOGLE_SCOPES.join(" "),
            aud: self.credentials.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };

        let header = Header::new(Algorithm::RS256);
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())?;
        let jwt = encode(&header, &claims, &key)?;

        let response = self
            .client
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            return Err(GoogleApiError::Status {
                context: "token exchange",
                status,
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        // Refresh five minutes early.
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600).saturating_sub(300));
        tracing::debug!("Obtained Google access token for {}", self.client_email());
        Ok((token.access_token, lifetime))
    }
}
