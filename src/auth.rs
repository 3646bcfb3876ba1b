//! OAuth access tokens from a long-lived refresh token
//!
//! Both HTTP backends authenticate with a bearer token obtained through the
//! `refresh_token` grant. Interactive authorization happens outside this
//! crate; the refresh token arrives through configuration.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{CloudSyncError, Result};

pub const DROPBOX_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// A cached token is refreshed once it has less than this left
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now + REFRESH_MARGIN
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Hands out access tokens, refreshing them when close to expiry
///
/// Concurrent callers share a single refresh.
pub struct TokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            refresh_token: refresh_token.into(),
            cached: Mutex::new(None),
        }
    }

    /// Dropbox PKCE app: no client secret
    pub fn dropbox(
        http: reqwest::Client,
        app_key: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self::new(http, DROPBOX_TOKEN_URL, app_key, None, refresh_token)
    }

    pub fn google(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self::new(
            http,
            GOOGLE_TOKEN_URL,
            client_id,
            Some(client_secret.into()),
            refresh_token,
        )
    }

    /// Whether there is anything to refresh with
    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.refresh_token.is_empty()
    }

    /// A valid access token
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.refresh().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    /// Drop the cached token after the provider rejected it
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self) -> Result<CachedToken> {
        if !self.has_credentials() {
            return Err(CloudSyncError::NotAuthenticated(
                "No refresh token configured".to_string(),
            ));
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CloudSyncError::RateLimited("Token endpoint".to_string()));
        }
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudSyncError::NotAuthenticated(format!(
                "Token refresh rejected: {}",
                body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudSyncError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!("Refreshed access token, valid for {}s", token.expires_in);

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}
