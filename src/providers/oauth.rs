use crate::auth::{auth_headers, OAuthCredentials};
use crate::error::AppError;
use crate::models::{Profile, UsageData};
use crate::providers::endpoint;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

const USAGE_PATH: &str = "/api/oauth/usage";
const PROFILE_PATH: &str = "/api/oauth/profile";

/// Subscription usage endpoints reached with a Claude Code OAuth token.
#[async_trait]
pub trait UsageApi: Send + Sync {
    async fn fetch_usage(&self, creds: &OAuthCredentials) -> Result<UsageData, AppError>;

    async fn fetch_profile(&self, creds: &OAuthCredentials) -> Result<Profile, AppError>;
}

pub struct OAuthClient {
    client: Client,
    base_url: String,
}

impl OAuthClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        creds: &OAuthCredentials,
    ) -> Result<T, AppError> {
        let url = endpoint(&self.base_url, path, &[])?;
        let response = self
            .client
            .get(url)
            .headers(auth_headers(creds)?)
            .send()
            .await
            .map_err(|err| AppError::Api(format!("Network error: {err}")))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(AppError::Api("Token expired. Run 'claude' to refresh.".into()));
        }
        if !status.is_success() {
            return Err(AppError::Api(format!("API error: {}", status.as_u16())));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl UsageApi for OAuthClient {
    async fn fetch_usage(&self, creds: &OAuthCredentials) -> Result<UsageData, AppError> {
        self.get_json(USAGE_PATH, creds).await
    }

    async fn fetch_profile(&self, creds: &OAuthCredentials) -> Result<Profile, AppError> {
        self.get_json(PROFILE_PATH, creds).await
    }
}
