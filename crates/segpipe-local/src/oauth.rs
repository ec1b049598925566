//! Access-token acquisition via the OAuth2 client-credentials grant.

use segpipe_core::{Error, Result, StaticToken, TokenSource};
use serde::Deserialize;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Clone)]
pub struct ClientCredentials {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
}

// Keep the secret out of debug output.
impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let client_id = env("SEGPIPE_API_KEY")
            .ok_or_else(|| Error::NotConfigured("missing SEGPIPE_API_KEY".to_string()))?;
        let client_secret = env("SEGPIPE_SECRET_KEY")
            .ok_or_else(|| Error::NotConfigured("missing SEGPIPE_SECRET_KEY".to_string()))?;
        let endpoint = env("SEGPIPE_TOKEN_ENDPOINT")
            .unwrap_or_else(|| "https://aip.baidubce.com/oauth/2.0/token".to_string());
        Ok(Self::new(client, endpoint, client_id, client_secret))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait::async_trait]
impl TokenSource for ClientCredentials {
    async fn access_token(&self) -> Result<String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::TokenAcquisition(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::TokenAcquisition(format!(
                "token endpoint HTTP {status}"
            )));
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::TokenAcquisition(format!("malformed token response: {e}")))?;
        match parsed.access_token.filter(|t| !t.trim().is_empty()) {
            Some(t) => {
                tracing::info!("acquired access token");
                Ok(t)
            }
            None => Err(Error::TokenAcquisition(format!(
                "token response has no access_token{}",
                parsed
                    .error_description
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            ))),
        }
    }
}

/// `SEGPIPE_ACCESS_TOKEN` if set, otherwise client credentials from the environment.
pub fn token_source_from_env(client: reqwest::Client) -> Result<Box<dyn TokenSource>> {
    if let Some(t) = env("SEGPIPE_ACCESS_TOKEN") {
        return Ok(Box::new(StaticToken(t)));
    }
    Ok(Box::new(ClientCredentials::from_env(client)?))
}
