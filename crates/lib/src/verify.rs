//! Backend verification client (POST /verify).
//!
//! One request per session start. An unauthorized answer is fatal; a timeout is
//! only retried through the explicit user retry path, never automatically,
//! since repeated verification races could mask a real unauthorized state.

use crate::identity::Identity;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification rejected: {0}")]
    Unauthorized(String),
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),
    #[error("verification request failed: {0}")]
    Network(String),
}

/// Client for the backend authorization endpoint.
#[derive(Clone)]
pub struct VerifyClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl VerifyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    /// POST /verify with the host identity. The timeout races the request;
    /// whichever settles first wins and the loser is abandoned.
    pub async fn verify(&self, identity: Identity) -> Result<(), VerifyError> {
        let url = format!("{}/verify", self.base_url);
        let body = serde_json::json!({ "telegramId": identity.to_string() });
        let request = self.client.post(&url).json(&body).send();
        let res = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| VerifyError::Timeout(self.timeout))?
            .map_err(|e| VerifyError::Network(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VerifyError::Unauthorized(format!("{} {}", status, body)));
        }
        Ok(())
    }
}
