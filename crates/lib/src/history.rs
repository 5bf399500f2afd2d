//! Conversation history loader (GET /messages).
//!
//! Each history entry is a driver request with zero or more nested dispatcher
//! replies. Entries are flattened into the message model; final ordering is the
//! timeline comparator's job, not arrival order.

use crate::identity::Identity;
use crate::timeline::{parse_server_time, Message};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// One prior driver request with its replies, as returned by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub content: String,
    pub created_at: String,
    #[serde(default)]
    pub replies: Vec<HistoryReply>,
}

/// A dispatcher reply nested under a history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryReply {
    pub reply_content: String,
    pub reply_at: String,
}

/// The endpoint answers with either a bare array or a `{ "messages": [...] }`
/// wrapper; both shapes are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Wrapped { messages: Vec<HistoryEntry> },
    Bare(Vec<HistoryEntry>),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Network(String),
    #[error("history request timed out after {0:?}")]
    Timeout(Duration),
    #[error("history payload could not be parsed: {0}")]
    Parse(String),
}

/// Parse a history response body in either accepted shape.
pub fn parse_history_body(body: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
    let parsed: HistoryResponse =
        serde_json::from_str(body).map_err(|e| HistoryError::Parse(e.to_string()))?;
    Ok(match parsed {
        HistoryResponse::Wrapped { messages } => messages,
        HistoryResponse::Bare(entries) => entries,
    })
}

/// Expand entries into one driver message each plus one dispatcher message per
/// reply, normalizing all server timestamps.
pub fn flatten_entries(entries: Vec<HistoryEntry>) -> Result<Vec<Message>, HistoryError> {
    let mut out = Vec::new();
    for entry in entries {
        let at = parse_server_time(&entry.created_at).map_err(|e| {
            HistoryError::Parse(format!("created_at {:?}: {}", entry.created_at, e))
        })?;
        out.push(Message::driver(entry.content, at));
        for reply in entry.replies {
            let at = parse_server_time(&reply.reply_at).map_err(|e| {
                HistoryError::Parse(format!("reply_at {:?}: {}", reply.reply_at, e))
            })?;
            out.push(Message::dispatcher(reply.reply_content, at));
        }
    }
    Ok(out)
}

/// Client for the conversation history endpoint.
#[derive(Clone)]
pub struct HistoryClient {
    base_url: String,
    timeout: Duration,
    limit: u32,
    client: reqwest::Client,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, limit: u32) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            timeout,
            limit,
            client: reqwest::Client::new(),
        }
    }

    /// GET /messages for the identity and flatten into messages.
    pub async fn load(&self, identity: Identity) -> Result<Vec<Message>, HistoryError> {
        let url = format!(
            "{}/messages?userId={}&limit={}",
            self.base_url, identity, self.limit
        );
        let request = self.client.get(&url).send();
        let res = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| HistoryError::Timeout(self.timeout))?
            .map_err(|e| HistoryError::Network(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(HistoryError::Network(format!("{} {}", status, body)));
        }
        let body = res
            .text()
            .await
            .map_err(|e| HistoryError::Network(e.to_string()))?;
        flatten_entries(parse_history_body(&body)?)
    }
}
