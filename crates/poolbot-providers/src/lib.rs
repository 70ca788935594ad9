//! Poolbot Providers
//!
//! Upstream conversational-AI capability: session credential derivation,
//! per-account clients, and server-tracked conversations.
//! Ships an OpenAI-compatible HTTP client and a subprocess-backed deriver.

mod derive;

pub use derive::CommandDeriver;

use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Upstream transport error: {0}")]
    Transport(String),
    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Upstream response decode failed: {0}")]
    Decode(String),
    #[error("Session credential derivation failed: {0}")]
    Derivation(String),
}

impl UpstreamError {
    /// Status code reported by the upstream service, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Text that came back from the upstream side of the exchange. Timeouts
    /// and derivation failures carry only locally produced text.
    pub fn upstream_text(&self) -> Option<&str> {
        match self {
            UpstreamError::Http { body, .. } => Some(body),
            UpstreamError::Transport(text) | UpstreamError::Decode(text) => Some(text),
            UpstreamError::Timeout(_) | UpstreamError::Derivation(_) => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        // The request URL (host, port) must not leak into status matching.
        let err = err.without_url();
        if let Some(status) = err.status() {
            return UpstreamError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        UpstreamError::Transport(err.to_string())
    }
}

/// Turns an identity + secret pair into a session credential. Slow and
/// external; implementations bound their own runtime.
#[async_trait::async_trait]
pub trait SessionDeriver: Send + Sync {
    async fn derive(&self, identity: &str, secret: &str) -> Result<String, UpstreamError>;
}

/// Live handle to the upstream service bound to one resolved credential.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn open_conversation(&self) -> Result<Arc<dyn Conversation>, UpstreamError>;
}

/// Multi-turn dialogue context opened against one account.
#[async_trait::async_trait]
pub trait Conversation: Send + Sync {
    fn id(&self) -> &str;
    async fn send(&self, text: &str) -> Result<String, UpstreamError>;
}

/// Builds the client handle for an account once its credential is known.
pub trait ClientFactory: Send + Sync {
    fn connect(
        &self,
        identity: &str,
        session_credential: &str,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

pub struct OpenAICompatibleFactory {
    http: Client,
    base_url: String,
    model: String,
}

impl OpenAICompatibleFactory {
    pub fn new(base_url: &str, model: &str) -> Result<Self, UpstreamError> {
        let http = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

impl ClientFactory for OpenAICompatibleFactory {
    fn connect(
        &self,
        identity: &str,
        session_credential: &str,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        if session_credential.trim().is_empty() {
            return Err(UpstreamError::Derivation(format!(
                "empty session credential for {}",
                identity
            )));
        }
        Ok(Arc::new(OpenAICompatibleClient {
            http: self.http.clone(),
            identity: identity.to_string(),
            session_credential: session_credential.to_string(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
        }))
    }
}

pub struct OpenAICompatibleClient {
    http: Client,
    identity: String,
    session_credential: String,
    base_url: String,
    model: String,
}

impl OpenAICompatibleClient {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait::async_trait]
impl UpstreamClient for OpenAICompatibleClient {
    async fn open_conversation(&self) -> Result<Arc<dyn Conversation>, UpstreamError> {
        let conversation = HttpConversation {
            id: uuid::Uuid::new_v4().to_string(),
            http: self.http.clone(),
            url: format!("{}/chat/completions", self.base_url),
            session_credential: self.session_credential.clone(),
            model: self.model.clone(),
            history: Mutex::new(Vec::new()),
        };
        tracing::debug!(
            account = %self.identity,
            conversation = %conversation.id,
            "Opened upstream conversation"
        );
        Ok(Arc::new(conversation))
    }
}

pub struct HttpConversation {
    id: String,
    http: Client,
    url: String,
    session_credential: String,
    model: String,
    history: Mutex<Vec<ChatMessage>>,
}

impl HttpConversation {
    fn parse_reply(response: &serde_json::Value) -> Result<String, UpstreamError> {
        if let Some(error) = response.get("error") {
            return Err(UpstreamError::Decode(format!("API error: {}", error)));
        }

        let choice = response
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .ok_or_else(|| UpstreamError::Decode("missing 'choices' in response".to_string()))?;

        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| UpstreamError::Decode("missing message content".to_string()))
    }

    async fn request(&self, history: &[ChatMessage]) -> Result<String, UpstreamError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": history,
        });

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.session_credential)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw_body = response.text().await?;
        if !status.is_success() {
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body: truncate_for_error(&raw_body, 600),
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(&raw_body).map_err(|e| {
            UpstreamError::Decode(format!("{} | body={}", e, truncate_for_error(&raw_body, 600)))
        })?;
        Self::parse_reply(&parsed)
    }
}

#[async_trait::async_trait]
impl Conversation for HttpConversation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, text: &str) -> Result<String, UpstreamError> {
        // Held for the whole turn so replies stay in order within the dialogue.
        let mut history = self.history.lock().await;
        history.push(ChatMessage::user(text));

        let result = self.request(&history).await;
        match result {
            Ok(reply) => {
                history.push(ChatMessage::assistant(&reply));
                Ok(reply)
            }
            Err(err) => {
                history.pop();
                Err(err)
            }
        }
    }
}
