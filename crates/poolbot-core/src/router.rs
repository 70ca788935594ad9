use crate::error::RouteError;
use crate::registry::ConversationRegistry;
use poolbot_config::{RetryConfig, RouterConfig};
use poolbot_providers::UpstreamError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

pub const SERVER_BUSY_MESSAGE: &str =
    "OpenAI 服务器繁忙，请稍后再试| The OpenAI server is busy, please try again later";
pub const RATE_LIMITED_MESSAGE: &str =
    "OpenAI 服务器限流，请稍后再试| The OpenAI server was limted, please try again later";
pub const UNKNOWN_ERROR_MESSAGE: &str = "未知错误，请看日志 | Error unknown, please see the log";

/// User-facing category of a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ServerBusy,
    RateLimited,
    Unknown,
}

/// Matched in this order when the status has to be read out of error text.
const STATUS_MARKERS: [(&str, ErrorClass); 3] = [
    ("503", ErrorClass::ServerBusy),
    ("429", ErrorClass::RateLimited),
    ("500", ErrorClass::ServerBusy),
];

impl ErrorClass {
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            500 | 503 => Some(ErrorClass::ServerBusy),
            429 => Some(ErrorClass::RateLimited),
            _ => None,
        }
    }

    pub fn from_text(text: &str) -> Self {
        STATUS_MARKERS
            .iter()
            .find(|(code, _)| text.contains(code))
            .map(|(_, class)| *class)
            .unwrap_or(ErrorClass::Unknown)
    }

    /// Uses the structured status when the upstream reported one, otherwise
    /// looks for a known status code inside the text the upstream returned.
    /// Local failures (timeouts, derivation, empty pool) are always unknown.
    pub fn classify(err: &RouteError) -> Self {
        let RouteError::Upstream(upstream) = err else {
            return ErrorClass::Unknown;
        };
        if let Some(status) = upstream.status() {
            return Self::from_status(status).unwrap_or(ErrorClass::Unknown);
        }
        upstream
            .upstream_text()
            .map(Self::from_text)
            .unwrap_or(ErrorClass::Unknown)
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorClass::ServerBusy => SERVER_BUSY_MESSAGE,
            ErrorClass::RateLimited => RATE_LIMITED_MESSAGE,
            ErrorClass::Unknown => UNKNOWN_ERROR_MESSAGE,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::ServerBusy | ErrorClass::RateLimited)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1);
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = factor.saturating_pow(exponent);
        self.initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// Sends chat text for a thread through its bound conversation and always
/// answers with text to deliver back.
pub struct MessageRouter {
    registry: Arc<ConversationRegistry>,
    send_timeout: Duration,
    retry: RetryPolicy,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConversationRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
            retry: RetryPolicy::none(),
        }
    }

    pub fn from_config(registry: Arc<ConversationRegistry>, config: &RouterConfig) -> Self {
        Self::new(registry, Duration::from_secs(config.send_timeout_secs))
            .with_retry(RetryPolicy::from(&config.retry))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.registry
    }

    /// Never fails: a failed send evicts the thread's conversation and the
    /// classified message is returned in place of a reply.
    pub async fn route(&self, thread_id: &str, text: &str) -> String {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.send(thread_id, text).await {
                Ok(reply) => return reply,
                Err(err) => err,
            };

            let class = ErrorClass::classify(&err);
            warn!(
                thread_id = %thread_id,
                class = ?class,
                attempt = attempt,
                error = %err,
                "Send failed"
            );

            if class.is_transient() && attempt < self.retry.max_retries {
                attempt += 1;
                let delay = self.retry.delay_for(attempt);
                info!(
                    thread_id = %thread_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying on a fresh conversation"
                );
                sleep(delay).await;
                continue;
            }

            return class.message().to_string();
        }
    }

    /// One attempt: resolve, send under the timeout, evict on failure.
    pub async fn send(&self, thread_id: &str, text: &str) -> Result<String, RouteError> {
        let entry = self.registry.resolve(thread_id).await?;

        let outcome = match timeout(self.send_timeout, entry.conversation().send(text)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.send_timeout)),
        };

        match outcome {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.registry
                    .evict_if_current(thread_id, entry.conversation_id())
                    .await;
                warn!(
                    thread_id = %thread_id,
                    account = %entry.account().identity(),
                    conversation = %entry.conversation_id(),
                    error = %err,
                    "Upstream send failed, conversation evicted"
                );
                Err(err.into())
            }
        }
    }
}
