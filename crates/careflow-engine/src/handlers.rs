//! Built-in action handler adapters.
//!
//! Real handler capabilities (messaging, lab ordering, referral
//! verification, …) live in external services. What ships here is the
//! generic webhook adapter for organizations that front those services
//! with an HTTP endpoint, and a logging handler for dry runs.

use async_trait::async_trait;

use careflow_core::config::WebhookConfig;
use careflow_rules::ActionConfig;

use crate::executor::{ActionHandler, HandlerOutcome};
use crate::pending::SubjectContext;

/// POSTs the action and subject context as JSON to a configured endpoint.
///
/// Status mapping: 2xx success, 408/429/5xx retryable, other 4xx terminal
/// (the payload will not get better on retry). Transport errors are
/// retryable.
pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookHandler {
    pub fn new(url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(&config.url, config.headers.clone())
    }
}

#[async_trait]
impl ActionHandler for WebhookHandler {
    async fn execute(&self, config: &ActionConfig, context: &SubjectContext) -> HandlerOutcome {
        let body = serde_json::json!({
            "action": config,
            "subject": context,
        });

        let mut req = self.client.post(&self.url).json(&body);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                return HandlerOutcome::RetryableFailure {
                    detail: format!("webhook send failed: {e}"),
                };
            }
        };

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("🌐 Webhook accepted {} for {}", config.action_type(), context.subject_id);
            return HandlerOutcome::Success {
                detail: Some(format!("webhook {status}")),
            };
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = format!("webhook {status}: {body}");
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            HandlerOutcome::RetryableFailure { detail }
        } else {
            HandlerOutcome::TerminalFailure { detail }
        }
    }
}

/// Logs the action and reports success. Useful when standing up an
/// environment before any real handler endpoints exist.
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn execute(&self, config: &ActionConfig, context: &SubjectContext) -> HandlerOutcome {
        tracing::info!(
            "📢 [dry-run] {} for {} ({})",
            config.action_type(),
            context.subject_id,
            context.subject_type
        );
        HandlerOutcome::Success {
            detail: Some("logged".into()),
        }
    }
}
