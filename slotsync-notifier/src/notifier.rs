//! Notification boundary.
//!
//! Every cycle summary goes out through a [`Notifier`]. Failures come back
//! as notification-domain [`ClassifiedError`]s; callers log them and carry
//! on, a notification never fails a cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use slotsync_core::{ClassifiedError, Config, CycleSummary, ErrorCode, ErrorDomain};
use tokio_util::sync::CancellationToken;

use crate::engine::{RenderedSummary, SummaryRenderer};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        summary: &CycleSummary,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedError>;
}

// ---------------------------------------------------------------------------
// LogNotifier
// ---------------------------------------------------------------------------

/// Writes the rendered headline to the log. Used when no webhook is set.
#[derive(Debug)]
pub struct LogNotifier {
    renderer: Arc<SummaryRenderer>,
}

impl LogNotifier {
    pub fn new(renderer: Arc<SummaryRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        summary: &CycleSummary,
        _cancel: &CancellationToken,
    ) -> Result<(), ClassifiedError> {
        let RenderedSummary { headline, .. } = self.renderer.render(summary)?;
        if summary.fatal || summary.error.is_some() {
            tracing::error!(cycle_id = %summary.cycle_id, "{headline}");
        } else if summary.failed > 0 {
            tracing::warn!(cycle_id = %summary.cycle_id, "{headline}");
        } else {
            tracing::info!(cycle_id = %summary.cycle_id, "{headline}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebhookNotifier
// ---------------------------------------------------------------------------

/// JSON body posted to the webhook.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    /// Rendered one-liner; chat webhooks display this field.
    pub text: &'a str,
    pub body: &'a str,
    pub summary: &'a CycleSummary,
}

/// POSTs each summary as JSON to a configured URL.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    renderer: Arc<SummaryRenderer>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        renderer: Arc<SummaryRenderer>,
    ) -> Result<Self, ClassifiedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("slotsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ClassifiedError::configuration(
                    ErrorCode::InvalidValue,
                    format!("webhook client: {e}"),
                )
            })?;
        Ok(Self {
            client,
            url: url.into(),
            renderer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, summary: &CycleSummary) -> Result<(), ClassifiedError> {
        let rendered = self.renderer.render(summary)?;
        let payload = WebhookPayload {
            text: &rendered.headline,
            body: &rendered.body,
            summary,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(cycle_id = %summary.cycle_id, %status, "summary delivered");
            return Ok(());
        }
        let code = match status.as_u16() {
            401 | 403 => ErrorCode::Auth,
            _ => ErrorCode::Send,
        };
        Err(ClassifiedError::notification(code, format!("webhook answered {status}"))
            .with_retryable(status.is_server_error()))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        summary: &CycleSummary,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(ClassifiedError::cancelled(ErrorDomain::Notification, "webhook delivery"))
            }
            res = self.post(summary) => res,
        }
    }
}

fn classify_transport(err: reqwest::Error) -> ClassifiedError {
    let code = if err.is_timeout() {
        ErrorCode::Timeout
    } else if err.is_connect() {
        ErrorCode::Connection
    } else {
        ErrorCode::Send
    };
    ClassifiedError::notification(code, format!("webhook request failed: {err}"))
}

/// Notifier for `config`: a webhook when `webhook_url` is set, the log
/// otherwise. Template overrides come from `template_dir`.
pub fn notifier_from_config(config: &Config) -> Result<Arc<dyn Notifier>, ClassifiedError> {
    let renderer = Arc::new(
        SummaryRenderer::with_template_dir(config.template_dir.as_deref()).map_err(|e| {
            ClassifiedError::configuration(ErrorCode::InvalidValue, format!("template_dir: {e}"))
        })?,
    );
    Ok(match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            config.request_timeout(),
            renderer,
        )?),
        None => Arc::new(LogNotifier::new(renderer)),
    })
}
