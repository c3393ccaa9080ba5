use crate::domain::event::SideEffect;
use crate::domain::ports::Downstream;
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Records side effects in the log only. Used when no bot endpoint is configured.
#[derive(Debug, Default, Clone)]
pub struct LogDownstream;

#[async_trait]
impl Downstream for LogDownstream {
    async fn dispatch(&self, effect: &SideEffect) -> Result<()> {
        tracing::info!(
            order_code = effect.order_code(),
            effect = effect.kind(),
            "downstream effect (no bot endpoint configured)"
        );
        Ok(())
    }
}

/// Posts side effects as JSON to the bot's internal endpoint.
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    client: reqwest::Client,
    url: String,
}

impl HttpDownstream {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ReconcileError::ConfigError(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn dispatch(&self, effect: &SideEffect) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(effect)
            .send()
            .await
            .map_err(|e| ReconcileError::DownstreamError(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReconcileError::DownstreamError(format!(
                "bot endpoint answered {status}"
            )));
        }

        tracing::debug!(
            order_code = effect.order_code(),
            effect = effect.kind(),
            "downstream effect delivered"
        );
        Ok(())
    }
}
