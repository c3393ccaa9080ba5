use super::models::{
    CreateInvoiceBody, CreateInvoiceResponse, CryptoListResponse, Envelope, InvoiceStatusResponse,
    decode,
};
use crate::domain::ports::{GatewayApi, Invoice, InvoiceRequest, InvoiceStatus};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

pub const API_KEY_HEADER: &str = "X-Shkeeper-Api-Key";

#[derive(Debug, Clone)]
pub struct ShkeeperConfig {
    /// Base URL of the gateway, e.g. `http://shkeeper:5000`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for ShkeeperConfig {
    fn default() -> Self {
        Self {
            base_url: "http://shkeeper:5000".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// REST client for the SHKeeper gateway.
#[derive(Debug, Clone)]
pub struct ShkeeperClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

/// Server-side failures may succeed on a later attempt; client errors will not.
pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

impl ShkeeperClient {
    pub fn new(config: ShkeeperConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| {
                ReconcileError::ConfigError(format!("failed to build HTTP client: {e}"))
            })?;
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ReconcileError::ConfigError(format!("invalid gateway URL '{}': {e}", config.base_url))
        })?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    /// Appends percent-encoded path segments to the base URL, keeping any base path.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ReconcileError::ConfigError(format!(
                    "gateway URL '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<Envelope>(&body)
                .ok()
                .and_then(|envelope| envelope.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).chars().take(200).collect());
            let kind = if is_retryable(status) {
                "retryable"
            } else {
                "permanent"
            };
            tracing::warn!(status = status.as_u16(), kind, "gateway request failed");
            return Err(ReconcileError::GatewayError(format!(
                "{kind} failure, gateway answered {status}: {detail}"
            )));
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl GatewayApi for ShkeeperClient {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        let body = self
            .send(
                self.client
                    .post(self.url(&["api", "v1", "invoice"])?)
                    .json(&CreateInvoiceBody::from(request)),
            )
            .await?;
        let invoice: Invoice = decode::<CreateInvoiceResponse>(&body)?.into();
        tracing::info!(
            external_id = %request.external_id,
            invoice_id = %invoice.invoice_id,
            crypto = %invoice.crypto,
            amount = %invoice.crypto_amount,
            "invoice created"
        );
        Ok(invoice)
    }

    async fn invoice_status(&self, invoice_id: &str) -> Result<InvoiceStatus> {
        let body = self
            .send(
                self.client
                    .get(self.url(&["api", "v1", "invoice", invoice_id])?),
            )
            .await?;
        Ok(decode::<InvoiceStatusResponse>(&body)?.invoice.into())
    }

    async fn list_cryptos(&self) -> Result<Vec<String>> {
        let body = self
            .send(self.client.get(self.url(&["api", "v1", "crypto"])?))
            .await?;
        Ok(decode::<CryptoListResponse>(&body)?.crypto)
    }
}
