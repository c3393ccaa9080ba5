//! Wire format of the SHKeeper REST API.

use crate::domain::ids::string_or_number;
use crate::domain::order::CryptoAmount;
use crate::domain::ports::{Invoice, InvoiceRequest, InvoiceState, InvoiceStatus};
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Every response carries `status`; failures add a `message`.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl Envelope {
    pub fn into_error(self) -> Option<ReconcileError> {
        if self.status.eq_ignore_ascii_case("error") {
            Some(ReconcileError::GatewayError(
                self.message
                    .unwrap_or_else(|| "gateway reported an error".to_string()),
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateInvoiceBody<'a> {
    pub external_id: &'a str,
    pub fiat: &'a str,
    pub amount: Decimal,
    pub crypto: &'a str,
    pub callback_url: &'a str,
}

impl<'a> From<&'a InvoiceRequest> for CreateInvoiceBody<'a> {
    fn from(request: &'a InvoiceRequest) -> Self {
        Self {
            external_id: &request.external_id,
            fiat: &request.fiat_currency,
            amount: request.fiat_amount,
            crypto: &request.crypto,
            callback_url: &request.callback_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceResponse {
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    pub invoice_id: String,
    pub crypto: String,
    pub amount: CryptoAmount,
    #[serde(alias = "wallet")]
    pub address: String,
    #[serde(default)]
    pub exchange_rate: Option<Decimal>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<CreateInvoiceResponse> for Invoice {
    fn from(response: CreateInvoiceResponse) -> Self {
        Self {
            invoice_id: response.invoice_id,
            crypto: response.crypto,
            crypto_amount: response.amount,
            address: response.address,
            exchange_rate: response.exchange_rate,
            expires_at: response.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InvoiceStatusResponse {
    pub invoice: InvoiceBody,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceBody {
    #[serde(alias = "invoice_id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    pub status: String,
    #[serde(default, alias = "txid")]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub confirmations: Option<u64>,
}

impl From<InvoiceBody> for InvoiceStatus {
    fn from(body: InvoiceBody) -> Self {
        Self {
            state: parse_state(&body.status),
            invoice_id: body.id,
            external_id: body.external_id,
            tx_hash: body.tx_hash,
            confirmations: body.confirmations,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CryptoListResponse {
    pub crypto: Vec<String>,
}

/// Maps gateway invoice states onto the reconciler's vocabulary.
pub fn parse_state(raw: &str) -> InvoiceState {
    match raw.to_ascii_uppercase().as_str() {
        "PAID" | "OVERPAID" => InvoiceState::Paid,
        "CONFIRMED" => InvoiceState::Confirmed,
        "EXPIRED" => InvoiceState::Expired,
        "FAILED" | "CANCELLED" | "CANCELED" => InvoiceState::Failed,
        "UNPAID" | "PENDING" | "PARTIAL" => InvoiceState::Pending,
        other => {
            tracing::warn!(state = other, "unknown invoice state, treating as pending");
            InvoiceState::Pending
        }
    }
}

/// Decodes a gateway response body, surfacing `{"status":"error"}` envelopes.
pub fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| {
        ReconcileError::GatewayError(format!("unreadable gateway response: {e}"))
    })?;
    if let Some(error) = envelope.into_error() {
        return Err(error);
    }
    serde_json::from_slice(body)
        .map_err(|e| ReconcileError::GatewayError(format!("unexpected gateway response: {e}")))
}
