use crate::domain::ids::optional_string_or_number;
use crate::domain::order::OrderStatus;
use crate::error::{ReconcileError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentEvent {
    Paid,
    Confirmed,
    Expired,
    Failed,
}

impl fmt::Display for PaymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentEvent::Paid => "paid",
            PaymentEvent::Confirmed => "confirmed",
            PaymentEvent::Expired => "expired",
            PaymentEvent::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A payment-status callback delivered by the gateway.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WebhookNotification {
    pub event: PaymentEvent,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub invoice_id: Option<String>,
    /// The order code the invoice was created for.
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub confirmations: Option<u64>,
}

impl WebhookNotification {
    /// Parses a raw callback body. At least one of `invoice_id` or `external_id` is required.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let notification: Self = serde_json::from_slice(body)
            .map_err(|e| ReconcileError::MalformedPayload(e.to_string()))?;
        if notification.invoice_id().is_none() && notification.external_id().is_none() {
            return Err(ReconcileError::MalformedPayload(
                "either invoice_id or external_id is required".to_string(),
            ));
        }
        Ok(notification)
    }

    pub fn invoice_id(&self) -> Option<&str> {
        self.invoice_id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// Work handed to the bot's order subsystem once an order mutation is committed.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    PaymentConfirmed {
        order_code: String,
        invoice_id: String,
        tx_hash: Option<String>,
        confirmations: u64,
    },
    ReleaseInventory {
        order_code: String,
        status: OrderStatus,
    },
}

impl SideEffect {
    pub fn order_code(&self) -> &str {
        match self {
            SideEffect::PaymentConfirmed { order_code, .. }
            | SideEffect::ReleaseInventory { order_code, .. } => order_code,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SideEffect::PaymentConfirmed { .. } => "payment_confirmed",
            SideEffect::ReleaseInventory { .. } => "release_inventory",
        }
    }
}
