use super::event::{PaymentEvent, SideEffect};
use super::order::{CryptoAmount, Order};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Persistence for orders.
///
/// Implementations keep an invoice id index so callbacks carrying only the
/// gateway's invoice id can be resolved.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn store(&self, order: Order) -> Result<()>;
    async fn get(&self, code: &str) -> Result<Option<Order>>;
    async fn find_by_invoice(&self, invoice_id: &str) -> Result<Option<Order>>;
    async fn all_orders(&self) -> Result<Vec<Order>>;
}

pub type OrderStoreRef = Arc<dyn OrderStore>;

/// The bot's order subsystem: payment notifications and inventory release.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn dispatch(&self, effect: &SideEffect) -> Result<()>;
}

pub type DownstreamRef = Arc<dyn Downstream>;

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRequest {
    pub external_id: String,
    pub fiat_amount: Decimal,
    pub fiat_currency: String,
    pub crypto: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub invoice_id: String,
    pub crypto: String,
    pub crypto_amount: CryptoAmount,
    pub address: String,
    pub exchange_rate: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Gateway-side state of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Pending,
    Paid,
    Confirmed,
    Expired,
    Failed,
}

impl InvoiceState {
    /// The webhook event equivalent to this state, if it reports anything.
    pub fn as_event(&self) -> Option<PaymentEvent> {
        match self {
            InvoiceState::Pending => None,
            InvoiceState::Paid => Some(PaymentEvent::Paid),
            InvoiceState::Confirmed => Some(PaymentEvent::Confirmed),
            InvoiceState::Expired => Some(PaymentEvent::Expired),
            InvoiceState::Failed => Some(PaymentEvent::Failed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceStatus {
    pub invoice_id: String,
    pub external_id: Option<String>,
    pub state: InvoiceState,
    pub tx_hash: Option<String>,
    pub confirmations: Option<u64>,
}

/// Outbound calls to the payment gateway.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice>;
    async fn invoice_status(&self, invoice_id: &str) -> Result<InvoiceStatus>;
    async fn list_cryptos(&self) -> Result<Vec<String>>;
}

pub type GatewayRef = Arc<dyn GatewayApi>;
