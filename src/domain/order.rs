use crate::domain::event::{PaymentEvent, SideEffect};
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A crypto-denominated amount, always carried with 8 decimal places.
///
/// Gateways quote amounts as strings with varying precision; anything finer
/// than 8 places is rounded half-to-even on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CryptoAmount(Decimal);

impl CryptoAmount {
    pub const SCALE: u32 = 8;

    pub fn new(value: Decimal) -> Result<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(ReconcileError::ValidationError(
                "Crypto amount must not be negative".to_string(),
            ));
        }
        let mut value =
            value.round_dp_with_strategy(Self::SCALE, RoundingStrategy::MidpointNearestEven);
        value.rescale(Self::SCALE);
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for CryptoAmount {
    type Error = ReconcileError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl FromStr for CryptoAmount {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        let value = Decimal::from_str(s.trim()).map_err(|e| {
            ReconcileError::ValidationError(format!("Invalid crypto amount '{s}': {e}"))
        })?;
        Self::new(value)
    }
}

impl fmt::Display for CryptoAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Amounts travel as strings so no precision is lost through f64.
impl Serialize for CryptoAmount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CryptoAmount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Manual,
    Gateway,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Reserved,
    PaidUnconfirmed,
    Confirmed,
    Expired,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Expired | OrderStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Reserved => "reserved",
            OrderStatus::PaidUnconfirmed => "paid_unconfirmed",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Expired => "expired",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice data issued by the payment gateway for a single order.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GatewayDetails {
    pub invoice_id: String,
    /// Crypto currency code, e.g. `BTC`.
    pub crypto: String,
    pub crypto_amount: CryptoAmount,
    /// One-time payment address.
    pub address: String,
    /// Set once, when the payment is first observed.
    pub tx_hash: Option<String>,
    /// Never decreases.
    pub confirmations: u64,
}

impl GatewayDetails {
    pub fn new(
        invoice_id: impl Into<String>,
        crypto: impl Into<String>,
        crypto_amount: CryptoAmount,
        address: impl Into<String>,
    ) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            crypto: crypto.into(),
            crypto_amount,
            address: address.into(),
            tx_hash: None,
            confirmations: 0,
        }
    }

    /// Folds observed payment data into the details. Returns whether anything changed.
    pub fn record_payment(&mut self, tx_hash: Option<&str>, confirmations: Option<u64>) -> bool {
        let mut changed = false;

        if let Some(hash) = tx_hash.filter(|h| !h.is_empty()) {
            if self.tx_hash.is_none() {
                self.tx_hash = Some(hash.to_string());
                changed = true;
            } else if self.tx_hash.as_deref() != Some(hash) {
                tracing::warn!(
                    invoice_id = %self.invoice_id,
                    stored = ?self.tx_hash,
                    received = %hash,
                    "ignoring conflicting transaction hash"
                );
            }
        }

        if let Some(count) = confirmations
            && count > self.confirmations
        {
            self.confirmations = count;
            changed = true;
        }

        changed
    }
}

/// Result of applying a payment event to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The status moved.
    Applied { from: OrderStatus, to: OrderStatus },
    /// Same status, newer payment data (higher confirmation count or first tx hash).
    Refreshed,
    /// A repeat of the transition that already happened.
    Duplicate,
    /// Stale or terminal state; nothing changed.
    Ignored { reason: String },
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied { .. } => "applied",
            ApplyOutcome::Refreshed => "refreshed",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Ignored { .. } => "ignored",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Applied { .. } | ApplyOutcome::Refreshed
        )
    }
}

/// A shop order as seen by payment reconciliation.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Order {
    /// Order code, sent to the gateway as the invoice `external_id`.
    pub code: String,
    pub payment_method: PaymentMethod,
    pub fiat_amount: Decimal,
    pub fiat_currency: String,
    pub status: OrderStatus,
    pub gateway: Option<GatewayDetails>,
    /// Inventory is held until this deadline or a terminal status.
    pub reserved_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Side effect committed with the last transition and not yet delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_effect: Option<SideEffect>,
}

impl Order {
    pub fn reserve(
        code: impl Into<String>,
        payment_method: PaymentMethod,
        fiat_amount: Decimal,
        fiat_currency: impl Into<String>,
        reserved_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            code: code.into(),
            payment_method,
            fiat_amount,
            fiat_currency: fiat_currency.into(),
            status: OrderStatus::Reserved,
            gateway: None,
            reserved_until,
            created_at: now,
            updated_at: now,
            pending_effect: None,
        }
    }

    pub fn invoice_id(&self) -> Option<&str> {
        self.gateway.as_ref().map(|g| g.invoice_id.as_str())
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Reserved && self.reserved_until < now
    }

    /// Checks that an invoice may still be attached: a reserved gateway order without one.
    pub fn ensure_invoiceable(&self) -> Result<()> {
        if self.payment_method != PaymentMethod::Gateway {
            return Err(ReconcileError::ValidationError(format!(
                "Order {} is paid manually",
                self.code
            )));
        }
        if let Some(existing) = &self.gateway {
            return Err(ReconcileError::ValidationError(format!(
                "Order {} already has invoice {}",
                self.code, existing.invoice_id
            )));
        }
        if self.status != OrderStatus::Reserved {
            return Err(ReconcileError::InvalidTransition(format!(
                "Order {} is {}, cannot attach an invoice",
                self.code, self.status
            )));
        }
        Ok(())
    }

    /// Attaches the gateway invoice. Allowed exactly once, on a reserved gateway order.
    pub fn attach_invoice(&mut self, mut details: GatewayDetails, now: DateTime<Utc>) -> Result<()> {
        self.ensure_invoiceable()?;
        details.tx_hash = None;
        details.confirmations = 0;
        self.gateway = Some(details);
        self.updated_at = now;
        Ok(())
    }

    /// Expires an overdue reservation.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != OrderStatus::Reserved {
            return Err(ReconcileError::InvalidTransition(format!(
                "Order {} is {}, cannot expire",
                self.code, self.status
            )));
        }
        self.status = OrderStatus::Expired;
        self.updated_at = now;
        Ok(())
    }

    /// Applies a gateway payment event.
    ///
    /// Terminal orders are never moved; a repeat of the transition that made
    /// them terminal reports `Duplicate`, anything else `Ignored`. A repeated
    /// `confirmed` may still raise the stored confirmation count.
    pub fn apply(
        &mut self,
        event: PaymentEvent,
        tx_hash: Option<&str>,
        confirmations: Option<u64>,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        let from = self.status;
        let Some(details) = self.gateway.as_mut() else {
            return ApplyOutcome::Ignored {
                reason: format!("order {} has no gateway invoice", self.code),
            };
        };

        let outcome = match (from, event) {
            (OrderStatus::Reserved, PaymentEvent::Paid) => {
                details.record_payment(tx_hash, Some(confirmations.unwrap_or(0)));
                ApplyOutcome::Applied {
                    from,
                    to: OrderStatus::PaidUnconfirmed,
                }
            }
            (OrderStatus::Reserved | OrderStatus::PaidUnconfirmed, PaymentEvent::Confirmed) => {
                details.record_payment(tx_hash, confirmations);
                ApplyOutcome::Applied {
                    from,
                    to: OrderStatus::Confirmed,
                }
            }
            (OrderStatus::Reserved, PaymentEvent::Expired) => ApplyOutcome::Applied {
                from,
                to: OrderStatus::Expired,
            },
            (OrderStatus::Reserved | OrderStatus::PaidUnconfirmed, PaymentEvent::Failed) => {
                ApplyOutcome::Applied {
                    from,
                    to: OrderStatus::Cancelled,
                }
            }
            (OrderStatus::PaidUnconfirmed, PaymentEvent::Paid)
            | (OrderStatus::Confirmed, PaymentEvent::Confirmed) => {
                if details.record_payment(tx_hash, confirmations) {
                    ApplyOutcome::Refreshed
                } else {
                    ApplyOutcome::Duplicate
                }
            }
            (OrderStatus::Expired, PaymentEvent::Expired)
            | (OrderStatus::Cancelled, PaymentEvent::Failed) => ApplyOutcome::Duplicate,
            (OrderStatus::PaidUnconfirmed, PaymentEvent::Expired) => ApplyOutcome::Ignored {
                reason: "payment already observed, expiry ignored".to_string(),
            },
            (status, event) => ApplyOutcome::Ignored {
                reason: format!("{event} event on {status} order"),
            },
        };

        if let ApplyOutcome::Applied { to, .. } = outcome {
            self.status = to;
        }
        if outcome.is_mutation() {
            self.updated_at = now;
        }
        outcome
    }
}
