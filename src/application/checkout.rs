use crate::application::locks::OrderLocks;
use crate::domain::order::{GatewayDetails, Order, PaymentMethod};
use crate::domain::ports::{GatewayRef, InvoiceRequest, OrderStoreRef};
use crate::error::{ReconcileError, Result};
use chrono::{TimeDelta, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Opens gateway invoices for reserved orders.
pub struct Checkout {
    store: OrderStoreRef,
    locks: Arc<OrderLocks>,
    gateway: GatewayRef,
}

impl Checkout {
    pub fn new(store: OrderStoreRef, locks: Arc<OrderLocks>, gateway: GatewayRef) -> Self {
        Self {
            store,
            locks,
            gateway,
        }
    }

    /// Reserves a new gateway-paid order held for `hold_minutes`.
    pub async fn reserve(
        &self,
        code: &str,
        fiat_amount: Decimal,
        fiat_currency: &str,
        hold_minutes: i64,
    ) -> Result<Order> {
        if code.is_empty() {
            return Err(ReconcileError::ValidationError(
                "Order code must not be empty".to_string(),
            ));
        }
        if fiat_amount <= Decimal::ZERO {
            return Err(ReconcileError::ValidationError(
                "Order amount must be positive".to_string(),
            ));
        }
        let now = Utc::now();
        let reserved_until = TimeDelta::try_minutes(hold_minutes)
            .and_then(|hold| now.checked_add_signed(hold))
            .ok_or_else(|| {
                ReconcileError::ValidationError(format!(
                    "Hold of {hold_minutes} minutes is out of range"
                ))
            })?;

        let _guard = self.locks.lock(code).await;
        if self.store.get(code).await?.is_some() {
            return Err(ReconcileError::ValidationError(format!(
                "Order {code} already exists"
            )));
        }

        let order = Order::reserve(
            code,
            PaymentMethod::Gateway,
            fiat_amount,
            fiat_currency.to_uppercase(),
            reserved_until,
            now,
        );
        self.store.store(order.clone()).await?;
        tracing::info!(order_code = code, reserved_until = %order.reserved_until, "order reserved");
        Ok(order)
    }

    pub async fn order(&self, code: &str) -> Result<Order> {
        self.store
            .get(code)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("order {code}")))
    }

    /// Creates the gateway invoice for `code` and attaches it to the order.
    ///
    /// The order lock is held across the gateway call so two concurrent
    /// checkouts cannot both create an invoice for the same order.
    pub async fn open_invoice(&self, code: &str, crypto: &str, callback_url: &str) -> Result<Order> {
        let _guard = self.locks.lock(code).await;

        let mut order = self
            .store
            .get(code)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("order {code}")))?;
        order.ensure_invoiceable()?;

        let crypto = crypto.to_uppercase();
        let offered = self.gateway.list_cryptos().await?;
        if !offered.iter().any(|c| c.eq_ignore_ascii_case(&crypto)) {
            return Err(ReconcileError::ValidationError(format!(
                "{crypto} is not offered by the gateway (available: {})",
                offered.join(", ")
            )));
        }

        let invoice = self
            .gateway
            .create_invoice(&InvoiceRequest {
                external_id: order.code.clone(),
                fiat_amount: order.fiat_amount,
                fiat_currency: order.fiat_currency.clone(),
                crypto: crypto.clone(),
                callback_url: callback_url.to_string(),
            })
            .await?;

        let details = GatewayDetails::new(
            invoice.invoice_id,
            invoice.crypto,
            invoice.crypto_amount,
            invoice.address,
        );
        order.attach_invoice(details, Utc::now())?;
        self.store.store(order.clone()).await?;

        tracing::info!(
            order_code = code,
            invoice_id = order.invoice_id(),
            crypto = crypto.as_str(),
            "invoice attached"
        );
        Ok(order)
    }
}
