//! Test doubles shared by the application tests.

use crate::domain::event::SideEffect;
use crate::domain::ports::{
    Downstream, GatewayApi, Invoice, InvoiceRequest, InvoiceState, InvoiceStatus,
};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Records delivered effects; the first `failures` dispatches fail.
#[derive(Default)]
pub struct Recorder {
    pub effects: Mutex<Vec<SideEffect>>,
    failures: u32,
    calls: AtomicU32,
}

impl Recorder {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Downstream for Recorder {
    async fn dispatch(&self, effect: &SideEffect) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ReconcileError::DownstreamError("bot offline".to_string()));
        }
        self.effects.lock().await.push(effect.clone());
        Ok(())
    }
}

/// In-process gateway: issues sequential invoices and answers status
/// queries from a table the test fills in.
pub struct FakeGateway {
    pub cryptos: Vec<String>,
    pub created: Mutex<Vec<InvoiceRequest>>,
    pub statuses: Mutex<HashMap<String, InvoiceStatus>>,
    pub status_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new(cryptos: &[&str]) -> Self {
        Self {
            cryptos: cryptos.iter().map(|c| c.to_string()).collect(),
            created: Mutex::default(),
            statuses: Mutex::default(),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_status(
        &self,
        invoice_id: &str,
        state: InvoiceState,
        tx_hash: Option<&str>,
        confirmations: Option<u64>,
    ) {
        self.statuses.lock().await.insert(
            invoice_id.to_string(),
            InvoiceStatus {
                invoice_id: invoice_id.to_string(),
                external_id: None,
                state,
                tx_hash: tx_hash.map(str::to_string),
                confirmations,
            },
        );
    }
}

#[async_trait]
impl GatewayApi for FakeGateway {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        let mut created = self.created.lock().await;
        created.push(request.clone());
        Ok(Invoice {
            invoice_id: format!("inv-{}", created.len()),
            crypto: request.crypto.clone(),
            crypto_amount: "0.00100000".parse()?,
            address: format!("addr-{}", request.external_id),
            exchange_rate: None,
            expires_at: None,
        })
    }

    async fn invoice_status(&self, invoice_id: &str) -> Result<InvoiceStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .await
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| ReconcileError::GatewayError(format!("unknown invoice {invoice_id}")))
    }

    async fn list_cryptos(&self) -> Result<Vec<String>> {
        Ok(self.cryptos.clone())
    }
}
