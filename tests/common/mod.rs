#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use serde_json::Value;
use shkeeper_reconciler::application::checkout::Checkout;
use shkeeper_reconciler::application::locks::OrderLocks;
use shkeeper_reconciler::application::outbox::{Outbox, OutboxHandle, OutboxStats, RetryPolicy};
use shkeeper_reconciler::application::reconciler::Reconciler;
use shkeeper_reconciler::domain::event::SideEffect;
use shkeeper_reconciler::domain::order::{GatewayDetails, Order, PaymentMethod};
use shkeeper_reconciler::domain::ports::{
    Downstream, GatewayApi, Invoice, InvoiceRequest, InvoiceStatus, OrderStore,
};
use shkeeper_reconciler::error::{ReconcileError, Result};
use shkeeper_reconciler::infrastructure::in_memory::InMemoryOrderStore;
use shkeeper_reconciler::interfaces::http::orders::{API_KEY_HEADER, ApiKey, OrdersApi};
use shkeeper_reconciler::interfaces::http::signature::{SIGNATURE_HEADER, SignatureVerifier};
use shkeeper_reconciler::interfaces::http::webhook::{self, AppState, WEBHOOK_PATH};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

pub const SECRET: &str = "integration-secret";
pub const ORDERS_KEY: &str = "integration-orders-key";

/// Bot endpoint double: records delivered effects, failing the first `fail_first` calls.
#[derive(Default)]
pub struct Recorder {
    pub effects: Mutex<Vec<SideEffect>>,
    pub attempts: AtomicUsize,
    pub fail_first: usize,
}

#[async_trait]
impl Downstream for Recorder {
    async fn dispatch(&self, effect: &SideEffect) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(ReconcileError::DownstreamError("bot offline".to_string()));
        }
        self.effects.lock().await.push(effect.clone());
        Ok(())
    }
}

/// Gateway double: offers BTC and LTC and numbers invoices `inv-1`, `inv-2`, ...
#[derive(Default)]
pub struct Gateway {
    pub created: Mutex<Vec<InvoiceRequest>>,
}

#[async_trait]
impl GatewayApi for Gateway {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        let mut created = self.created.lock().await;
        created.push(request.clone());
        Ok(Invoice {
            invoice_id: format!("inv-{}", created.len()),
            crypto: request.crypto.clone(),
            crypto_amount: "0.0005".parse()?,
            address: format!("addr-{}", request.external_id),
            exchange_rate: None,
            expires_at: None,
        })
    }

    async fn invoice_status(&self, invoice_id: &str) -> Result<InvoiceStatus> {
        Err(ReconcileError::GatewayError(format!("unknown invoice {invoice_id}")))
    }

    async fn list_cryptos(&self) -> Result<Vec<String>> {
        Ok(vec!["BTC".to_string(), "LTC".to_string()])
    }
}

pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub store: Arc<InMemoryOrderStore>,
    pub recorder: Arc<Recorder>,
    pub gateway: Arc<Gateway>,
    signer: SignatureVerifier,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    outbox: OutboxHandle,
}

impl TestServer {
    pub async fn start(dev_mode: bool) -> Self {
        Self::start_with(dev_mode, Recorder::default()).await
    }

    pub async fn start_with(dev_mode: bool, recorder: Recorder) -> Self {
        let store = Arc::new(InMemoryOrderStore::new());
        let locks = Arc::new(OrderLocks::new());
        let recorder = Arc::new(recorder);
        let gateway = Arc::new(Gateway::default());
        let (outbox, outbox_handle) = Outbox::spawn(
            recorder.clone(),
            store.clone(),
            locks.clone(),
            RetryPolicy {
                max_retries: 5,
                base_delay: std::time::Duration::from_millis(10),
            },
        );
        let reconciler = Reconciler::new(store.clone(), locks.clone(), outbox);
        let checkout = Checkout::new(store.clone(), locks, gateway.clone());
        let orders = OrdersApi::new(
            Arc::new(checkout),
            ApiKey::new(Some(ORDERS_KEY), dev_mode),
            format!("http://bot.test{WEBHOOK_PATH}"),
        );
        let state = AppState::new(Arc::new(reconciler), SignatureVerifier::new(SECRET, dev_mode))
            .with_orders(orders);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            webhook::serve(listener, state, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            store,
            recorder,
            gateway,
            signer: SignatureVerifier::new(SECRET, false),
            shutdown,
            server,
            outbox: outbox_handle,
        }
    }

    /// Stores a reserved gateway order carrying invoice `invoice_id`.
    pub async fn seed(&self, code: &str, invoice_id: &str) {
        let now = Utc::now();
        let mut order = Order::reserve(
            code,
            PaymentMethod::Gateway,
            dec!(25.50),
            "USD",
            now + Duration::minutes(30),
            now,
        );
        order
            .attach_invoice(
                GatewayDetails::new(invoice_id, "BTC", "0.001".parse().unwrap(), "bc1qxyz"),
                now,
            )
            .unwrap();
        self.store.store(order).await.unwrap();
    }

    pub async fn seed_manual(&self, code: &str) {
        let now = Utc::now();
        let order = Order::reserve(
            code,
            PaymentMethod::Manual,
            dec!(10),
            "USD",
            now + Duration::minutes(30),
            now,
        );
        self.store.store(order).await.unwrap();
    }

    pub async fn order(&self, code: &str) -> Order {
        self.store.get(code).await.unwrap().unwrap()
    }

    pub fn url(&self) -> String {
        format!("{}{WEBHOOK_PATH}", self.base_url)
    }

    /// Posts `body` with a valid signature and returns the status and JSON response.
    pub async fn deliver(&self, body: &Value) -> (u16, Value) {
        let raw = serde_json::to_vec(body).unwrap();
        let signature = self.signer.sign(&raw).unwrap();
        self.post_raw(raw, Some(&signature)).await
    }

    pub async fn post_raw(&self, body: Vec<u8>, signature: Option<&str>) -> (u16, Value) {
        let mut request = self
            .client
            .post(self.url())
            .header("content-type", "application/json")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Calls the order API; `body` of `None` sends a GET.
    pub async fn orders_api(
        &self,
        path: &str,
        body: Option<&Value>,
        key: Option<&str>,
    ) -> (u16, Value) {
        let url = format!("{}{path}", self.base_url);
        let mut request = match body {
            Some(body) => self.client.post(url).json(body),
            None => self.client.get(url),
        };
        if let Some(key) = key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    pub fn sign(&self, body: &[u8]) -> String {
        self.signer.sign(body).unwrap()
    }

    /// Stops the server and waits for every queued side effect to settle.
    pub async fn shutdown(self) -> OutboxStats {
        let _ = self.shutdown.send(());
        self.server.await.unwrap();
        self.outbox.join().await
    }
}
