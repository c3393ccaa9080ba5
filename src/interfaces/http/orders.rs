//! Order API used by the bot to reserve orders and open invoices while the
//! webhook server holds the store.

use super::webhook::AppState;
use crate::application::checkout::Checkout;
use crate::domain::order::Order;
use crate::error::{ReconcileError, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

const DEFAULT_HOLD_MINUTES: i64 = 30;

/// Shared key the bot presents in [`API_KEY_HEADER`].
///
/// Without a configured key the API is open in dev mode and closed otherwise.
#[derive(Debug, Clone)]
pub struct ApiKey {
    digest: Option<[u8; 32]>,
    dev_mode: bool,
}

impl ApiKey {
    pub fn new(key: Option<&str>, dev_mode: bool) -> Self {
        Self {
            digest: key.map(digest),
            dev_mode,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.digest.is_some() || self.dev_mode
    }

    pub fn check(&self, presented: Option<&str>) -> Result<()> {
        match &self.digest {
            Some(expected) if presented.map(digest).as_ref() == Some(expected) => Ok(()),
            Some(_) => Err(ReconcileError::Unauthorized(
                "missing or invalid API key".to_string(),
            )),
            None if self.dev_mode => Ok(()),
            None => Err(ReconcileError::Unauthorized(
                "order API is disabled: no API key configured".to_string(),
            )),
        }
    }
}

// Fixed-length digests, no early exit on a shared key prefix.
fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

pub struct OrdersApi {
    checkout: Arc<Checkout>,
    api_key: ApiKey,
    callback_url: String,
}

impl OrdersApi {
    pub fn new(checkout: Arc<Checkout>, api_key: ApiKey, callback_url: impl Into<String>) -> Self {
        Self {
            checkout,
            api_key,
            callback_url: callback_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReserveRequest {
    code: String,
    amount: Decimal,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default = "default_hold_minutes")]
    hold_minutes: i64,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_hold_minutes() -> i64 {
    DEFAULT_HOLD_MINUTES
}

#[derive(Debug, Deserialize)]
struct InvoiceRequestBody {
    crypto: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(reserve_order))
        .route("/orders/{code}", get(get_order))
        .route("/orders/{code}/invoice", post(open_invoice))
}

fn authorize<'a>(state: &'a AppState, headers: &HeaderMap) -> Result<&'a OrdersApi> {
    let api = state
        .orders()
        .ok_or_else(|| ReconcileError::NotFound("order API is not enabled".to_string()))?;
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    api.api_key.check(presented)?;
    Ok(api)
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ReconcileError::MalformedPayload(e.to_string()))
}

async fn reserve_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Order>)> {
    let api = authorize(&state, &headers)?;
    let request: ReserveRequest = parse(&body)?;
    let order = api
        .checkout
        .reserve(
            request.code.trim(),
            request.amount,
            &request.currency,
            request.hold_minutes,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<Order>> {
    let api = authorize(&state, &headers)?;
    Ok(Json(api.checkout.order(&code).await?))
}

async fn open_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
    body: Bytes,
) -> Result<Json<Order>> {
    let api = authorize(&state, &headers)?;
    let request: InvoiceRequestBody = parse(&body)?;
    let order = api
        .checkout
        .open_invoice(&code, &request.crypto, &api.callback_url)
        .await?;
    Ok(Json(order))
}
