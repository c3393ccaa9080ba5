use super::orders::{self, OrdersApi};
use super::signature::{SIGNATURE_HEADER, SignatureVerifier};
use crate::application::reconciler::Reconciler;
use crate::domain::event::WebhookNotification;
use crate::domain::order::ApplyOutcome;
use crate::error::{ReconcileError, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub const WEBHOOK_PATH: &str = "/webhooks/shkeeper";

#[derive(Clone)]
pub struct AppState {
    reconciler: Arc<Reconciler>,
    verifier: Arc<SignatureVerifier>,
    orders: Option<Arc<OrdersApi>>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>, verifier: SignatureVerifier) -> Self {
        Self {
            reconciler,
            verifier: Arc::new(verifier),
            orders: None,
        }
    }

    /// Mounts the order API next to the webhook.
    pub fn with_orders(mut self, orders: OrdersApi) -> Self {
        self.orders = Some(Arc::new(orders));
        self
    }

    pub(super) fn orders(&self) -> Option<&OrdersApi> {
        self.orders.as_deref()
    }
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route(WEBHOOK_PATH, post(shkeeper_webhook))
        .route("/health", get(health));
    if state.orders.is_some() {
        app = app.merge(orders::routes());
    }
    app.with_state(state)
}

/// Serves the webhook and order API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "webhook server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("webhook server stopped");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn shkeeper_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    state.verifier.verify(signature, &body)?;

    let notification = WebhookNotification::from_slice(&body)?;
    tracing::debug!(
        event = %notification.event,
        invoice_id = notification.invoice_id(),
        external_id = notification.external_id(),
        "webhook received"
    );

    let outcome = state.reconciler.handle_notification(&notification).await?;
    let mut response = json!({ "status": "ok", "outcome": outcome.label() });
    if let ApplyOutcome::Applied { to, .. } = &outcome {
        response["order_status"] = json!(to);
    }
    Ok(Json(response))
}

impl IntoResponse for ReconcileError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReconcileError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ReconcileError::NotFound(_) => StatusCode::NOT_FOUND,
            ReconcileError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            ReconcileError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::InvalidTransition(_) => StatusCode::CONFLICT,
            ReconcileError::GatewayError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request processing failed");
            "internal error".to_string()
        } else {
            tracing::warn!(status = status.as_u16(), error = %self, "request rejected");
            self.to_string()
        };

        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}
