use crate::application::reconciler::Reconciler;
use crate::domain::ports::{GatewayRef, OrderStoreRef};
use crate::error::Result;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Polls the gateway for the state of open invoices.
///
/// Recovers callbacks the gateway gave up on: every reported state goes
/// through the reconciler exactly like a webhook would.
pub struct StatusSync {
    store: OrderStoreRef,
    gateway: GatewayRef,
    reconciler: Arc<Reconciler>,
}

impl StatusSync {
    pub fn new(store: OrderStoreRef, gateway: GatewayRef, reconciler: Arc<Reconciler>) -> Self {
        Self {
            store,
            gateway,
            reconciler,
        }
    }

    pub async fn run_once(&self) -> Result<SyncReport> {
        let open: Vec<(String, String)> = self
            .store
            .all_orders()
            .await?
            .into_iter()
            .filter(|order| !order.status.is_terminal())
            .filter_map(|order| {
                let invoice_id = order.invoice_id()?.to_string();
                Some((order.code, invoice_id))
            })
            .collect();

        let mut report = SyncReport::default();
        for (code, invoice_id) in open {
            report.checked += 1;

            let status = match self.gateway.invoice_status(&invoice_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(
                        order_code = code.as_str(),
                        invoice_id = invoice_id.as_str(),
                        error = %e,
                        "invoice status query failed"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let Some(event) = status.state.as_event() else {
                continue;
            };

            match self
                .reconciler
                .reconcile(&code, event, status.tx_hash.as_deref(), status.confirmations)
                .await
            {
                Ok(outcome) if outcome.is_mutation() => report.updated += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(order_code = code.as_str(), error = %e, "status sync failed");
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            checked = report.checked,
            updated = report.updated,
            failed = report.failed,
            "invoice status sync finished"
        );
        Ok(report)
    }
}
