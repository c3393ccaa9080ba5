use crate::application::locks::OrderLocks;
use crate::application::outbox::Outbox;
use crate::domain::event::{PaymentEvent, SideEffect, WebhookNotification};
use crate::domain::order::{ApplyOutcome, Order, OrderStatus};
use crate::domain::ports::OrderStoreRef;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Reconciles gateway payment events into local orders.
///
/// Every mutation of an order happens under that order's lock: the order is
/// re-read, the event applied, and the result persisted before the lock is
/// released. A transition's side effect is written onto the order in that
/// same store call and handed to the outbox only after the write.
pub struct Reconciler {
    store: OrderStoreRef,
    locks: Arc<OrderLocks>,
    outbox: Outbox,
}

impl Reconciler {
    pub fn new(store: OrderStoreRef, locks: Arc<OrderLocks>, outbox: Outbox) -> Self {
        Self {
            store,
            locks,
            outbox,
        }
    }

    /// Handles a verified webhook callback.
    ///
    /// Unknown orders are `NotFound`; stale or terminal states are reported
    /// through the outcome, never as errors.
    pub async fn handle_notification(
        &self,
        notification: &WebhookNotification,
    ) -> Result<ApplyOutcome> {
        let code = self.resolve(notification).await?;
        self.reconcile(
            &code,
            notification.event,
            notification.tx_hash.as_deref(),
            notification.confirmations,
        )
        .await
    }

    /// Applies `event` to the order identified by `code`.
    pub async fn reconcile(
        &self,
        code: &str,
        event: PaymentEvent,
        tx_hash: Option<&str>,
        confirmations: Option<u64>,
    ) -> Result<ApplyOutcome> {
        let guard = self.locks.lock(code).await;

        let mut order = self
            .store
            .get(code)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("order {code}")))?;

        let outcome = order.apply(event, tx_hash, confirmations, Utc::now());
        let effect = match outcome {
            ApplyOutcome::Applied { .. } => side_effect_for(&order),
            _ => None,
        };
        if effect.is_some() {
            order.pending_effect = effect.clone();
        }
        if outcome.is_mutation() {
            self.store.store(order.clone()).await?;
        }
        drop(guard);

        match &outcome {
            ApplyOutcome::Applied { from, to } => {
                tracing::info!(order_code = code, %event, %from, %to, "order status updated");
                if let Some(effect) = effect {
                    self.outbox.enqueue(effect);
                }
            }
            ApplyOutcome::Refreshed => {
                tracing::info!(
                    order_code = code,
                    %event,
                    confirmations = order.gateway.as_ref().map(|g| g.confirmations),
                    "payment data refreshed"
                );
            }
            ApplyOutcome::Duplicate => {
                tracing::debug!(order_code = code, %event, "duplicate event acknowledged");
            }
            ApplyOutcome::Ignored { reason } => {
                tracing::warn!(
                    order_code = code,
                    %event,
                    status = %order.status,
                    reason = reason.as_str(),
                    "event acknowledged without mutation"
                );
            }
        }

        Ok(outcome)
    }

    /// Expires every reservation whose deadline passed before `now`.
    /// Returns the number of orders expired.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates: Vec<String> = self
            .store
            .all_orders()
            .await?
            .into_iter()
            .filter(|order| order.is_overdue(now))
            .map(|order| order.code)
            .collect();

        let mut expired = 0;
        for code in candidates {
            let guard = self.locks.lock(&code).await;
            let Some(mut order) = self.store.get(&code).await? else {
                continue;
            };
            // Re-check under the lock: a payment may have landed meanwhile.
            if !order.is_overdue(now) {
                continue;
            }
            order.expire(now)?;
            let effect = side_effect_for(&order);
            order.pending_effect = effect.clone();
            self.store.store(order.clone()).await?;
            drop(guard);

            tracing::info!(
                order_code = code.as_str(),
                reserved_until = %order.reserved_until,
                "reservation expired"
            );
            if let Some(effect) = effect {
                self.outbox.enqueue(effect);
            }
            expired += 1;
        }

        Ok(expired)
    }

    /// Enqueues every side effect still pending on an order: those lost to a
    /// restart and those the outbox gave up on. Returns the number enqueued.
    pub async fn redeliver_pending(&self) -> Result<usize> {
        let mut enqueued = 0;
        for order in self.store.all_orders().await? {
            if let Some(effect) = order.pending_effect {
                tracing::debug!(
                    order_code = order.code.as_str(),
                    effect = effect.kind(),
                    "redelivering pending side effect"
                );
                self.outbox.enqueue(effect);
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Finds the order a callback refers to: by invoice id first, then by
    /// order code. An order found by code must carry a gateway invoice, and
    /// it must be the invoice named in the callback when one is given.
    async fn resolve(&self, notification: &WebhookNotification) -> Result<String> {
        if let Some(invoice_id) = notification.invoice_id()
            && let Some(order) = self.store.find_by_invoice(invoice_id).await?
        {
            return Ok(order.code);
        }

        if let Some(code) = notification.external_id()
            && let Some(order) = self.store.get(code).await?
            && let Some(stored_invoice) = order.invoice_id()
            && notification.invoice_id().is_none_or(|id| id == stored_invoice)
        {
            return Ok(order.code);
        }

        Err(ReconcileError::NotFound(format!(
            "no order for invoice {:?} / external id {:?}",
            notification.invoice_id(),
            notification.external_id()
        )))
    }
}

fn side_effect_for(order: &Order) -> Option<SideEffect> {
    match order.status {
        OrderStatus::Confirmed => {
            let details = order.gateway.as_ref()?;
            Some(SideEffect::PaymentConfirmed {
                order_code: order.code.clone(),
                invoice_id: details.invoice_id.clone(),
                tx_hash: details.tx_hash.clone(),
                confirmations: details.confirmations,
            })
        }
        OrderStatus::Expired | OrderStatus::Cancelled => Some(SideEffect::ReleaseInventory {
            order_code: order.code.clone(),
            status: order.status,
        }),
        OrderStatus::Reserved | OrderStatus::PaidUnconfirmed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::outbox::{OutboxHandle, OutboxStats, RetryPolicy};
    use crate::application::testing::Recorder;
    use crate::domain::order::{GatewayDetails, PaymentMethod};
    use crate::domain::ports::OrderStore;
    use crate::infrastructure::in_memory::InMemoryOrderStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Harness {
        reconciler: Reconciler,
        store: Arc<InMemoryOrderStore>,
        recorder: Arc<Recorder>,
        outbox: OutboxHandle,
    }

    impl Harness {
        /// Drops the reconciler, waits for the outbox and returns recorded effects.
        async fn finish(self) -> (Vec<SideEffect>, OutboxStats) {
            drop(self.reconciler);
            let stats = self.outbox.join().await;
            let effects = self.recorder.effects.lock().await.clone();
            (effects, stats)
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(Recorder::default()), RetryPolicy::default()).await
    }

    async fn harness_with(recorder: Arc<Recorder>, policy: RetryPolicy) -> Harness {
        let store = Arc::new(InMemoryOrderStore::new());
        let locks = Arc::new(OrderLocks::new());
        let (outbox, handle) =
            Outbox::spawn(recorder.clone(), store.clone(), locks.clone(), policy);
        let reconciler = Reconciler::new(store.clone(), locks, outbox);

        let now = Utc::now();
        let mut order = Order::reserve(
            "O1",
            PaymentMethod::Gateway,
            dec!(60),
            "USD",
            now + Duration::minutes(30),
            now,
        );
        order
            .attach_invoice(
                GatewayDetails::new("inv-1", "BTC", dec!(0.001).try_into().unwrap(), "bc1qxyz"),
                now,
            )
            .unwrap();
        store.store(order).await.unwrap();

        Harness {
            reconciler,
            store,
            recorder,
            outbox: handle,
        }
    }

    fn notification(
        event: PaymentEvent,
        tx_hash: Option<&str>,
        confirmations: Option<u64>,
    ) -> WebhookNotification {
        WebhookNotification {
            event,
            invoice_id: Some("inv-1".to_string()),
            external_id: Some("O1".to_string()),
            tx_hash: tx_hash.map(str::to_string),
            confirmations,
        }
    }

    #[tokio::test]
    async fn test_paid_then_confirmed_example() {
        let h = harness().await;

        h.reconciler
            .handle_notification(&notification(PaymentEvent::Paid, Some("abc"), Some(0)))
            .await
            .unwrap();
        let order = h.store.get("O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PaidUnconfirmed);
        assert_eq!(order.gateway.as_ref().unwrap().tx_hash.as_deref(), Some("abc"));

        h.reconciler
            .handle_notification(&notification(PaymentEvent::Confirmed, None, Some(3)))
            .await
            .unwrap();
        let order = h.store.get("O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.gateway.as_ref().unwrap().confirmations, 3);

        let (effects, _) = h.finish().await;
        assert_eq!(
            effects,
            vec![SideEffect::PaymentConfirmed {
                order_code: "O1".to_string(),
                invoice_id: "inv-1".to_string(),
                tx_hash: Some("abc".to_string()),
                confirmations: 3,
            }]
        );
    }

    #[tokio::test]
    async fn test_redelivery_does_not_repeat_side_effects() {
        let h = harness().await;
        let confirmed = notification(PaymentEvent::Confirmed, Some("abc"), Some(2));

        let first = h.reconciler.handle_notification(&confirmed).await.unwrap();
        let after_first = h.store.get("O1").await.unwrap().unwrap();
        let second = h.reconciler.handle_notification(&confirmed).await.unwrap();
        let after_second = h.store.get("O1").await.unwrap().unwrap();

        assert!(matches!(first, ApplyOutcome::Applied { .. }));
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.gateway, after_second.gateway);
        assert_eq!(after_first.updated_at, after_second.updated_at);

        let (effects, stats) = h.finish().await;
        assert_eq!(effects.len(), 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_confirmed_cannot_revive_cancelled_order() {
        let h = harness().await;
        h.reconciler
            .handle_notification(&notification(PaymentEvent::Failed, None, None))
            .await
            .unwrap();

        let outcome = h
            .reconciler
            .handle_notification(&notification(PaymentEvent::Confirmed, Some("abc"), Some(6)))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Ignored { .. }));
        let order = h.store.get("O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        let (effects, _) = h.finish().await;
        assert_eq!(
            effects,
            vec![SideEffect::ReleaseInventory {
                order_code: "O1".to_string(),
                status: OrderStatus::Cancelled,
            }]
        );
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_external_id() {
        let h = harness().await;
        let mut by_code = notification(PaymentEvent::Paid, Some("abc"), None);
        by_code.invoice_id = None;

        h.reconciler.handle_notification(&by_code).await.unwrap();
        let order = h.store.get("O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PaidUnconfirmed);
        assert_eq!(order.gateway.unwrap().confirmations, 0);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let h = harness().await;
        let mut unknown = notification(PaymentEvent::Paid, None, None);
        unknown.invoice_id = Some("inv-404".to_string());
        unknown.external_id = Some("O404".to_string());
        assert!(matches!(
            h.reconciler.handle_notification(&unknown).await,
            Err(ReconcileError::NotFound(_))
        ));

        // Known order code, but the callback names a different invoice.
        let mut mismatched = notification(PaymentEvent::Paid, None, None);
        mismatched.invoice_id = Some("inv-other".to_string());
        assert!(matches!(
            h.reconciler.handle_notification(&mismatched).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_order_without_invoice_is_not_found() {
        let h = harness().await;
        let now = Utc::now();
        h.store
            .store(Order::reserve("M1", PaymentMethod::Manual, dec!(5), "USD", now, now))
            .await
            .unwrap();

        let manual = WebhookNotification {
            event: PaymentEvent::Paid,
            invoice_id: None,
            external_id: Some("M1".to_string()),
            tx_hash: None,
            confirmations: None,
        };
        assert!(matches!(
            h.reconciler.handle_notification(&manual).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_overdue_releases_inventory_once() {
        let h = harness().await;
        let now = Utc::now();
        h.store
            .store(Order::reserve(
                "O2",
                PaymentMethod::Gateway,
                dec!(5),
                "USD",
                now - Duration::minutes(1),
                now - Duration::minutes(31),
            ))
            .await
            .unwrap();

        assert_eq!(h.reconciler.expire_overdue(now).await.unwrap(), 1);
        assert_eq!(h.reconciler.expire_overdue(now).await.unwrap(), 0);

        let o1 = h.store.get("O1").await.unwrap().unwrap();
        let o2 = h.store.get("O2").await.unwrap().unwrap();
        assert_eq!(o1.status, OrderStatus::Reserved);
        assert_eq!(o2.status, OrderStatus::Expired);

        let (effects, _) = h.finish().await;
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].order_code(), "O2");
    }

    #[tokio::test]
    async fn test_concurrent_paid_and_confirmed_converge() {
        for _ in 0..20 {
            let h = harness().await;
            let reconciler = Arc::new(h.reconciler);

            let paid = {
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    reconciler
                        .handle_notification(&notification(PaymentEvent::Paid, Some("abc"), Some(0)))
                        .await
                })
            };
            let confirmed = {
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    reconciler
                        .handle_notification(&notification(PaymentEvent::Confirmed, Some("abc"), Some(3)))
                        .await
                })
            };
            paid.await.unwrap().unwrap();
            confirmed.await.unwrap().unwrap();

            let order = h.store.get("O1").await.unwrap().unwrap();
            assert_eq!(order.status, OrderStatus::Confirmed);
            assert_eq!(order.gateway.unwrap().confirmations, 3);
        }
    }

    #[tokio::test]
    async fn test_expired_callback_releases_inventory_once() {
        let h = harness().await;
        let expired = notification(PaymentEvent::Expired, None, None);

        let first = h.reconciler.handle_notification(&expired).await.unwrap();
        assert_eq!(
            first,
            ApplyOutcome::Applied {
                from: OrderStatus::Reserved,
                to: OrderStatus::Expired
            }
        );
        let second = h.reconciler.handle_notification(&expired).await.unwrap();
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(
            h.store.get("O1").await.unwrap().unwrap().status,
            OrderStatus::Expired
        );

        let (effects, stats) = h.finish().await;
        assert_eq!(
            effects,
            vec![SideEffect::ReleaseInventory {
                order_code: "O1".to_string(),
                status: OrderStatus::Expired,
            }]
        );
        assert_eq!(stats, OutboxStats { delivered: 1, dropped: 0 });
    }

    #[tokio::test]
    async fn test_delivered_effect_is_cleared_from_the_order() {
        let h = harness().await;
        h.reconciler
            .handle_notification(&notification(PaymentEvent::Confirmed, Some("abc"), Some(1)))
            .await
            .unwrap();

        let store = h.store.clone();
        let (effects, _) = h.finish().await;
        assert_eq!(effects.len(), 1);
        let order = store.get("O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert!(order.pending_effect.is_none());
    }

    #[tokio::test]
    async fn test_undelivered_effect_is_redelivered_after_restart() {
        let offline = Arc::new(Recorder::failing(u32::MAX));
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: std::time::Duration::from_millis(1),
        };
        let h = harness_with(offline.clone(), policy).await;
        h.reconciler
            .handle_notification(&notification(PaymentEvent::Failed, None, None))
            .await
            .unwrap();
        let store = h.store.clone();
        let (delivered, stats) = h.finish().await;
        assert!(delivered.is_empty());
        assert_eq!(stats.dropped, 1);
        let pending = store.get("O1").await.unwrap().unwrap().pending_effect;
        assert!(pending.is_some());

        // A fresh process over the same store, with the bot back online.
        let recorder = Arc::new(Recorder::default());
        let locks = Arc::new(OrderLocks::new());
        let (outbox, handle) = Outbox::spawn(
            recorder.clone(),
            store.clone(),
            locks.clone(),
            RetryPolicy::default(),
        );
        let reconciler = Reconciler::new(store.clone(), locks, outbox);
        assert_eq!(reconciler.redeliver_pending().await.unwrap(), 1);
        drop(reconciler);
        assert_eq!(handle.join().await.delivered, 1);

        assert_eq!(*recorder.effects.lock().await, vec![pending.unwrap()]);
        let order = store.get("O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.pending_effect.is_none());
    }
}
