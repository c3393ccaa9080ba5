use crate::application::locks::OrderLocks;
use crate::domain::event::SideEffect;
use crate::domain::ports::{DownstreamRef, OrderStoreRef};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle, JoinSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 7,
            base_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub delivered: usize,
    pub dropped: usize,
}

/// Queue of side effects dispatched after an order mutation has been persisted.
///
/// Delivery happens on a background worker, so a slow or failing bot endpoint
/// never holds up the webhook response. Failed effects are retried with
/// exponential backoff, independently of gateway redelivery.
///
/// Each effect is also recorded on its order as `pending_effect`, in the same
/// write as the transition that produced it. A delivered effect is cleared
/// from the order; one that is dropped stays there until it is enqueued again
/// by [`Reconciler::redeliver_pending`].
///
/// [`Reconciler::redeliver_pending`]: crate::application::reconciler::Reconciler::redeliver_pending
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<SideEffect>,
}

/// Handle to the outbox worker. The worker finishes once every `Outbox`
/// clone is dropped and in-flight retries have settled.
pub struct OutboxHandle {
    handle: JoinHandle<OutboxStats>,
}

impl OutboxHandle {
    pub async fn join(self) -> OutboxStats {
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "outbox worker panicked");
                OutboxStats::default()
            }
        }
    }
}

impl Outbox {
    pub fn spawn(
        downstream: DownstreamRef,
        store: OrderStoreRef,
        locks: Arc<OrderLocks>,
        policy: RetryPolicy,
    ) -> (Self, OutboxHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = Delivery {
            downstream,
            store,
            locks,
            policy,
        };
        let handle = tokio::spawn(run_worker(rx, Arc::new(delivery)));
        (Self { tx }, OutboxHandle { handle })
    }

    pub fn enqueue(&self, effect: SideEffect) {
        if let Err(e) = self.tx.send(effect) {
            tracing::error!(
                order_code = e.0.order_code(),
                effect = e.0.kind(),
                "outbox worker is gone, side effect stays pending"
            );
        }
    }
}

struct Delivery {
    downstream: DownstreamRef,
    store: OrderStoreRef,
    locks: Arc<OrderLocks>,
    policy: RetryPolicy,
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<SideEffect>,
    delivery: Arc<Delivery>,
) -> OutboxStats {
    let mut in_flight = JoinSet::new();
    let mut effects: HashMap<task::Id, SideEffect> = HashMap::new();
    let mut stats = OutboxStats::default();

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(effect) => {
                    if effects.values().any(|queued| *queued == effect) {
                        tracing::debug!(
                            order_code = effect.order_code(),
                            effect = effect.kind(),
                            "side effect already in flight"
                        );
                        continue;
                    }
                    let handle = in_flight.spawn(deliver(effect.clone(), delivery.clone()));
                    effects.insert(handle.id(), effect);
                }
                None => break,
            },
            Some(done) = in_flight.join_next_with_id() => record(&mut stats, &mut effects, done),
        }
    }

    while let Some(done) = in_flight.join_next_with_id().await {
        record(&mut stats, &mut effects, done);
    }
    tracing::debug!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        "outbox drained"
    );
    stats
}

fn record(
    stats: &mut OutboxStats,
    effects: &mut HashMap<task::Id, SideEffect>,
    done: std::result::Result<(task::Id, bool), task::JoinError>,
) {
    match done {
        Ok((id, delivered)) => {
            effects.remove(&id);
            if delivered {
                stats.delivered += 1;
            } else {
                stats.dropped += 1;
            }
        }
        Err(e) => {
            effects.remove(&e.id());
            tracing::error!(error = %e, "side effect delivery task failed");
            stats.dropped += 1;
        }
    }
}

async fn deliver(effect: SideEffect, delivery: Arc<Delivery>) -> bool {
    let policy = delivery.policy;
    let mut retry = 0;
    loop {
        match delivery.downstream.dispatch(&effect).await {
            Ok(()) => {
                if let Err(e) = settle(&delivery, &effect).await {
                    tracing::error!(
                        order_code = effect.order_code(),
                        effect = effect.kind(),
                        error = %e,
                        "delivered side effect could not be cleared, it will be sent again"
                    );
                }
                return true;
            }
            Err(e) if retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay_for(retry);
                tracing::warn!(
                    order_code = effect.order_code(),
                    effect = effect.kind(),
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "side effect delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(
                    order_code = effect.order_code(),
                    effect = effect.kind(),
                    retries = retry,
                    error = %e,
                    "side effect delivery failed, left pending on the order"
                );
                return false;
            }
        }
    }
}

/// Clears a delivered effect from its order. A newer pending effect is kept.
async fn settle(delivery: &Delivery, effect: &SideEffect) -> Result<()> {
    let code = effect.order_code();
    let _guard = delivery.locks.lock(code).await;
    let Some(mut order) = delivery.store.get(code).await? else {
        return Ok(());
    };
    if order.pending_effect.as_ref() == Some(effect) {
        order.pending_effect = None;
        delivery.store.store(order).await?;
    }
    Ok(())
}
