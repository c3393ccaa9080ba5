//! Application layer containing the payment reconciliation logic.
//!
//! The `Reconciler` is the single writer of payment state on orders. It is
//! fed by the webhook endpoint and by `StatusSync`, serializes work per order
//! through `OrderLocks`, and hands follow-up work to the `Outbox`.

pub mod checkout;
pub mod locks;
pub mod outbox;
pub mod reconciler;
pub mod sync;
#[cfg(test)]
pub(crate) mod testing;
