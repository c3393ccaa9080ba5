use crate::domain::order::Order;
use crate::domain::ports::OrderStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    orders: HashMap<String, Order>,
    /// invoice id -> order code
    invoices: HashMap<String, String>,
}

/// A thread-safe in-memory store for orders.
///
/// Orders and the invoice index live behind one `RwLock` so a write never
/// leaves the index pointing at a stale order. Ideal for tests and dev mode
/// where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryOrderStore {
    /// Creates a new, empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn store(&self, order: Order) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(invoice_id) = order.invoice_id() {
            tables
                .invoices
                .insert(invoice_id.to_string(), order.code.clone());
        }
        tables.orders.insert(order.code.clone(), order);
        Ok(())
    }

    async fn get(&self, code: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables.orders.get(code).cloned())
    }

    async fn find_by_invoice(&self, invoice_id: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .invoices
            .get(invoice_id)
            .and_then(|code| tables.orders.get(code))
            .cloned())
    }

    async fn all_orders(&self) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables.orders.values().cloned().collect();
        orders.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(orders)
    }
}
