use crate::domain::order::Order;
use crate::domain::ports::OrderStore;
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

/// Column Family for storing orders, keyed by order code.
pub const CF_ORDERS: &str = "orders";
/// Column Family mapping invoice ids to order codes.
pub const CF_INVOICES: &str = "invoices";

/// A persistent order store using RocksDB.
///
/// Orders are JSON-encoded in their own Column Family; the invoice index is
/// written in the same `WriteBatch` as the order so both stay consistent.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path,
    /// creating the "orders" and "invoices" column families if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_orders = ColumnFamilyDescriptor::new(CF_ORDERS, Options::default());
        let cf_invoices = ColumnFamilyDescriptor::new(CF_INVOICES, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_orders, cf_invoices])?;

        Ok(Self { db: Arc::new(db) })
    }

    fn missing_cf(name: &str) -> ReconcileError {
        ReconcileError::InternalError(Box::new(std::io::Error::other(format!(
            "{name} column family not found"
        ))))
    }

    fn decode(bytes: &[u8]) -> Result<Order> {
        serde_json::from_slice(bytes).map_err(|e| {
            ReconcileError::InternalError(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Deserialization error: {e}"),
            )))
        })
    }

    fn load(&self, code: &[u8]) -> Result<Option<Order>> {
        let cf = self
            .db
            .cf_handle(CF_ORDERS)
            .ok_or_else(|| Self::missing_cf(CF_ORDERS))?;

        match self.db.get_pinned_cf(&cf, code)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OrderStore for RocksDBStore {
    async fn store(&self, order: Order) -> Result<()> {
        let orders = self
            .db
            .cf_handle(CF_ORDERS)
            .ok_or_else(|| Self::missing_cf(CF_ORDERS))?;
        let invoices = self
            .db
            .cf_handle(CF_INVOICES)
            .ok_or_else(|| Self::missing_cf(CF_INVOICES))?;

        let value = serde_json::to_vec(&order).map_err(|e| {
            ReconcileError::InternalError(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Serialization error: {e}"),
            )))
        })?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&orders, order.code.as_bytes(), value);
        if let Some(invoice_id) = order.invoice_id() {
            batch.put_cf(&invoices, invoice_id.as_bytes(), order.code.as_bytes());
        }
        self.db.write(batch)?;

        Ok(())
    }

    async fn get(&self, code: &str) -> Result<Option<Order>> {
        self.load(code.as_bytes())
    }

    async fn find_by_invoice(&self, invoice_id: &str) -> Result<Option<Order>> {
        let cf = self
            .db
            .cf_handle(CF_INVOICES)
            .ok_or_else(|| Self::missing_cf(CF_INVOICES))?;

        match self.db.get_cf(&cf, invoice_id.as_bytes())? {
            Some(code) => self.load(&code),
            None => Ok(None),
        }
    }

    async fn all_orders(&self) -> Result<Vec<Order>> {
        let handle = self
            .db
            .cf_handle(CF_ORDERS)
            .ok_or_else(|| Self::missing_cf(CF_ORDERS))?;

        let mut orders = Vec::new();
        // Keys iterate in byte order, i.e. sorted by order code.
        for item in self.db.iterator_cf(&handle, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            orders.push(Self::decode(&value)?);
        }

        Ok(orders)
    }
}
