use crate::domain::order::{Order, OrderStatus, PaymentMethod};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct OrderRow<'a> {
    code: &'a str,
    method: PaymentMethod,
    status: OrderStatus,
    invoice_id: Option<&'a str>,
    crypto: Option<&'a str>,
    crypto_amount: Option<String>,
    tx_hash: Option<&'a str>,
    confirmations: Option<u64>,
    reserved_until: String,
}

impl<'a> From<&'a Order> for OrderRow<'a> {
    fn from(order: &'a Order) -> Self {
        let gateway = order.gateway.as_ref();
        Self {
            code: &order.code,
            method: order.payment_method,
            status: order.status,
            invoice_id: gateway.map(|g| g.invoice_id.as_str()),
            crypto: gateway.map(|g| g.crypto.as_str()),
            crypto_amount: gateway.map(|g| g.crypto_amount.to_string()),
            tx_hash: gateway.and_then(|g| g.tx_hash.as_deref()),
            confirmations: gateway.map(|g| g.confirmations),
            reserved_until: order.reserved_until.to_rfc3339(),
        }
    }
}

/// Writes an order snapshot as CSV, one row per order.
///
/// Orders without gateway details leave the invoice columns empty.
pub struct OrderWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OrderWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_orders<'a, I>(&mut self, orders: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Order>,
    {
        let mut empty = true;
        for order in orders {
            self.writer.serialize(OrderRow::from(order))?;
            empty = false;
        }
        // serde emits the header with the first row only.
        if empty {
            self.writer.write_record([
                "code",
                "method",
                "status",
                "invoice_id",
                "crypto",
                "crypto_amount",
                "tx_hash",
                "confirmations",
                "reserved_until",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
