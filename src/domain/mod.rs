//! Domain layer: orders, payment events and the ports the application talks through.

pub mod event;
pub mod ids;
pub mod order;
pub mod ports;
