//! Outbound HTTP: the SHKeeper gateway REST API.

pub mod client;
pub mod models;

pub use client::{ShkeeperClient, ShkeeperConfig};
