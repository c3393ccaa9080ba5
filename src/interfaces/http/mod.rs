//! Inbound HTTP: the gateway's webhook endpoint and the bot's order API.

pub mod orders;
pub mod signature;
pub mod webhook;
