//! HookBridge Library
//!
//! Receives authenticated webhooks over HTTP and republishes them as persistent
//! messages on RabbitMQ fanout exchanges. The broker link is a single shared
//! connection/channel pair with bounded fixed-interval reconnection.

pub mod broker;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod webhook;
