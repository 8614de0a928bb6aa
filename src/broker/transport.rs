//! Broker Transport Layer
//!
//! The connection lifecycle manager talks to the broker only through these
//! traits, so the AMQP client can be swapped for an in-memory double in tests.
//!
//! # Architecture
//!
//! - [`Connector`] opens a [`BrokerConnection`] to a target address
//! - a connection opens a single [`BrokerChannel`]
//! - both report asynchronous failures through a [`LinkObserver`], which turns
//!   them into [`LinkEvent`] messages for the manager's control loop

use crate::broker::error::BrokerError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opens connections to the broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to `uri`
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Register error/close reporting for this connection
    fn observe(&self, observer: LinkObserver);

    /// Gracefully close the connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel used for declaring exchanges and publishing
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable fanout exchange (idempotent at the broker)
    async fn declare_fanout(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Publish one message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError>;

    /// Register error reporting for this channel
    fn observe(&self, observer: LinkObserver);

    /// Whether the channel still accepts operations
    fn is_open(&self) -> bool;

    /// Gracefully close the channel
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Message properties attached to every publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub persistent: bool,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
}

impl PublishProperties {
    /// Persistent JSON message stamped with `timestamp`
    pub fn persistent_json(timestamp: u64) -> Self {
        Self {
            content_type: "application/json".to_string(),
            persistent: true,
            timestamp,
            message_id: None,
            app_id: None,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_app_id(mut self, id: impl Into<String>) -> Self {
        self.app_id = Some(id.into());
        self
    }
}

/// What went wrong on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    ConnectionError(String),
    ChannelError(String),
    ConnectionClosed(String),
}

/// Asynchronous failure reported by the link of a given epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub epoch: u64,
    pub kind: LinkEventKind,
}

/// Handle given to transports for reporting link failures
///
/// Cheap to clone; reporting after the manager is gone is silently dropped.
#[derive(Debug, Clone)]
pub struct LinkObserver {
    epoch: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkObserver {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn connection_error(&self, reason: impl Into<String>) {
        self.emit(LinkEventKind::ConnectionError(reason.into()));
    }

    pub fn channel_error(&self, reason: impl Into<String>) {
        self.emit(LinkEventKind::ChannelError(reason.into()));
    }

    pub fn connection_closed(&self, reason: impl Into<String>) {
        self.emit(LinkEventKind::ConnectionClosed(reason.into()));
    }

    fn emit(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            epoch: self.epoch,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(epoch = self.epoch, "Link event dropped: manager stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_json_properties() {
        let props = PublishProperties::persistent_json(1_700_000_000)
            .with_message_id("abc")
            .with_app_id("hookbridge");
        assert_eq!(props.content_type, "application/json");
        assert!(props.persistent);
        assert_eq!(props.timestamp, 1_700_000_000);
        assert_eq!(props.message_id.as_deref(), Some("abc"));
        assert_eq!(props.app_id.as_deref(), Some("hookbridge"));
    }

    #[tokio::test]
    async fn test_observer_tags_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = LinkObserver::new(7, tx);

        observer.channel_error("boom");
        observer.connection_closed("bye");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.epoch, 7);
        assert_eq!(first.kind, LinkEventKind::ChannelError("boom".to_string()));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, LinkEventKind::ConnectionClosed("bye".to_string()));
    }

    #[test]
    fn test_observer_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let observer = LinkObserver::new(1, tx);
        // Must not panic
        observer.connection_error("late");
    }
}
