//! Broker link
//!
//! Everything that touches the message broker:
//!
//! - [`manager`]: the connection lifecycle manager (single shared link,
//!   reconnect policy, failure events)
//! - [`assertion`]: idempotent exchange assertion backed by [`cache`]
//! - [`transport`]: the trait seam the manager drives, with the lapin-backed
//!   implementation in [`amqp`]

pub mod address;
pub mod amqp;
pub mod assertion;
pub mod cache;
pub mod error;
pub mod manager;
pub mod transport;

pub use amqp::AmqpConnector;
pub use cache::ExchangeCache;
pub use error::{BrokerError, ConnectFailureKind, LinkError};
pub use manager::{
    ConnectionManager, LinkPhase, LinkStatus, ManagerSettings, ScheduleOutcome,
    RECONNECT_INTERVAL,
};
pub use transport::{
    BrokerChannel, BrokerConnection, Connector, LinkEvent, LinkEventKind, LinkObserver,
    PublishProperties,
};
