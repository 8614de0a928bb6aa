//! Broker Error Types
//!
//! Errors raised by the connection lifecycle manager and the broker transport.
//! Connect failures carry a [`ConnectFailureKind`] used only for diagnostics;
//! the kind never changes how reconnection behaves.

use std::fmt;
use std::time::Duration;

/// Diagnostic classification of a failed connect sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    /// Nothing listening at the broker address
    Refused,
    /// Broker rejected the credentials or vhost permissions
    AccessDenied,
    /// Broker hostname did not resolve
    HostNotFound,
    /// Connect sequence did not finish in time
    Timeout,
    /// Anything we could not recognise
    Other,
}

impl ConnectFailureKind {
    /// Classify an error message by its identifying text.
    ///
    /// Not exhaustive: unknown messages fall through to [`ConnectFailureKind::Other`].
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("refused") && !msg.contains("access") {
            return Self::Refused;
        }
        if msg.contains("access_refused")
            || msg.contains("access refused")
            || msg.contains("access-refused")
            || msg.contains("403")
            || msg.contains("authentication")
        {
            return Self::AccessDenied;
        }
        if msg.contains("lookup")
            || msg.contains("not known")
            || msg.contains("no such host")
            || msg.contains("nodename")
            || msg.contains("dns")
        {
            return Self::HostNotFound;
        }
        if msg.contains("timed out") || msg.contains("timeout") {
            return Self::Timeout;
        }

        Self::Other
    }

    /// Operator-facing hint logged next to the raw error
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Refused => "broker is not accepting connections; is it running and is the port correct?",
            Self::AccessDenied => "credentials rejected or user lacks permissions on the virtual host",
            Self::HostNotFound => "broker hostname could not be resolved",
            Self::Timeout => "broker did not answer in time; check network reachability",
            Self::Other => "unclassified connection failure",
        }
    }
}

impl fmt::Display for ConnectFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Refused => "connection refused",
            Self::AccessDenied => "access denied",
            Self::HostNotFound => "host not found",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error types for broker operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Connect sequence failed (connection or channel open)
    #[error("Connect failed ({kind}): {message}")]
    Connect {
        kind: ConnectFailureKind,
        message: String,
    },

    /// Another connect attempt already owns the link
    #[error("Connect attempt already in progress")]
    ConnectInProgress,

    /// Reconnect policy exhausted; the process must stop
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// No usable channel at call time
    #[error("Broker channel is not available")]
    Unavailable,

    /// Exchange declare rejected or unconfirmed
    #[error("Failed to assert exchange '{exchange}': {message}")]
    ExchangeAssertion { exchange: String, message: String },

    /// Publish call failed
    #[error("Failed to publish to exchange '{exchange}': {message}")]
    Publish { exchange: String, message: String },

    /// Broker operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Graceful close failed
    #[error("Close failed: {0}")]
    Close(String),
}

impl BrokerError {
    /// Build a classified connect error from a transport message
    pub fn connect(message: impl Into<String>) -> Self {
        let message = message.into();
        BrokerError::Connect {
            kind: ConnectFailureKind::classify(&message),
            message,
        }
    }

    /// Diagnostic kind for connect-phase failures
    pub fn connect_kind(&self) -> Option<ConnectFailureKind> {
        match self {
            BrokerError::Connect { kind, .. } => Some(*kind),
            BrokerError::Timeout { .. } => Some(ConnectFailureKind::Timeout),
            _ => None,
        }
    }

    /// Whether the failure says the channel or connection went away mid-operation
    pub fn is_link_closed(&self) -> bool {
        match self {
            BrokerError::Unavailable => true,
            BrokerError::ExchangeAssertion { message, .. }
            | BrokerError::Publish { message, .. } => {
                let msg = message.to_lowercase();
                (msg.contains("channel") || msg.contains("connection")) && msg.contains("closed")
            }
            _ => false,
        }
    }
}

/// Failure of an operation that ran on the shared link
///
/// `epoch` names the link the operation used, or `None` when no channel was
/// available at call time.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct LinkError {
    pub epoch: Option<u64>,
    #[source]
    pub error: BrokerError,
}

impl LinkError {
    pub fn new(epoch: Option<u64>, error: BrokerError) -> Self {
        Self { epoch, error }
    }

    pub fn unavailable() -> Self {
        Self::new(None, BrokerError::Unavailable)
    }

    pub fn is_link_closed(&self) -> bool {
        self.error.is_link_closed()
    }
}
