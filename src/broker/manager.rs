//! Connection Lifecycle Manager
//!
//! Owns the single broker connection/channel pair shared by every request.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                  |
//!      +-------- failure ---------+---- error/close -+
//! ```
//!
//! # Invariants
//!
//! - `is_reconnecting` is true exactly while a connect sequence runs, and a
//!   second `connect()` during that window fails without side effects
//! - at most one retry is pending at any time
//! - `attempt_count` only goes back to 0 after a successful connect
//! - the exchange cache is emptied whenever the link is lost or replaced
//!
//! Broker failures arrive as [`LinkEvent`]s on an mpsc channel drained by a
//! single control loop. Retries run as tracked tasks holding a child of the
//! manager's root [`CancellationToken`], so [`ConnectionManager::shutdown`]
//! stops them deterministically.

use crate::broker::address;
use crate::broker::cache::ExchangeCache;
use crate::broker::error::{BrokerError, ConnectFailureKind, LinkError};
use crate::broker::transport::{
    BrokerChannel, BrokerConnection, Connector, LinkEvent, LinkEventKind, LinkObserver,
    PublishProperties,
};
use crate::metrics;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Fixed delay between reconnect attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Tunables for the manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Fully joined target address (base plus optional vhost)
    pub target_uri: String,
    /// Attempts allowed before the process gives up (at least 1)
    pub max_attempts: u32,
    pub reconnect_interval: Duration,
    /// Bound on the whole connect sequence
    pub connect_timeout: Duration,
    /// Bound on declare, publish and close calls
    pub operation_timeout: Duration,
}

impl ManagerSettings {
    pub fn new(target_uri: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            target_uri: target_uri.into(),
            max_attempts: max_attempts.max(1),
            reconnect_interval: RECONNECT_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Link phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only snapshot of the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub state: LinkPhase,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
    pub is_reconnecting: bool,
    pub retry_pending: bool,
    pub cached_exchanges: usize,
    pub epoch: u64,
    pub exhausted: bool,
}

/// What `schedule_reconnect` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A new retry was armed
    Scheduled,
    /// A retry was already pending
    AlreadyPending,
    /// A connect attempt is running
    ConnectInProgress,
    /// Attempts are used up; the process must stop
    Exhausted,
    /// The manager is shutting down
    ShuttingDown,
}

pub(super) struct PendingRetry {
    id: u64,
    token: CancellationToken,
}

pub(super) struct LinkState {
    pub(super) phase: LinkPhase,
    pub(super) connection: Option<Arc<dyn BrokerConnection>>,
    pub(super) channel: Option<Arc<dyn BrokerChannel>>,
    /// Epoch of the committed link; 0 before the first connect
    pub(super) epoch: u64,
    pub(super) cache: ExchangeCache,
    next_epoch: u64,
    connecting_epoch: Option<u64>,
    failed_during_connect: bool,
    attempt_count: u32,
    is_reconnecting: bool,
    pending_retry: Option<PendingRetry>,
    next_retry_id: u64,
    exhausted: bool,
}

impl LinkState {
    fn new() -> Self {
        Self {
            phase: LinkPhase::Disconnected,
            connection: None,
            channel: None,
            epoch: 0,
            cache: ExchangeCache::new(),
            next_epoch: 1,
            connecting_epoch: None,
            failed_during_connect: false,
            attempt_count: 0,
            is_reconnecting: false,
            pending_retry: None,
            next_retry_id: 0,
            exhausted: false,
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            pending.token.cancel();
        }
    }
}

enum Arm {
    Armed(PendingRetry),
    Skip(ScheduleOutcome),
    Fatal,
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: ManagerSettings,
    state: Mutex<LinkState>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    root: CancellationToken,
    exhausted: CancellationToken,
    tasks: TaskTracker,
}

/// Handle to the process-wide broker link
///
/// Cloning is cheap; all clones share one link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create the manager and start its event loop
    ///
    /// Does not connect; call [`connect`](Self::connect) (and on failure
    /// [`schedule_reconnect`](Self::schedule_reconnect)) to bring the link up.
    pub fn spawn(connector: Arc<dyn Connector>, settings: ManagerSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                state: Mutex::new(LinkState::new()),
                events_tx,
                root: CancellationToken::new(),
                exhausted: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        };

        let event_loop = manager.clone();
        manager.inner.tasks.spawn(event_loop.run_event_loop(events_rx));
        metrics::BROKER_CONNECTED.set(0);
        manager
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Token cancelled once reconnect attempts are exhausted
    pub fn exhausted(&self) -> CancellationToken {
        self.inner.exhausted.clone()
    }

    pub(super) fn state(&self) -> MutexGuard<'_, LinkState> {
        // Poisoning only means another thread panicked mid-update, and the panic
        // hook already terminates the process in that case
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current status snapshot
    pub fn status(&self) -> LinkStatus {
        let st = self.state();
        LinkStatus {
            state: st.phase,
            connected: st.channel.is_some() && st.phase == LinkPhase::Connected,
            reconnect_attempts: st.attempt_count,
            max_attempts: self.inner.settings.max_attempts,
            is_reconnecting: st.is_reconnecting,
            retry_pending: st.pending_retry.is_some(),
            cached_exchanges: st.cache.len(),
            epoch: st.epoch,
            exhausted: st.exhausted,
        }
    }

    /// Whether a usable channel exists right now
    pub fn is_connected(&self) -> bool {
        self.state().channel.is_some()
    }

    /// Run one connect sequence
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let settings = &self.inner.settings;

        let (attempt, epoch) = {
            let mut st = self.state();
            if st.exhausted {
                return Err(BrokerError::ReconnectExhausted {
                    attempts: st.attempt_count,
                });
            }
            if st.is_reconnecting {
                debug!("Connect requested while another attempt is running");
                return Err(BrokerError::ConnectInProgress);
            }
            st.is_reconnecting = true;
            st.attempt_count += 1;
            st.phase = LinkPhase::Connecting;
            let epoch = st.next_epoch;
            st.next_epoch += 1;
            st.connecting_epoch = Some(epoch);
            st.failed_during_connect = false;
            (st.attempt_count, epoch)
        };

        info!(
            attempt,
            max_attempts = settings.max_attempts,
            broker = %address::redact(&settings.target_uri),
            "Connecting to broker"
        );

        let opened = match tokio::time::timeout(settings.connect_timeout, self.open_link(epoch)).await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                operation: "connect",
                after: settings.connect_timeout,
            }),
        };

        let mut st = self.state();
        st.connecting_epoch = None;

        let opened = match opened {
            Ok((_, channel)) if st.failed_during_connect || !channel.is_open() => Err(
                BrokerError::connect("link closed while the connect sequence was running"),
            ),
            other => other,
        };

        match opened {
            Ok((connection, channel)) => {
                let stale_channel = st.channel.replace(channel);
                let stale_connection = st.connection.replace(connection);
                st.epoch = epoch;
                st.phase = LinkPhase::Connected;
                st.cache.clear();
                st.attempt_count = 0;
                st.is_reconnecting = false;
                drop(st);

                metrics::BROKER_CONNECT_ATTEMPTS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                metrics::BROKER_CONNECTED.set(1);
                info!(epoch, "Connected to broker");

                self.close_in_background(stale_channel, stale_connection);
                Ok(())
            }
            Err(err) => {
                st.is_reconnecting = false;
                st.phase = if st.channel.is_some() {
                    LinkPhase::Connected
                } else {
                    LinkPhase::Disconnected
                };
                let exhausted = st.attempt_count >= settings.max_attempts;
                if exhausted {
                    st.exhausted = true;
                    st.cancel_pending();
                }
                drop(st);

                metrics::BROKER_CONNECT_ATTEMPTS_TOTAL
                    .with_label_values(&["failure"])
                    .inc();
                let kind = err.connect_kind().unwrap_or(ConnectFailureKind::Other);
                error!(
                    attempt,
                    max_attempts = settings.max_attempts,
                    kind = %kind,
                    hint = kind.hint(),
                    "Broker connect failed: {}",
                    err
                );

                if exhausted {
                    self.declare_exhausted(attempt);
                    return Err(BrokerError::ReconnectExhausted { attempts: attempt });
                }
                Err(err)
            }
        }
    }

    async fn open_link(
        &self,
        epoch: u64,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), BrokerError> {
        let connection = self
            .inner
            .connector
            .connect(&self.inner.settings.target_uri)
            .await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                self.close_in_background(None, Some(connection));
                return Err(err);
            }
        };

        let observer = LinkObserver::new(epoch, self.inner.events_tx.clone());
        connection.observe(observer.clone());
        channel.observe(observer);

        Ok((connection, channel))
    }

    /// Arm a single delayed retry unless one is pending or running
    pub fn schedule_reconnect(&self) -> ScheduleOutcome {
        let arm = {
            let mut st = self.state();
            self.try_arm(&mut st)
        };

        match arm {
            Arm::Armed(retry) => {
                info!(
                    delay_ms = self.inner.settings.reconnect_interval.as_millis() as u64,
                    "Reconnect scheduled"
                );
                let task = self.clone();
                self.inner.tasks.spawn(task.run_retry(retry));
                ScheduleOutcome::Scheduled
            }
            Arm::Skip(outcome) => {
                debug!(?outcome, "Reconnect not scheduled");
                outcome
            }
            Arm::Fatal => {
                let attempts = self.state().attempt_count;
                self.declare_exhausted(attempts);
                ScheduleOutcome::Exhausted
            }
        }
    }

    fn try_arm(&self, st: &mut LinkState) -> Arm {
        if self.inner.root.is_cancelled() {
            return Arm::Skip(ScheduleOutcome::ShuttingDown);
        }
        if st.exhausted {
            return Arm::Skip(ScheduleOutcome::Exhausted);
        }
        if st.is_reconnecting {
            return Arm::Skip(ScheduleOutcome::ConnectInProgress);
        }
        if st.pending_retry.is_some() {
            return Arm::Skip(ScheduleOutcome::AlreadyPending);
        }
        if st.attempt_count >= self.inner.settings.max_attempts {
            st.exhausted = true;
            return Arm::Fatal;
        }

        st.next_retry_id += 1;
        let retry = PendingRetry {
            id: st.next_retry_id,
            token: self.inner.root.child_token(),
        };
        st.pending_retry = Some(PendingRetry {
            id: retry.id,
            token: retry.token.clone(),
        });
        Arm::Armed(retry)
    }

    async fn run_retry(self, mut retry: PendingRetry) {
        let interval = self.inner.settings.reconnect_interval;

        loop {
            tokio::select! {
                _ = retry.token.cancelled() => {
                    debug!(retry_id = retry.id, "Pending reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            {
                let mut st = self.state();
                let still_ours = matches!(&st.pending_retry, Some(pending) if pending.id == retry.id);
                if !still_ours {
                    // Superseded or cancelled after the timer fired
                    return;
                }
                st.pending_retry = None;
            }

            match self.connect().await {
                Ok(()) | Err(BrokerError::ReconnectExhausted { .. }) => return,
                Err(_) => {}
            }

            let arm = {
                let mut st = self.state();
                self.try_arm(&mut st)
            };
            match arm {
                Arm::Armed(next) => {
                    info!(
                        delay_ms = interval.as_millis() as u64,
                        "Reconnect rescheduled"
                    );
                    retry = next;
                }
                Arm::Skip(_) => return,
                Arm::Fatal => {
                    let attempts = self.state().attempt_count;
                    self.declare_exhausted(attempts);
                    return;
                }
            }
        }
    }

    fn declare_exhausted(&self, attempts: u32) {
        error!(
            attempts,
            max_attempts = self.inner.settings.max_attempts,
            "Reconnect attempts exhausted, giving up on the broker"
        );
        self.inner.exhausted.cancel();
    }

    async fn run_event_loop(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            tokio::select! {
                _ = self.inner.root.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_link_event(event),
                    None => break,
                },
            }
        }
        debug!("Link event loop stopped");
    }

    fn handle_link_event(&self, event: LinkEvent) {
        {
            let mut st = self.state();

            if st.connecting_epoch == Some(event.epoch) {
                warn!(epoch = event.epoch, kind = ?event.kind, "Link failed during connect");
                st.failed_during_connect = true;
                return;
            }
            if event.epoch != st.epoch {
                debug!(epoch = event.epoch, current = st.epoch, "Ignoring stale link event");
                return;
            }

            let label = match &event.kind {
                LinkEventKind::ConnectionError(reason) => {
                    error!(epoch = event.epoch, "Broker connection error: {}", reason);
                    st.channel = None;
                    "connection_error"
                }
                LinkEventKind::ChannelError(reason) => {
                    error!(epoch = event.epoch, "Broker channel error: {}", reason);
                    st.channel = None;
                    "channel_error"
                }
                LinkEventKind::ConnectionClosed(reason) => {
                    warn!(epoch = event.epoch, "Broker connection closed: {}", reason);
                    st.channel = None;
                    st.connection = None;
                    "connection_closed"
                }
            };
            metrics::BROKER_LINK_EVENTS_TOTAL
                .with_label_values(&[label])
                .inc();

            if st.phase == LinkPhase::Connected {
                st.phase = LinkPhase::Disconnected;
            }
            st.cache.clear();
            st.cancel_pending();
        }

        metrics::BROKER_CONNECTED.set(0);
        self.schedule_reconnect();
    }

    /// Treat an operation failure that saw a closed channel/connection as a link error
    ///
    /// Covers failures surfaced by a request before the transport's own error
    /// callback has been processed. `epoch` is the link the failed operation
    /// ran on; a failure from a link that has since been replaced is ignored.
    pub fn report_link_failure(&self, epoch: u64, reason: &str) {
        self.handle_link_event(LinkEvent {
            epoch,
            kind: LinkEventKind::ChannelError(reason.to_string()),
        });
    }

    /// Publish `payload` on the current channel
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), LinkError> {
        let (channel, epoch) = self.channel()?;
        let after = self.inner.settings.operation_timeout;
        let started = Instant::now();

        let result = tokio::time::timeout(
            after,
            channel.publish(exchange, routing_key, payload, properties),
        )
        .await
        .unwrap_or(Err(BrokerError::Timeout {
            operation: "publish",
            after,
        }));

        metrics::PUBLISH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        match result {
            Ok(()) => {
                metrics::MESSAGES_PUBLISHED_TOTAL.inc();
                Ok(())
            }
            Err(err) => Err(LinkError::new(Some(epoch), err)),
        }
    }

    /// Current channel together with the epoch of the link that owns it
    pub(super) fn channel(&self) -> Result<(Arc<dyn BrokerChannel>, u64), LinkError> {
        let st = self.state();
        match &st.channel {
            Some(channel) => Ok((channel.clone(), st.epoch)),
            None => Err(LinkError::unavailable()),
        }
    }

    pub(super) fn operation_timeout(&self) -> Duration {
        self.inner.settings.operation_timeout
    }

    fn close_in_background(
        &self,
        channel: Option<Arc<dyn BrokerChannel>>,
        connection: Option<Arc<dyn BrokerConnection>>,
    ) {
        if channel.is_none() && connection.is_none() {
            return;
        }
        let after = self.inner.settings.operation_timeout;
        self.inner
            .tasks
            .spawn(async move { close_link(channel, connection, after).await });
    }

    /// Stop retries and the event loop, then close the link
    pub async fn shutdown(&self) {
        info!("Shutting down broker link");
        self.inner.root.cancel();

        let (channel, connection) = {
            let mut st = self.state();
            st.cancel_pending();
            st.phase = LinkPhase::Disconnected;
            st.cache.clear();
            (st.channel.take(), st.connection.take())
        };
        metrics::BROKER_CONNECTED.set(0);

        let after = self.inner.settings.operation_timeout;
        close_link(channel, connection, after).await;

        self.inner.tasks.close();
        if tokio::time::timeout(after, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("Background broker tasks did not stop in time");
        }
        info!("Broker link closed");
    }
}

/// Best-effort close: channel first, then connection
async fn close_link(
    channel: Option<Arc<dyn BrokerChannel>>,
    connection: Option<Arc<dyn BrokerConnection>>,
    after: Duration,
) {
    if let Some(channel) = channel {
        match tokio::time::timeout(after, channel.close()).await {
            Ok(Ok(())) => debug!("Broker channel closed"),
            Ok(Err(e)) => warn!("Failed to close broker channel: {}", e),
            Err(_) => warn!("Timed out closing broker channel"),
        }
    }
    if let Some(connection) = connection {
        match tokio::time::timeout(after, connection.close()).await {
            Ok(Ok(())) => debug!("Broker connection closed"),
            Ok(Err(e)) => warn!("Failed to close broker connection: {}", e),
            Err(_) => warn!("Timed out closing broker connection"),
        }
    }
}
