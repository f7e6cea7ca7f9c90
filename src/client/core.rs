//! Client handle and connection lifecycle.
//!
//! The [`Client`] turns commands into packets, waits for their tokens and
//! owns the connection lifecycle. Each connection attempt gets a fresh
//! [`Link`]: one [`ConnectionState`], one [`EventLoop`] and the teardown
//! logic the loop reports to.
//!
//! # Example
//!
//! ```no_run
//! use mqtt_link::{Client, ConnectOptions, QoS};
//!
//! # async fn example() -> mqtt_link::Result<()> {
//! let client = Client::builder()
//!     .server_uri("tcp://localhost:1883")
//!     .build()?;
//!
//! client.on_message(|message| {
//!     println!("{}: {:?}", message.topic(), message.payload());
//! });
//!
//! client.connect(ConnectOptions::new()).await?;
//! client.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//! client.publish("sensors/t1", "21.5", QoS::AtLeastOnce, false).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, TokenKey};
use crate::protocol::{
    Connect, Packet, Publish, QoS, Subscribe, SubscribeReturnCode, Unsubscribe,
};
use crate::transport::{
    Callbacks, ConnectionState, EventLoop, LifecycleOwner, LoopConfig, PendingToken, StateStats,
    TokenStore,
};

use super::builder::ClientBuilder;
use super::options::ConnectOptions;

// ============================================================================
// Constants
// ============================================================================

/// First automatic reconnect delay.
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of the reconnect back-off.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(128);

/// How long `disconnect` waits for the event loop to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Link
// ============================================================================

/// One connection attempt and its teardown.
pub(crate) struct Link {
    client: Weak<ClientInner>,
    state: Arc<ConnectionState>,
    event_loop: Arc<EventLoop>,
    shut_down: AtomicBool,
}

impl Link {
    fn new(client: Weak<ClientInner>, config: LoopConfig, state: Arc<ConnectionState>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let owner: Weak<dyn LifecycleOwner> = weak.clone();
            Self {
                client,
                event_loop: EventLoop::new(config, Arc::clone(&state), owner),
                state,
                shut_down: AtomicBool::new(false),
            }
        })
    }
}

impl LifecycleOwner for Link {
    fn shutdown_connection(&self, key: Option<TokenKey>, reason: Option<Error>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.event_loop.stop();
        self.state.close();
        let text = reason
            .as_ref()
            .map_or_else(|| "connection closed".to_owned(), ToString::to_string);
        self.state.fail_pending(&text);

        let Some(error) = reason else {
            debug!("Connection shut down");
            return;
        };
        warn!(?key, error = %error, "Connection shut down with error");

        // Failures before CONNACK surface through the connect call instead
        if self.state.was_connected()
            && let Some(client) = self.client.upgrade()
        {
            client.connection_lost(self, &error);
        }
    }
}

// ============================================================================
// ClientInner
// ============================================================================

/// Internal shared state for the client.
pub(crate) struct ClientInner {
    /// Broker URI as given to the builder.
    server_uri: String,

    /// `host:port` to connect to.
    address: String,

    /// Identifier sent in CONNECT.
    client_id: ClientId,

    /// Tokens outlive individual links.
    tokens: Arc<TokenStore>,

    /// Application callbacks.
    callbacks: Arc<Callbacks>,

    /// Current link, if any.
    link: Mutex<Option<Arc<Link>>>,

    /// Options of the last `connect`, reused by reconnects.
    options: Mutex<ConnectOptions>,

    /// Serializes connect, disconnect and reconnect attempts.
    lifecycle: AsyncMutex<()>,

    /// Set by `disconnect`, stops reconnecting.
    closing: AtomicBool,

    /// A reconnect task is running.
    reconnecting: AtomicBool,
}

impl ClientInner {
    fn current_link(&self) -> Result<Arc<Link>> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| link.state.is_connected())
            .cloned()
            .ok_or(Error::NotConnected)
    }

    fn action_timeout(&self) -> Duration {
        self.options.lock().action_wait()
    }

    /// Builds a link and runs the CONNECT handshake on it.
    ///
    /// Caller holds the lifecycle lock.
    async fn open_link(self: &Arc<Self>, options: &ConnectOptions, reconnect: bool) -> Result<()> {
        let state = Arc::new(ConnectionState::new(
            Arc::clone(&self.tokens),
            Arc::clone(&self.callbacks),
            options.max_inflight,
        ));
        let config = LoopConfig {
            address: self.address.clone(),
            connect_timeout: options.connect_timeout(),
            keep_alive: options.keep_alive(),
            max_packet_size: options.max_packet_size,
        };
        let link = Link::new(Arc::downgrade(self), config, state);

        let previous = self.link.lock().replace(Arc::clone(&link));
        if let Some(previous) = previous {
            previous.shutdown_connection(None, None);
            previous.event_loop.wait_closed().await;
        }

        match self.handshake(&link, options).await {
            Ok(session_present) => {
                info!(
                    server = %self.server_uri,
                    client_id = %self.client_id,
                    session_present,
                    reconnect,
                    "Connected"
                );
                self.callbacks.connect_complete(reconnect, &self.server_uri);
                Ok(())
            }
            Err(e) => {
                link.shutdown_connection(Some(TokenKey::Connect), None);
                link.event_loop.wait_closed().await;
                self.clear_link(&link);
                Err(e)
            }
        }
    }

    /// Starts the event loop, sends CONNECT and waits for CONNACK.
    async fn handshake(&self, link: &Link, options: &ConnectOptions) -> Result<bool> {
        link.event_loop.start()?;

        let mut connect = Connect::new(
            self.client_id.clone(),
            options.keep_alive_interval,
            options.clean_session,
        );
        connect.username = options.username.clone();
        connect.password = options.password.clone().map(Bytes::from);

        let token = link
            .state
            .enqueue(Packet::Connect(connect))?
            .ok_or_else(|| Error::protocol("CONNECT registered no token"))?;

        let limit = options.connect_timeout();
        let ack = match token.wait_timeout(limit).await {
            Ok(ack) => ack,
            Err(Error::RequestTimeout { .. }) => {
                return Err(Error::connection_timeout(limit.as_millis() as u64));
            }
            Err(Error::RequestFailed { reason, .. }) => {
                return Err(Error::connection_lost(reason));
            }
            Err(e) => return Err(e),
        };

        match ack {
            Some(Packet::ConnAck(connack)) if connack.return_code.is_accepted() => {
                Ok(connack.session_present)
            }
            Some(Packet::ConnAck(connack)) => Err(Error::connect_refused(connack.return_code)),
            other => Err(Error::protocol(format!("CONNECT answered with {other:?}"))),
        }
    }

    /// Forgets `link` if it is still the current one.
    fn clear_link(&self, link: &Link) {
        let mut current = self.link.lock();
        if current
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), link))
        {
            *current = None;
        }
    }

    /// Reports the loss of an established link.
    fn connection_lost(self: Arc<Self>, link: &Link, error: &Error) {
        self.clear_link(link);
        self.callbacks.connection_lost(error);

        let reconnect =
            self.options.lock().automatic_reconnect && !self.closing.load(Ordering::Acquire);
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(reconnect_loop(Arc::downgrade(self)));
    }
}

/// Retries with exponential back-off until connected, disconnected or dropped.
async fn reconnect_loop(client: Weak<ClientInner>) {
    let mut delay = RECONNECT_INITIAL_DELAY;
    loop {
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        sleep(delay).await;

        let Some(inner) = client.upgrade() else {
            return;
        };
        let _guard = inner.lifecycle.lock().await;
        if inner.closing.load(Ordering::Acquire) {
            inner.reconnecting.store(false, Ordering::Release);
            return;
        }

        let options = inner.options.lock().clone();
        match inner.open_link(&options, true).await {
            Ok(()) => {
                inner.reconnecting.store(false, Ordering::Release);
                // Lost again before the flag cleared
                if inner.current_link().is_ok() {
                    return;
                }
                inner.reconnecting.store(true, Ordering::Release);
            }
            Err(e) => warn!(error = %e, "Reconnect failed"),
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

// ============================================================================
// Client
// ============================================================================

/// MQTT client handle.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    /// Shared inner state.
    pub(crate) inner: Arc<ClientInner>,
}

// ============================================================================
// Client - Display
// ============================================================================

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server_uri", &self.inner.server_uri)
            .field("client_id", &self.inner.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client - Public API
// ============================================================================

impl Client {
    /// Creates a configuration builder for the client.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Broker URI.
    #[inline]
    #[must_use]
    pub fn server_uri(&self) -> &str {
        &self.inner.server_uri
    }

    /// Client identifier.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Returns `true` while a CONNACK-accepted connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.current_link().is_ok()
    }

    /// Traffic counters of the current connection.
    #[must_use]
    pub fn stats(&self) -> Option<StateStats> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.state.stats())
    }

    /// Connects to the broker and waits for CONNACK.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - [`Error::InvalidState`] if already connected
    /// - [`Error::ConnectionTimeout`] if CONNACK did not arrive in time
    /// - [`Error::ConnectRefused`] if the broker refused the connection
    /// - [`Error::ConnectionLost`] if the socket failed during the handshake
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        options.validate()?;
        let _guard = self.inner.lifecycle.lock().await;
        if self.is_connected() {
            return Err(Error::invalid_state("already connected"));
        }

        *self.inner.options.lock() = options.clone();
        self.inner.closing.store(false, Ordering::Release);
        debug!(server = %self.inner.server_uri, "Connecting");
        self.inner.open_link(&options, false).await
    }

    /// Subscribes to a topic filter and returns the granted QoS.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a malformed filter
    /// - [`Error::NotConnected`] without an open connection
    /// - [`Error::SubscribeRejected`] if the broker refused the filter
    /// - [`Error::RequestTimeout`] if SUBACK did not arrive in time
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS> {
        validate_topic_filter(filter)?;
        let link = self.inner.current_link()?;
        let token = link.state.enqueue_new(|packet_id| {
            Packet::Subscribe(Subscribe {
                packet_id,
                filters: vec![(filter.to_owned(), qos)],
            })
        })?;

        match self.wait(&token).await? {
            Some(Packet::SubAck(suback)) => match suback.return_codes.first() {
                Some(SubscribeReturnCode::Success(granted)) => {
                    debug!(filter, ?granted, "Subscribed");
                    Ok(*granted)
                }
                _ => Err(Error::subscribe_rejected(filter)),
            },
            other => Err(Error::protocol(format!("SUBSCRIBE answered with {other:?}"))),
        }
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a malformed filter
    /// - [`Error::NotConnected`] without an open connection
    /// - [`Error::RequestTimeout`] if UNSUBACK did not arrive in time
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        validate_topic_filter(filter)?;
        let link = self.inner.current_link()?;
        let token = link.state.enqueue_new(|packet_id| {
            Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topics: vec![filter.to_owned()],
            })
        })?;

        self.wait(&token).await?;
        debug!(filter, "Unsubscribed");
        Ok(())
    }

    /// Publishes a message and waits until its QoS flow completes.
    ///
    /// QoS 0 completes once written, QoS 1 on PUBACK, QoS 2 on PUBCOMP.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an invalid topic name
    /// - [`Error::NotConnected`] without an open connection
    /// - [`Error::TooManyInflight`] if the in-flight limit is reached
    /// - [`Error::RequestTimeout`] if the flow did not complete in time
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        validate_topic_name(topic)?;
        let payload = payload.into();
        let link = self.inner.current_link()?;
        let token = link.state.enqueue_new(|packet_id| {
            Packet::Publish(Publish::new(topic, payload, qos, retain, Some(packet_id)))
        })?;

        self.wait(&token).await?;
        Ok(())
    }

    /// Sends DISCONNECT and closes the connection.
    ///
    /// Stops automatic reconnect. Succeeds when already disconnected.
    ///
    /// # Errors
    ///
    /// Currently infallible; a failed DISCONNECT write is ignored.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::Release);
        let _guard = self.inner.lifecycle.lock().await;

        let Some(link) = self.inner.link.lock().take() else {
            debug!("Disconnect without connection");
            return Ok(());
        };

        link.state.begin_disconnect();
        match link.state.enqueue(Packet::Disconnect) {
            Ok(Some(token)) => {
                if let Err(e) = token.wait_timeout(self.inner.action_timeout()).await {
                    debug!(error = %e, "DISCONNECT not confirmed");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "DISCONNECT not queued"),
        }

        link.shutdown_connection(None, None);
        if timeout(CLOSE_TIMEOUT, link.event_loop.wait_closed()).await.is_err() {
            warn!("Event loop did not close in time");
        }
        info!(server = %self.inner.server_uri, "Disconnected");
        Ok(())
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Sets the handler for inbound messages.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Publish) + Send + Sync + 'static,
    {
        self.inner.callbacks.set_message_handler(Box::new(handler));
    }

    /// Sets the handler for unexpected connection loss.
    pub fn on_connection_lost<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .set_connection_lost_handler(Box::new(handler));
    }

    /// Sets the handler called after each accepted CONNACK.
    pub fn on_connect_complete<F>(&self, handler: F)
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .set_connect_complete_handler(Box::new(handler));
    }

    /// Sets the handler called when an outbound publish completes.
    pub fn on_delivery_complete<F>(&self, handler: F)
    where
        F: Fn(TokenKey) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .set_delivery_complete_handler(Box::new(handler));
    }
}

// ============================================================================
// Client - Internal API
// ============================================================================

impl Client {
    /// Creates a disconnected client.
    pub(crate) fn new(server_uri: String, address: String, client_id: ClientId) -> Self {
        let inner = Arc::new(ClientInner {
            server_uri,
            address,
            client_id,
            tokens: Arc::new(TokenStore::new()),
            callbacks: Arc::new(Callbacks::new()),
            link: Mutex::new(None),
            options: Mutex::new(ConnectOptions::new()),
            lifecycle: AsyncMutex::new(()),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Waits for a command token within the action timeout.
    async fn wait(&self, token: &PendingToken) -> Result<Option<Packet>> {
        token.wait_timeout(self.inner.action_timeout()).await
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validates a topic name used for publishing.
fn validate_topic_name(topic: &str) -> Result<()> {
    validate_topic_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(Error::invalid_argument(format!(
            "topic name must not contain wildcards: {topic}"
        )));
    }
    Ok(())
}

/// Validates a subscription filter.
fn validate_topic_filter(filter: &str) -> Result<()> {
    validate_topic_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let last = index + 1 == levels.len();
        let valid = match *level {
            "#" => last,
            "+" => true,
            other => !other.contains(['+', '#']),
        };
        if !valid {
            return Err(Error::invalid_argument(format!("invalid topic filter: {filter}")));
        }
    }
    Ok(())
}

fn validate_topic_common(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::invalid_argument("topic must not be empty"));
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(Error::invalid_argument("topic longer than 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(Error::invalid_argument("topic contains NUL"));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
