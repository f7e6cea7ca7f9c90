//! Readiness-driven event loop for one broker connection.
//!
//! The loop owns the socket for its whole life. One polling task waits on
//! read readiness, the stop signal and the keep-alive timer; a separate
//! writer task drains the outbound queue so a slow queue wait never stalls
//! readiness detection.
//!
//! # Phases
//!
//! ```text
//! Idle ──start──► Connecting ──connected──► Open ──fatal error / stop──► Closed
//!                     │                                                   ▲
//!                     └──────────────── connect failed ───────────────────┘
//! ```
//!
//! Every exit from `Open` (or a failed connect) runs the same teardown:
//! close the [`ConnectionState`], fail the tokens it registered, then report to the
//! [`LifecycleOwner`] once.

// ============================================================================
// Imports
// ============================================================================

use std::io::ErrorKind;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::TokenKey;
use crate::protocol::{Packet, PacketCodec, encode_to};

use super::state::ConnectionState;

// ============================================================================
// Constants
// ============================================================================

/// Bytes read per readiness event.
const READ_BUFFER_SIZE: usize = 1024;

/// Initial capacity of the writer's encode buffer.
const WRITE_BUFFER_SIZE: usize = 4096;

/// How long teardown waits for an in-progress write before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// A fatal error and the token whose processing surfaced it.
type Fault = (Option<TokenKey>, Error);

/// Receives the single teardown report of an [`EventLoop`].
pub trait LifecycleOwner: Send + Sync {
    /// Tears down the connection.
    ///
    /// `reason` is `None` for a clean stop. Implementations must be
    /// idempotent: the first call wins.
    fn shutdown_connection(&self, key: Option<TokenKey>, reason: Option<Error>);
}

/// Lifecycle phase of an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Created, not started.
    Idle,
    /// TCP connect in progress.
    Connecting,
    /// Socket established, reading and writing.
    Open,
    /// Terminal.
    Closed,
}

/// Connection parameters for one [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// `host:port` of the broker.
    pub address: String,
    /// Limit for the TCP connect.
    pub connect_timeout: Duration,
    /// PINGREQ interval. Zero disables keep-alive.
    pub keep_alive: Duration,
    /// Largest inbound packet accepted.
    pub max_packet_size: usize,
}

impl LoopConfig {
    /// Creates a config with keep-alive disabled.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::ZERO,
            max_packet_size: crate::protocol::MAX_PACKET_SIZE,
        }
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// Socket owner for one connection attempt.
///
/// An event loop runs once. Reconnecting builds a fresh instance.
pub struct EventLoop {
    config: LoopConfig,
    state: Arc<ConnectionState>,
    owner: Weak<dyn LifecycleOwner>,
    phase: watch::Sender<LoopPhase>,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("address", &self.config.address)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Creates an idle event loop.
    #[must_use]
    pub fn new(
        config: LoopConfig,
        state: Arc<ConnectionState>,
        owner: Weak<dyn LifecycleOwner>,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(LoopPhase::Idle);
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state,
            owner,
            phase,
            stop,
        })
    }

    /// Current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> LoopPhase {
        *self.phase.borrow()
    }

    /// Connection state driven by this loop.
    #[inline]
    #[must_use]
    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    /// Starts connecting in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the loop is idle.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let started = self.phase.send_if_modified(|phase| {
            if *phase != LoopPhase::Idle {
                return false;
            }
            *phase = LoopPhase::Connecting;
            true
        });
        if !started {
            return Err(Error::invalid_state(format!(
                "event loop already {:?}",
                self.phase()
            )));
        }

        debug!(address = %self.config.address, "Event loop starting");
        tokio::spawn(Arc::clone(self).run());
        Ok(())
    }

    /// Requests a stop. Returns immediately; teardown runs on the loop task.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        if self.phase() == LoopPhase::Idle {
            self.phase.send_replace(LoopPhase::Closed);
        }
    }

    /// Waits until the loop reaches [`LoopPhase::Closed`].
    pub async fn wait_closed(&self) {
        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|phase| *phase == LoopPhase::Closed).await;
    }

    fn set_phase(&self, next: LoopPhase) {
        let previous = self.phase.send_replace(next);
        trace!(?previous, ?next, "Event loop phase changed");
    }

    // ========================================================================
    // Polling Task
    // ========================================================================

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow() {
            self.finish(Ok(()));
            return;
        }

        let connected = tokio::select! {
            _ = stop_rx.changed() => Ok(None),
            result = self.connect() => result.map(Some),
        };

        let outcome = match connected {
            Ok(Some(stream)) => {
                self.set_phase(LoopPhase::Open);
                info!(address = %self.config.address, "Connection open");
                self.drive(stream, &mut stop_rx).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err((None, e)),
        };

        self.finish(outcome);
    }

    async fn connect(&self) -> Result<TcpStream> {
        let address = lookup_host(self.config.address.as_str())
            .await
            .map_err(|e| Error::connection_lost_io("address resolution failed", e))?
            .next()
            .ok_or_else(|| {
                Error::connection_lost(format!("no address for {}", self.config.address))
            })?;

        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        let limit = self.config.connect_timeout;
        let stream = timeout(limit, socket.connect(address))
            .await
            .map_err(|_| Error::connection_timeout(limit.as_millis() as u64))?
            .map_err(|e| Error::connection_lost_io("connect failed", e))?;
        stream.set_nodelay(true)?;

        debug!(%address, "TCP connected");
        Ok(stream)
    }

    async fn drive(
        &self,
        stream: TcpStream,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), Fault> {
        let stream = Arc::new(stream);
        let mut writer = tokio::spawn(write_loop(Arc::clone(&self.state), Arc::clone(&stream)));

        let outcome = self.poll_loop(&stream, stop_rx, &mut writer).await;

        self.state.close();
        if !writer.is_finished() && timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            warn!("Writer did not drain, aborting");
            writer.abort();
        }
        outcome
    }

    async fn poll_loop(
        &self,
        stream: &TcpStream,
        stop_rx: &mut watch::Receiver<bool>,
        writer: &mut JoinHandle<std::result::Result<(), Fault>>,
    ) -> std::result::Result<(), Fault> {
        let mut codec = PacketCodec::new(self.config.max_packet_size);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut keep_alive = keep_alive_timer(self.config.keep_alive);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("Stop requested");
                    return Ok(());
                }

                joined = &mut *writer => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err((None, Error::protocol(format!("writer task failed: {e}")))),
                    };
                }

                () = next_tick(&mut keep_alive) => {
                    self.on_keep_alive()?;
                }

                ready = stream.readable() => {
                    ready.map_err(|e| (None, Error::connection_lost_io("read readiness failed", e)))?;
                    match stream.try_read(&mut buf) {
                        Ok(0) => return self.on_peer_closed(),
                        Ok(n) => {
                            trace!(bytes = n, "Read");
                            codec.extend(&buf[..n]);
                            self.dispatch(&mut codec).await?;
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => {
                            return Err((None, Error::connection_lost_io("read failed", e)));
                        }
                    }
                }
            }
        }
    }

    /// Routes every complete packet in the codec buffer.
    async fn dispatch(&self, codec: &mut PacketCodec) -> std::result::Result<(), Fault> {
        while let Some(packet) = codec.next_packet().map_err(|e| (None, e))? {
            let key = packet.token_key();
            trace!(packet_type = ?packet.packet_type(), ?key, "Packet received");
            let result = if packet.is_ack() {
                self.state.notify_received_ack(packet).await
            } else {
                self.state.notify_received_message(packet)
            };
            result.map_err(|e| (key, e))?;
        }
        Ok(())
    }

    fn on_keep_alive(&self) -> std::result::Result<(), Fault> {
        if self.state.ping_outstanding() {
            return Err((
                Some(TokenKey::Ping),
                Error::connection_lost("keep-alive timeout"),
            ));
        }
        trace!("Sending PINGREQ");
        self.state
            .enqueue(Packet::PingReq)
            .map(drop)
            .map_err(|e| (Some(TokenKey::Ping), e))
    }

    fn on_peer_closed(&self) -> std::result::Result<(), Fault> {
        if self.state.is_disconnecting() {
            debug!("Peer closed after DISCONNECT");
            return Ok(());
        }
        Err((None, Error::connection_lost("connection closed by peer")))
    }

    /// Teardown shared by every exit path.
    fn finish(&self, outcome: std::result::Result<(), Fault>) {
        self.state.close();
        let reason = match &outcome {
            Ok(()) => "connection closed".to_owned(),
            Err((_, e)) => e.to_string(),
        };
        self.state.fail_pending(&reason);
        self.set_phase(LoopPhase::Closed);

        let (key, error) = match outcome {
            Ok(()) => {
                debug!(address = %self.config.address, "Event loop stopped");
                (None, None)
            }
            Err((key, error)) => {
                warn!(address = %self.config.address, ?key, error = %error, "Event loop failed");
                (key, Some(error))
            }
        };
        if let Some(owner) = self.owner.upgrade() {
            owner.shutdown_connection(key, error);
        }
    }
}

// ============================================================================
// Writer Task
// ============================================================================

async fn write_loop(
    state: Arc<ConnectionState>,
    stream: Arc<TcpStream>,
) -> std::result::Result<(), Fault> {
    let mut buffer = BytesMut::with_capacity(WRITE_BUFFER_SIZE);
    while let Some(packet) = state.take_next().await {
        write_packet(&state, &stream, &mut buffer, packet).await?;
    }
    debug!("Writer stopped");
    Ok(())
}

/// Writes one queued packet.
///
/// Acknowledgements go straight out. Anything else with a key is written
/// inside its token's critical section; if the token is gone the packet is
/// dropped.
async fn write_packet(
    state: &ConnectionState,
    stream: &TcpStream,
    buffer: &mut BytesMut,
    packet: Packet,
) -> std::result::Result<(), Fault> {
    let key = packet.token_key();
    buffer.clear();
    encode_to(&packet, buffer).map_err(|e| (key, e))?;

    let token = match key {
        Some(_) if !packet.is_ack() => match state.token_for(&packet) {
            Some(token) => Some(token),
            None => {
                state.discard(&packet);
                return Ok(());
            }
        },
        _ => None,
    };
    let _guard = match &token {
        Some(token) => Some(token.lock_send().await),
        None => None,
    };

    match write_all(stream, buffer).await {
        Ok(written) => {
            state.notify_sent_bytes(written);
            state.notify_sent(&packet);
            Ok(())
        }
        Err(e) if matches!(packet, Packet::Disconnect) => {
            debug!(error = %e, "DISCONNECT write failed, ignoring");
            state.discard(&packet);
            state.resolve_sent(TokenKey::Disconnect);
            Ok(())
        }
        Err(e) => Err((key, e)),
    }
}

async fn write_all(stream: &TcpStream, mut bytes: &[u8]) -> Result<usize> {
    let total = bytes.len();
    while !bytes.is_empty() {
        stream
            .writable()
            .await
            .map_err(|e| Error::connection_lost_io("write readiness failed", e))?;
        match stream.try_write(bytes) {
            Ok(0) => return Err(Error::connection_lost("socket closed during write")),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::connection_lost_io("write failed", e)),
        }
    }
    Ok(total)
}

// ============================================================================
// Keep-Alive Timer
// ============================================================================

fn keep_alive_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
