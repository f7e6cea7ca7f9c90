//! Per-connection protocol state.
//!
//! [`ConnectionState`] owns the outbound queue and the QoS bookkeeping for
//! one connection. The event loop's writer drains the queue through
//! [`ConnectionState::take_next`]; the reader feeds decoded packets back
//! through the `notify_received_*` hooks.
//!
//! # Outbound ordering
//!
//! ```text
//! enqueue ──► register token ──► push back ──► take_next (peek front)
//!                                                   │
//!                                     write under token lock
//!                                                   │
//!                                     notify_sent (pop front)
//! ```
//!
//! A packet leaves the queue only after it has been written or the state
//! has been closed.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{PacketId, TokenKey};
use crate::protocol::{Packet, Publish, QoS};

use super::callback::Callbacks;
use super::token::{PendingToken, TokenStore};

// ============================================================================
// StateStats
// ============================================================================

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStats {
    /// Bytes fully written to the socket.
    pub sent_bytes: u64,
    /// Packets fully written to the socket.
    pub sent_packets: u64,
    /// Packets decoded from the socket.
    pub received_packets: u64,
    /// Packets waiting in the outbound queue.
    pub queued: usize,
    /// Outstanding tokens.
    pub inflight: usize,
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Outbound queue and acknowledgement bookkeeping for one connection.
pub struct ConnectionState {
    tokens: Arc<TokenStore>,
    /// Tags every token this connection registers.
    generation: u64,
    callbacks: Arc<Callbacks>,
    queue: Mutex<VecDeque<Packet>>,
    queue_ready: Notify,
    /// Inbound QoS 2 messages held until PUBREL.
    inbound: Mutex<FxHashMap<PacketId, Publish>>,
    max_inflight: usize,
    closed: AtomicBool,
    connected: AtomicBool,
    disconnecting: AtomicBool,
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    received_packets: AtomicU64,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ConnectionState {
    /// Creates state for a new connection.
    #[must_use]
    pub fn new(tokens: Arc<TokenStore>, callbacks: Arc<Callbacks>, max_inflight: usize) -> Self {
        Self {
            generation: tokens.next_generation(),
            tokens,
            callbacks,
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Notify::new(),
            inbound: Mutex::new(FxHashMap::default()),
            max_inflight,
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            sent_bytes: AtomicU64::new(0),
            sent_packets: AtomicU64::new(0),
            received_packets: AtomicU64::new(0),
        }
    }

    /// Token store shared with this state.
    #[inline]
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Generation tagging this connection's tokens.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn own_token(&self, key: &TokenKey) -> Option<Arc<PendingToken>> {
        self.tokens.get_in(self.generation, key)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queues a packet for sending.
    ///
    /// Packets that need a token get one registered before they become
    /// visible to the writer, so an acknowledgement arriving right after
    /// transmission always finds it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the state has been closed
    /// - [`Error::TooManyInflight`] if a QoS > 0 publish would exceed the limit
    /// - [`Error::TokenInUse`] if the packet's key is already outstanding
    pub fn enqueue(&self, packet: Packet) -> Result<Option<Arc<PendingToken>>> {
        self.ensure_open()?;
        self.check_inflight(&packet, 0)?;

        let token = if packet.registers_token() {
            Some(self.tokens.register_pending(self.generation, &packet)?)
        } else {
            None
        };

        self.push(packet, token.as_deref())?;
        Ok(token)
    }

    /// Allocates a packet identifier, builds the packet and queues it.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionState::enqueue`], plus
    /// [`Error::PacketIdsExhausted`].
    pub fn enqueue_new<F>(&self, build: F) -> Result<Arc<PendingToken>>
    where
        F: FnOnce(PacketId) -> Packet,
    {
        self.ensure_open()?;
        let (packet, token) = self.tokens.register_new(self.generation, build)?;
        if let Err(e) = self.check_inflight(&packet, 1) {
            self.tokens.fail(token.key(), "not sent");
            return Err(e);
        }
        self.push(packet, Some(&token))?;
        Ok(token)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// `own` is the number of tokens this packet has already registered.
    fn check_inflight(&self, packet: &Packet, own: usize) -> Result<()> {
        let Packet::Publish(publish) = packet else {
            return Ok(());
        };
        if publish.qos == QoS::AtMostOnce {
            return Ok(());
        }
        let inflight = self.tokens.inflight(self.generation).saturating_sub(own);
        if inflight >= self.max_inflight {
            warn!(inflight, max = self.max_inflight, "Too many in-flight messages");
            return Err(Error::TooManyInflight {
                inflight,
                max: self.max_inflight,
            });
        }
        Ok(())
    }

    fn push(&self, packet: Packet, token: Option<&PendingToken>) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if self.is_closed() {
                drop(queue);
                if let Some(token) = token {
                    self.tokens.fail(token.key(), "connection closed");
                }
                return Err(Error::NotConnected);
            }
            trace!(packet_type = ?packet.packet_type(), "Packet queued");
            queue.push_back(packet);
        }
        self.queue_ready.notify_one();
        Ok(())
    }

    /// Queues a protocol response (PUBACK, PUBREC, PUBREL, PUBCOMP).
    ///
    /// Dropped silently once closed.
    fn respond(&self, packet: Packet) {
        if self.push(packet, None).is_err() {
            debug!("Connection closed, dropping protocol response");
        }
    }

    /// Returns the next packet to write, waiting until one is queued.
    ///
    /// Returns `None` once the state is closed, which stops the writer.
    /// The packet stays at the front of the queue until
    /// [`ConnectionState::notify_sent`] or [`ConnectionState::discard`].
    pub async fn take_next(&self) -> Option<Packet> {
        loop {
            let notified = self.queue_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let queue = self.queue.lock();
                if self.is_closed() {
                    return None;
                }
                if let Some(packet) = queue.front() {
                    return Some(packet.clone());
                }
            }

            notified.await;
        }
    }

    /// Token the writer must hold while sending `packet`.
    #[must_use]
    pub fn token_for(&self, packet: &Packet) -> Option<Arc<PendingToken>> {
        packet.token_key().and_then(|key| self.own_token(&key))
    }

    /// Records bytes written.
    #[inline]
    pub fn notify_sent_bytes(&self, count: usize) {
        self.sent_bytes.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records that `packet` was written and removes it from the queue.
    ///
    /// Requests that complete on send (QoS 0 PUBLISH, DISCONNECT) resolve
    /// here.
    pub fn notify_sent(&self, packet: &Packet) {
        self.queue.lock().pop_front();
        self.sent_packets.fetch_add(1, Ordering::Relaxed);

        let Some(key) = packet.token_key() else {
            return;
        };
        match packet {
            Packet::Publish(publish) if publish.qos == QoS::AtMostOnce => {
                if self.resolve_sent(key) {
                    self.callbacks.delivery_complete(key);
                }
            }
            Packet::Disconnect => {
                self.resolve_sent(key);
            }
            _ if !packet.is_ack() => {
                if let Some(token) = self.own_token(&key) {
                    token.mark_sent();
                }
            }
            _ => {}
        }
        trace!(%key, "Packet sent");
    }

    /// Resolves one of this connection's tokens that completes on send.
    pub fn resolve_sent(&self, key: TokenKey) -> bool {
        self.tokens.resolve_sent(self.generation, key)
    }

    /// Removes the front packet without sending it.
    pub fn discard(&self, packet: &Packet) {
        self.queue.lock().pop_front();
        debug!(packet_type = ?packet.packet_type(), "Packet discarded, token already cleared");
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Routes an acknowledgement to its token.
    ///
    /// Resolution runs inside the token's critical section, so it cannot
    /// overtake a send of the same token that is still in progress.
    ///
    /// # Errors
    ///
    /// - [`Error::UnexpectedAck`] for an orphaned acknowledgement other
    ///   than PUBACK, PUBREC or PUBCOMP
    /// - [`Error::ConnectRefused`] for a CONNACK with a refusal code
    pub async fn notify_received_ack(&self, ack: Packet) -> Result<()> {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        let Some(key) = ack.token_key() else {
            return Err(Error::protocol(format!("{:?} without key", ack.packet_type())));
        };

        let Some(token) = self.own_token(&key) else {
            if ack.is_tolerated_orphan() {
                debug!(%key, packet_type = ?ack.packet_type(), "Ignoring acknowledgement for unknown token");
                return Ok(());
            }
            return Err(Error::unexpected_ack(ack.packet_type(), key));
        };

        let _guard = token.lock_send().await;
        match ack {
            Packet::PubRec(id) => {
                trace!(%key, "PUBREC received, releasing");
                self.respond(Packet::PubRel(id));
            }
            Packet::PubAck(_) | Packet::PubComp(_) => {
                if self.tokens.resolve(self.generation, ack) {
                    self.callbacks.delivery_complete(key);
                }
            }
            Packet::ConnAck(connack) => {
                let code = connack.return_code;
                if code.is_accepted() {
                    self.connected.store(true, Ordering::Release);
                }
                self.tokens.resolve(self.generation, Packet::ConnAck(connack));
                if !code.is_accepted() {
                    return Err(Error::connect_refused(code));
                }
            }
            other => {
                self.tokens.resolve(self.generation, other);
            }
        }
        Ok(())
    }

    /// Handles a non-acknowledgement packet from the broker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for packets a broker never sends.
    pub fn notify_received_message(&self, packet: Packet) -> Result<()> {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        match packet {
            Packet::Publish(publish) => {
                match (publish.qos, publish.packet_id) {
                    (QoS::AtMostOnce, _) => self.callbacks.message_arrived(&publish),
                    (QoS::AtLeastOnce, Some(id)) => {
                        self.callbacks.message_arrived(&publish);
                        self.respond(Packet::PubAck(id));
                    }
                    (QoS::ExactlyOnce, Some(id)) => {
                        self.inbound.lock().insert(id, publish);
                        self.respond(Packet::PubRec(id));
                    }
                    (qos, None) => {
                        return Err(Error::protocol(format!(
                            "{qos:?} PUBLISH without packet identifier"
                        )));
                    }
                }
                Ok(())
            }
            Packet::PubRel(id) => {
                let held = self.inbound.lock().remove(&id);
                match held {
                    Some(publish) => self.callbacks.message_arrived(&publish),
                    None => debug!(%id, "PUBREL for unknown message, completing anyway"),
                }
                self.respond(Packet::PubComp(id));
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "unexpected {:?} from broker",
                other.packet_type()
            ))),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Closes the state: clears the queue and stops the writer.
    ///
    /// Later enqueues fail with [`Error::NotConnected`].
    pub fn close(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            self.closed.store(true, Ordering::Release);
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.inbound.lock().clear();
        self.queue_ready.notify_waiters();
        if dropped > 0 {
            debug!(dropped, "Outbound queue cleared");
        }
    }

    /// Fails every token this connection registered.
    ///
    /// Tokens of later connections sharing the store are left alone.
    pub fn fail_pending(&self, reason: &str) -> usize {
        self.tokens.fail_generation(self.generation, reason)
    }

    /// Returns `true` once closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` between an accepted CONNACK and close.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.was_connected() && !self.is_closed()
    }

    /// Returns `true` if a CONNACK was ever accepted, even after close.
    #[inline]
    #[must_use]
    pub fn was_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Marks a client-initiated disconnect in progress.
    pub fn begin_disconnect(&self) {
        self.disconnecting.store(true, Ordering::Release);
    }

    /// Returns `true` after [`ConnectionState::begin_disconnect`].
    #[inline]
    #[must_use]
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// Returns `true` while a PINGREQ is unanswered.
    #[inline]
    #[must_use]
    pub fn ping_outstanding(&self) -> bool {
        self.own_token(&TokenKey::Ping).is_some()
    }

    /// Snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> StateStats {
        StateStats {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            queued: self.queue.lock().len(),
            inflight: self.tokens.inflight(self.generation),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    use crate::identifiers::ClientId;
    use crate::protocol::{ConnAck, Connect, ConnectReturnCode, SubAck, SubscribeReturnCode};
    use crate::transport::token::TokenStatus;

    fn id(value: u16) -> PacketId {
        PacketId::new(value).unwrap()
    }

    fn state() -> ConnectionState {
        ConnectionState::new(Arc::new(TokenStore::new()), Arc::new(Callbacks::new()), 10)
    }

    fn publish(qos: QoS, value: u16) -> Packet {
        Packet::Publish(Publish::new("t", "p", qos, false, Some(id(value))))
    }

    /// Drives the writer side by hand: take, pretend to write, notify.
    async fn send_next(state: &ConnectionState) -> Packet {
        let packet = timeout(Duration::from_secs(1), state.take_next())
            .await
            .unwrap()
            .unwrap();
        state.notify_sent_bytes(4);
        state.notify_sent(&packet);
        packet
    }

    #[tokio::test]
    async fn test_enqueue_registers_before_visible() {
        let state = state();
        let token = state.enqueue(publish(QoS::AtLeastOnce, 42)).unwrap().unwrap();
        assert!(state.tokens().contains(&token.key()));

        let sent = send_next(&state).await;
        assert_eq!(sent, publish(QoS::AtLeastOnce, 42));
        assert!(token.is_sent());

        assert_ok!(state.notify_received_ack(Packet::PubAck(id(42))).await);
        assert_eq!(token.status(), TokenStatus::Acked(Some(Packet::PubAck(id(42)))));
        assert!(state.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_take_next_is_fifo_and_peeks() {
        let state = state();
        state.enqueue(Packet::PubAck(id(1))).unwrap();
        state.enqueue(Packet::PubAck(id(2))).unwrap();

        assert_eq!(state.take_next().await, Some(Packet::PubAck(id(1))));
        assert_eq!(state.take_next().await, Some(Packet::PubAck(id(1))));
        state.notify_sent(&Packet::PubAck(id(1)));
        assert_eq!(state.take_next().await, Some(Packet::PubAck(id(2))));
    }

    #[tokio::test]
    async fn test_take_next_waits_for_enqueue() {
        let state = Arc::new(state());
        let writer = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.take_next().await })
        };
        tokio::task::yield_now().await;
        state.enqueue(Packet::PingReq).unwrap();
        let next = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(next, Some(Packet::PingReq));
    }

    #[tokio::test]
    async fn test_close_stops_writer_and_rejects_enqueue() {
        let state = Arc::new(state());
        let writer = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.take_next().await })
        };
        tokio::task::yield_now().await;
        state.close();

        let next = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(next, None);
        assert!(matches!(
            state.enqueue(Packet::PingReq),
            Err(Error::NotConnected)
        ));
        assert!(state.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_qos0_publish_completes_on_send() {
        let state = state();
        let token = state.enqueue(publish(QoS::AtMostOnce, 5)).unwrap().unwrap();
        send_next(&state).await;
        assert_eq!(token.status(), TokenStatus::Acked(None));
        assert!(state.tokens().is_empty());
        assert_eq!(state.stats().sent_packets, 1);
    }

    #[tokio::test]
    async fn test_qos2_outbound_flow() {
        let state = state();
        let token = state.enqueue(publish(QoS::ExactlyOnce, 7)).unwrap().unwrap();
        send_next(&state).await;

        assert_ok!(state.notify_received_ack(Packet::PubRec(id(7))).await);
        assert!(token.status().is_pending());
        assert_eq!(send_next(&state).await, Packet::PubRel(id(7)));

        assert_ok!(state.notify_received_ack(Packet::PubComp(id(7))).await);
        assert_eq!(token.status(), TokenStatus::Acked(Some(Packet::PubComp(id(7)))));
    }

    #[tokio::test]
    async fn test_orphan_acks() {
        let state = state();
        let bystander = state.enqueue(publish(QoS::AtLeastOnce, 1)).unwrap().unwrap();

        assert_ok!(state.notify_received_ack(Packet::PubAck(id(9))).await);
        assert_ok!(state.notify_received_ack(Packet::PubRec(id(9))).await);
        assert_ok!(state.notify_received_ack(Packet::PubComp(id(9))).await);
        assert!(bystander.status().is_pending());

        let suback = Packet::SubAck(SubAck {
            packet_id: id(9),
            return_codes: vec![SubscribeReturnCode::Success(QoS::AtMostOnce)],
        });
        let err = assert_err!(state.notify_received_ack(suback).await);
        assert!(matches!(err, Error::UnexpectedAck { .. }));
        assert_err!(state.notify_received_ack(Packet::PingResp).await);
    }

    #[tokio::test]
    async fn test_connack_refused_is_fatal() {
        let state = state();
        let connect = Connect::new(ClientId::new("c").unwrap(), 0, true);
        let token = state.enqueue(Packet::Connect(connect)).unwrap().unwrap();
        send_next(&state).await;

        let refused = Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        });
        let err = assert_err!(state.notify_received_ack(refused.clone()).await);
        assert!(matches!(err, Error::ConnectRefused { .. }));
        assert_eq!(token.status(), TokenStatus::Acked(Some(refused)));
        assert!(!state.is_connected());
    }

    #[tokio::test]
    async fn test_inbound_qos_flows() {
        let state = state();
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&delivered);
        state
            .callbacks
            .set_message_handler(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let qos1 = Packet::Publish(Publish::new("a", "1", QoS::AtLeastOnce, false, Some(id(3))));
        assert_ok!(state.notify_received_message(qos1));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(send_next(&state).await, Packet::PubAck(id(3)));

        let qos2 = Packet::Publish(Publish::new("a", "2", QoS::ExactlyOnce, false, Some(id(4))));
        assert_ok!(state.notify_received_message(qos2));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(send_next(&state).await, Packet::PubRec(id(4)));

        assert_ok!(state.notify_received_message(Packet::PubRel(id(4))));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(send_next(&state).await, Packet::PubComp(id(4)));
    }

    #[tokio::test]
    async fn test_broker_cannot_send_disconnect() {
        let state = state();
        let err = assert_err!(state.notify_received_message(Packet::Disconnect));
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_inflight_limit() {
        let state = ConnectionState::new(Arc::new(TokenStore::new()), Arc::new(Callbacks::new()), 2);
        state.enqueue(publish(QoS::AtLeastOnce, 1)).unwrap();
        state.enqueue(publish(QoS::AtLeastOnce, 2)).unwrap();
        assert!(matches!(
            state.enqueue(publish(QoS::AtLeastOnce, 3)),
            Err(Error::TooManyInflight { inflight: 2, max: 2 })
        ));
        // QoS 0 is not limited
        assert!(state.enqueue(publish(QoS::AtMostOnce, 4)).is_ok());
    }

    #[test]
    fn test_enqueue_new_respects_limit() {
        let state = ConnectionState::new(Arc::new(TokenStore::new()), Arc::new(Callbacks::new()), 2);
        let build = |id| Packet::Publish(Publish::new("t", "p", QoS::ExactlyOnce, false, Some(id)));
        assert!(state.enqueue_new(build).is_ok());
        assert!(state.enqueue_new(build).is_ok());
        assert!(matches!(state.enqueue_new(build), Err(Error::TooManyInflight { .. })));
        assert_eq!(state.tokens().len(), 2);
    }

    #[test]
    fn test_enqueue_new_allocates_ids() {
        let state = state();
        let first = state
            .enqueue_new(|id| Packet::Publish(Publish::new("t", "p", QoS::AtLeastOnce, false, Some(id))))
            .unwrap();
        let second = state
            .enqueue_new(|id| Packet::Publish(Publish::new("t", "p", QoS::AtLeastOnce, false, Some(id))))
            .unwrap();
        assert_ne!(first.key(), second.key());
        assert_eq!(state.stats().queued, 2);
    }

    #[test]
    fn test_inflight_limit_ignores_other_requests() {
        let state = ConnectionState::new(Arc::new(TokenStore::new()), Arc::new(Callbacks::new()), 1);
        state.enqueue(Packet::PingReq).unwrap();
        state
            .enqueue_new(|packet_id| {
                Packet::Subscribe(crate::protocol::Subscribe {
                    packet_id,
                    filters: vec![("a/#".to_owned(), QoS::AtLeastOnce)],
                })
            })
            .unwrap();
        state.enqueue(publish(QoS::AtMostOnce, 20)).unwrap();

        assert!(state.enqueue(publish(QoS::AtLeastOnce, 21)).is_ok());
        assert_eq!(state.stats().inflight, 1);
        assert!(matches!(
            state.enqueue(publish(QoS::AtLeastOnce, 22)),
            Err(Error::TooManyInflight { inflight: 1, max: 1 })
        ));
    }

    #[tokio::test]
    async fn test_stale_connection_leaves_next_tokens_alone() {
        let tokens = Arc::new(TokenStore::new());
        let callbacks = Arc::new(Callbacks::new());
        let old = ConnectionState::new(Arc::clone(&tokens), Arc::clone(&callbacks), 10);
        let stale = old.enqueue(publish(QoS::AtLeastOnce, 1)).unwrap().unwrap();
        old.close();

        let new = ConnectionState::new(Arc::clone(&tokens), callbacks, 10);
        let connect = Connect::new(ClientId::new("c").unwrap(), 0, true);
        let token = new.enqueue(Packet::Connect(connect)).unwrap().unwrap();

        // Late teardown of the old connection
        assert_eq!(old.fail_pending("connection closed"), 1);
        assert!(matches!(stale.status(), TokenStatus::Failed(_)));
        assert!(token.status().is_pending());

        let accepted = Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        });
        assert_err!(old.notify_received_ack(accepted.clone()).await);
        assert!(token.status().is_pending());

        assert_ok!(new.notify_received_ack(accepted.clone()).await);
        assert_eq!(token.status(), TokenStatus::Acked(Some(accepted)));
    }
}
