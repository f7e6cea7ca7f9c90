//! Pending tokens and the token store.
//!
//! A [`PendingToken`] represents one outstanding request. Its status is a
//! single-assignment cell: the first of acknowledgement, send completion or
//! failure wins, every later attempt is a no-op, and every waiter observes
//! the same outcome.
//!
//! The [`TokenStore`] maps correlation keys to tokens. The map lock only
//! covers lookups and insertions. Resolving a token happens on the token
//! itself, so unrelated tokens never contend.
//!
//! One store outlives many connections. Every token carries the generation
//! of the connection that registered it, and a connection's teardown only
//! fails its own generation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{PacketId, TokenKey};
use crate::protocol::{Packet, QoS};

// ============================================================================
// TokenStatus
// ============================================================================

/// Completion status of a [`PendingToken`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// Waiting for acknowledgement.
    Pending,
    /// Completed. Holds the acknowledgement, or `None` for requests that
    /// complete on send (QoS 0 PUBLISH, DISCONNECT).
    Acked(Option<Packet>),
    /// Failed with a reason.
    Failed(String),
}

impl TokenStatus {
    /// Returns `true` while unresolved.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

// ============================================================================
// PendingToken
// ============================================================================

/// One outstanding request awaiting acknowledgement.
#[derive(Debug)]
pub struct PendingToken {
    key: TokenKey,
    generation: u64,
    /// QoS 1 or 2 PUBLISH, counted against the in-flight limit.
    inflight: bool,
    status: watch::Sender<TokenStatus>,
    /// Per-token critical section shared by the write path and the
    /// acknowledgement path.
    send_lock: AsyncMutex<()>,
    sent: AtomicBool,
}

impl PendingToken {
    fn new(key: TokenKey, generation: u64, inflight: bool) -> Self {
        let (status, _) = watch::channel(TokenStatus::Pending);
        Self {
            key,
            generation,
            inflight,
            status,
            send_lock: AsyncMutex::new(()),
            sent: AtomicBool::new(false),
        }
    }

    /// Correlation key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> TokenKey {
        self.key
    }

    /// Generation of the connection that registered this token.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TokenStatus {
        self.status.borrow().clone()
    }

    /// Returns `true` once acked or failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.status.borrow().is_pending()
    }

    /// Returns `true` once the request has been fully written.
    #[inline]
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Waits until the token resolves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestFailed`] if the token was failed.
    pub async fn wait(&self) -> Result<Option<Packet>> {
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|status| !status.is_pending())
            .await
            .map_err(|_| Error::ConnectionClosed)?
            .clone();
        match status {
            TokenStatus::Acked(response) => Ok(response),
            TokenStatus::Failed(reason) => Err(Error::request_failed(self.key, reason)),
            TokenStatus::Pending => Err(Error::ConnectionClosed),
        }
    }

    /// Waits until the token resolves or `limit` elapses.
    ///
    /// The token stays registered after a timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if `limit` elapsed first
    /// - [`Error::RequestFailed`] if the token was failed
    pub async fn wait_timeout(&self, limit: Duration) -> Result<Option<Packet>> {
        timeout(limit, self.wait())
            .await
            .map_err(|_| Error::request_timeout(self.key, limit.as_millis() as u64))?
    }

    /// Enters this token's critical section.
    pub(crate) async fn lock_send(&self) -> AsyncMutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    pub(crate) fn mark_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    /// Resolves as acked. Returns `false` if already resolved.
    fn complete(&self, response: Option<Packet>) -> bool {
        self.status.send_if_modified(move |status| {
            if !status.is_pending() {
                return false;
            }
            *status = TokenStatus::Acked(response);
            true
        })
    }

    /// Resolves as failed. Returns `false` if already resolved.
    fn fail(&self, reason: &str) -> bool {
        self.status.send_if_modified(|status| {
            if !status.is_pending() {
                return false;
            }
            *status = TokenStatus::Failed(reason.to_owned());
            true
        })
    }
}

// ============================================================================
// TokenStore
// ============================================================================

/// Map state behind the store lock.
#[derive(Debug)]
struct StoreInner {
    tokens: FxHashMap<TokenKey, Arc<PendingToken>>,
    next_id: PacketId,
}

impl StoreInner {
    /// Next identifier not currently keyed, starting after the last one.
    fn next_free_id(&mut self) -> Result<PacketId> {
        let start = self.next_id;
        let mut candidate = start;
        loop {
            candidate = candidate.next();
            if !self.tokens.contains_key(&TokenKey::Packet(candidate)) {
                self.next_id = candidate;
                return Ok(candidate);
            }
            if candidate == start {
                return Err(Error::PacketIdsExhausted);
            }
        }
    }
}

/// Concurrent map from correlation key to pending token.
#[derive(Debug)]
pub struct TokenStore {
    inner: Mutex<StoreInner>,
    generation: AtomicU64,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                tokens: FxHashMap::default(),
                next_id: PacketId::MAX,
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Hands out a fresh generation for a new connection.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a token for a packet that needs one.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the packet has no correlation key
    /// - [`Error::TokenInUse`] if the key is already outstanding
    pub fn register_pending(&self, generation: u64, packet: &Packet) -> Result<Arc<PendingToken>> {
        let key = packet.token_key().ok_or_else(|| {
            Error::invalid_argument(format!(
                "{:?} has no correlation key",
                packet.packet_type()
            ))
        })?;

        let mut inner = self.inner.lock();
        if inner.tokens.contains_key(&key) {
            return Err(Error::TokenInUse { key });
        }
        let token = Arc::new(PendingToken::new(key, generation, counts_inflight(packet)));
        inner.tokens.insert(key, Arc::clone(&token));
        trace!(%key, generation, "Token registered");
        Ok(token)
    }

    /// Allocates a free packet identifier, builds the packet with it and
    /// registers its token in one step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PacketIdsExhausted`] if every identifier is in use.
    pub fn register_new<F>(&self, generation: u64, build: F) -> Result<(Packet, Arc<PendingToken>)>
    where
        F: FnOnce(PacketId) -> Packet,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_free_id()?;
        let packet = build(id);
        let key = TokenKey::Packet(id);
        let token = Arc::new(PendingToken::new(key, generation, counts_inflight(&packet)));
        inner.tokens.insert(key, Arc::clone(&token));
        trace!(%key, generation, "Token registered");
        Ok((packet, token))
    }

    /// Looks up a token.
    #[must_use]
    pub fn get(&self, key: &TokenKey) -> Option<Arc<PendingToken>> {
        self.inner.lock().tokens.get(key).cloned()
    }

    /// Looks up a token registered by `generation`.
    #[must_use]
    pub fn get_in(&self, generation: u64, key: &TokenKey) -> Option<Arc<PendingToken>> {
        self.get(key).filter(|token| token.generation == generation)
    }

    /// Returns `true` if `key` is outstanding.
    #[must_use]
    pub fn contains(&self, key: &TokenKey) -> bool {
        self.inner.lock().tokens.contains_key(key)
    }

    /// Number of outstanding tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tokens.len()
    }

    /// Number of outstanding QoS 1 and 2 publishes of one generation.
    #[must_use]
    pub fn inflight(&self, generation: u64) -> usize {
        self.inner
            .lock()
            .tokens
            .values()
            .filter(|token| token.inflight && token.generation == generation)
            .count()
    }

    /// Returns `true` if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().tokens.is_empty()
    }

    /// Resolves the token of `generation` matching an acknowledgement.
    ///
    /// Returns `false` without error when no token matches: late and
    /// duplicate acknowledgements are expected after redelivery.
    pub fn resolve(&self, generation: u64, ack: Packet) -> bool {
        let Some(key) = ack.token_key() else {
            return false;
        };
        self.complete(generation, key, Some(ack))
    }

    /// Resolves a token that completes on send.
    pub fn resolve_sent(&self, generation: u64, key: TokenKey) -> bool {
        self.complete(generation, key, None)
    }

    fn complete(&self, generation: u64, key: TokenKey, response: Option<Packet>) -> bool {
        let token = {
            let mut inner = self.inner.lock();
            let owned = inner
                .tokens
                .get(&key)
                .is_some_and(|token| token.generation == generation);
            if owned { inner.tokens.remove(&key) } else { None }
        };
        let Some(token) = token else {
            trace!(%key, generation, "No token to resolve");
            return false;
        };
        let resolved = token.complete(response);
        trace!(%key, resolved, "Token resolved");
        resolved
    }

    /// Fails and removes a single token.
    pub fn fail(&self, key: TokenKey, reason: &str) -> bool {
        let Some(token) = self.inner.lock().tokens.remove(&key) else {
            return false;
        };
        token.fail(reason)
    }

    /// Fails every outstanding token and empties the store.
    ///
    /// Returns the number of tokens this call resolved.
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let drained: Vec<Arc<PendingToken>> = {
            let mut inner = self.inner.lock();
            inner.tokens.drain().map(|(_, token)| token).collect()
        };

        let failed = drained.iter().filter(|token| token.fail(reason)).count();
        if failed > 0 {
            debug!(count = failed, reason, "Failed pending tokens");
        }
        failed
    }

    /// Fails and removes the tokens of one generation, leaving the rest.
    ///
    /// Returns the number of tokens this call resolved.
    pub fn fail_generation(&self, generation: u64, reason: &str) -> usize {
        let drained: Vec<Arc<PendingToken>> = {
            let mut inner = self.inner.lock();
            let keys: Vec<TokenKey> = inner
                .tokens
                .iter()
                .filter(|(_, token)| token.generation == generation)
                .map(|(key, _)| *key)
                .collect();
            keys.iter()
                .filter_map(|key| inner.tokens.remove(key))
                .collect()
        };

        let failed = drained.iter().filter(|token| token.fail(reason)).count();
        if failed > 0 {
            debug!(count = failed, generation, reason, "Failed pending tokens");
        }
        failed
    }
}

fn counts_inflight(packet: &Packet) -> bool {
    matches!(packet, Packet::Publish(publish) if publish.qos != QoS::AtMostOnce)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::{Publish, SubAck, SubscribeReturnCode};

    fn id(value: u16) -> PacketId {
        PacketId::new(value).unwrap()
    }

    fn publish(value: u16) -> Packet {
        Packet::Publish(Publish::new("t", "p", QoS::AtLeastOnce, false, Some(id(value))))
    }

    #[test]
    fn test_register_and_resolve() {
        let store = TokenStore::new();
        let token = store.register_pending(1, &publish(42)).unwrap();
        assert_eq!(token.key(), TokenKey::Packet(id(42)));
        assert!(store.contains(&token.key()));

        assert!(store.resolve(1, Packet::PubAck(id(42))));
        assert_eq!(token.status(), TokenStatus::Acked(Some(Packet::PubAck(id(42)))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let store = TokenStore::new();
        store.register_pending(1, &publish(1)).unwrap();
        let err = store.register_pending(1, &publish(1)).unwrap_err();
        assert!(matches!(err, Error::TokenInUse { .. }));
    }

    #[test]
    fn test_orphan_ack_is_noop() {
        let store = TokenStore::new();
        let other = store.register_pending(1, &publish(1)).unwrap();

        assert!(!store.resolve(1, Packet::PubAck(id(99))));
        assert!(!store.resolve(1, Packet::PubAck(id(99))));
        assert!(other.status().is_pending());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_out_of_order_acks() {
        let store = TokenStore::new();
        let first = store.register_pending(1, &publish(1)).unwrap();
        let second = store.register_pending(1, &publish(2)).unwrap();

        assert!(store.resolve(1, Packet::PubAck(id(2))));
        assert!(first.status().is_pending());
        assert!(second.is_complete());

        assert!(store.resolve(1, Packet::PubAck(id(1))));
        assert!(first.is_complete());
        assert!(store.is_empty());
    }

    #[test]
    fn test_fail_all_pending() {
        let store = TokenStore::new();
        let tokens: Vec<_> = (1..=5)
            .map(|n| store.register_pending(1, &publish(n)).unwrap())
            .collect();

        assert_eq!(store.fail_all_pending("connection lost"), 5);
        assert!(store.is_empty());
        for token in &tokens {
            assert_eq!(token.status(), TokenStatus::Failed("connection lost".into()));
        }
        assert_eq!(store.fail_all_pending("again"), 0);
    }

    #[test]
    fn test_resolution_is_single_assignment() {
        let token = PendingToken::new(TokenKey::Ping, 1, false);
        assert!(token.complete(Some(Packet::PingResp)));
        assert!(!token.fail("late"));
        assert!(!token.complete(None));
        assert_eq!(token.status(), TokenStatus::Acked(Some(Packet::PingResp)));
    }

    #[test]
    fn test_register_new_skips_ids_in_use() {
        let store = TokenStore::new();
        store.register_pending(1, &publish(1)).unwrap();
        let (packet, token) = store
            .register_new(1, |id| Packet::PubRel(id))
            .unwrap();
        assert_eq!(packet, Packet::PubRel(id(2)));
        assert_eq!(token.key(), TokenKey::Packet(id(2)));
    }

    #[test]
    fn test_register_new_wraps() {
        let store = TokenStore::new();
        store.inner.lock().next_id = id(65534);
        let (first, _) = store.register_new(1, Packet::PubAck).unwrap();
        let (second, _) = store.register_new(1, Packet::PubAck).unwrap();
        assert_eq!(first, Packet::PubAck(id(65535)));
        assert_eq!(second, Packet::PubAck(id(1)));
    }

    #[test]
    fn test_unmatched_suback_is_reported_not_resolved() {
        let store = TokenStore::new();
        let suback = Packet::SubAck(SubAck {
            packet_id: id(3),
            return_codes: vec![SubscribeReturnCode::Success(QoS::AtMostOnce)],
        });
        assert!(!store.resolve(1, suback));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_resolve() {
        let store = Arc::new(TokenStore::new());
        let token = store.register_pending(1, &publish(42)).unwrap();

        let resolver = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            resolver.resolve(1, Packet::PubAck(id(42)));
        });

        let response = token.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response, Some(Packet::PubAck(id(42))));
    }

    #[tokio::test]
    async fn test_wait_reports_failure() {
        let store = TokenStore::new();
        let token = store.register_pending(1, &Packet::PingReq).unwrap();
        store.fail_all_pending("stopped");
        let err = token.wait().await.unwrap_err();
        assert!(matches!(err, Error::RequestFailed { key: TokenKey::Ping, .. }));
    }

    #[tokio::test]
    async fn test_wait_timeout_keeps_token() {
        let store = TokenStore::new();
        let token = store.register_pending(1, &Packet::PingReq).unwrap();
        let err = token.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(store.contains(&TokenKey::Ping));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fail_all_races_resolve_exactly_once() {
        for _ in 0..50 {
            let store = Arc::new(TokenStore::new());
            let tokens: Vec<_> = (1..=64)
                .map(|n| store.register_pending(1, &publish(n)).unwrap())
                .collect();

            let acker = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    (1..=64)
                        .filter(|n| store.resolve(1, Packet::PubAck(id(*n))))
                        .count()
                })
            };
            let failer = {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.fail_all_pending("shutdown") })
            };

            let acked = acker.await.unwrap();
            let failed = failer.await.unwrap();
            assert_eq!(acked + failed, tokens.len());
            assert!(tokens.iter().all(|t| t.is_complete()));
            assert!(store.is_empty());
        }
    }

    #[test]
    fn test_fail_generation_spares_newer_tokens() {
        let store = TokenStore::new();
        let old = store.next_generation();
        let new = store.next_generation();
        let stale = store.register_pending(old, &publish(1)).unwrap();
        let ping = store.register_pending(new, &Packet::PingReq).unwrap();

        assert_eq!(store.fail_generation(old, "connection closed"), 1);
        assert_eq!(stale.status(), TokenStatus::Failed("connection closed".into()));
        assert!(ping.status().is_pending());
        assert!(store.contains(&TokenKey::Ping));
        assert_eq!(store.fail_generation(old, "again"), 0);
    }

    #[test]
    fn test_inflight_counts_only_acknowledged_publishes() {
        let store = TokenStore::new();
        store.register_pending(1, &Packet::PingReq).unwrap();
        store
            .register_pending(1, &Packet::Publish(Publish::new("t", "p", QoS::AtMostOnce, false, Some(id(7)))))
            .unwrap();
        assert_eq!(store.inflight(1), 0);

        store.register_pending(1, &publish(8)).unwrap();
        store.register_pending(2, &publish(9)).unwrap();
        assert_eq!(store.inflight(1), 1);
        assert_eq!(store.inflight(2), 1);

        store.resolve(1, Packet::PubAck(id(8)));
        assert_eq!(store.inflight(1), 0);
    }
}
