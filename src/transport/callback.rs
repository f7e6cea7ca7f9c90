//! Application callbacks.
//!
//! Handlers run inline on the event loop (message arrival, delivery
//! completion) or on whichever task tears the connection down (connection
//! lost). They must not block; hand long work to a channel or a spawned task.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;

use crate::error::Error;
use crate::identifiers::TokenKey;
use crate::protocol::Publish;

// ============================================================================
// Types
// ============================================================================

/// Called once per inbound application message.
pub type MessageHandler = Box<dyn Fn(&Publish) + Send + Sync>;

/// Called when an established connection is lost unexpectedly.
pub type ConnectionLostHandler = Box<dyn Fn(&Error) + Send + Sync>;

/// Called after CONNACK is accepted. Arguments: `reconnect`, `server_uri`.
pub type ConnectCompleteHandler = Box<dyn Fn(bool, &str) + Send + Sync>;

/// Called when an outbound publish completes its QoS flow.
pub type DeliveryCompleteHandler = Box<dyn Fn(TokenKey) + Send + Sync>;

// ============================================================================
// Callbacks
// ============================================================================

/// Registered application callbacks.
#[derive(Default)]
pub struct Callbacks {
    message: RwLock<Option<MessageHandler>>,
    connection_lost: RwLock<Option<ConnectionLostHandler>>,
    connect_complete: RwLock<Option<ConnectCompleteHandler>>,
    delivery_complete: RwLock<Option<DeliveryCompleteHandler>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("message", &self.message.read().is_some())
            .field("connection_lost", &self.connection_lost.read().is_some())
            .field("connect_complete", &self.connect_complete.read().is_some())
            .field("delivery_complete", &self.delivery_complete.read().is_some())
            .finish()
    }
}

impl Callbacks {
    /// Creates an empty callback set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the message handler.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.message.write() = Some(handler);
    }

    /// Sets the connection lost handler.
    pub fn set_connection_lost_handler(&self, handler: ConnectionLostHandler) {
        *self.connection_lost.write() = Some(handler);
    }

    /// Sets the connect complete handler.
    pub fn set_connect_complete_handler(&self, handler: ConnectCompleteHandler) {
        *self.connect_complete.write() = Some(handler);
    }

    /// Sets the delivery complete handler.
    pub fn set_delivery_complete_handler(&self, handler: DeliveryCompleteHandler) {
        *self.delivery_complete.write() = Some(handler);
    }

    /// Removes every handler.
    pub fn clear(&self) {
        *self.message.write() = None;
        *self.connection_lost.write() = None;
        *self.connect_complete.write() = None;
        *self.delivery_complete.write() = None;
    }

    pub(crate) fn message_arrived(&self, publish: &Publish) {
        if let Some(handler) = self.message.read().as_ref() {
            handler(publish);
        }
    }

    pub(crate) fn connection_lost(&self, reason: &Error) {
        if let Some(handler) = self.connection_lost.read().as_ref() {
            handler(reason);
        }
    }

    pub(crate) fn connect_complete(&self, reconnect: bool, server_uri: &str) {
        if let Some(handler) = self.connect_complete.read().as_ref() {
            handler(reconnect, server_uri);
        }
    }

    pub(crate) fn delivery_complete(&self, key: TokenKey) {
        if let Some(handler) = self.delivery_complete.read().as_ref() {
            handler(key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::protocol::QoS;

    #[test]
    fn test_unset_handlers_are_noops() {
        let callbacks = Callbacks::new();
        callbacks.message_arrived(&Publish::new("t", "p", QoS::AtMostOnce, false, None));
        callbacks.connection_lost(&Error::ConnectionClosed);
        callbacks.connect_complete(false, "tcp://localhost:1883");
        callbacks.delivery_complete(TokenKey::Connect);
    }

    #[test]
    fn test_message_handler_invoked() {
        let callbacks = Callbacks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        callbacks.set_message_handler(Box::new(move |publish| {
            assert_eq!(publish.topic(), "a/b");
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        callbacks.message_arrived(&Publish::new("a/b", "x", QoS::AtLeastOnce, false, None));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        callbacks.clear();
        callbacks.message_arrived(&Publish::new("a/b", "x", QoS::AtLeastOnce, false, None));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
