//! TCP transport layer.
//!
//! This module moves packets between the client API and one broker socket,
//! correlating every request with its acknowledgement.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌─────────────────┐  take_next  ┌──────────────┐
//! │    Client    │───────────►│ ConnectionState │────────────►│ writer task  │──► socket
//! │              │            │  (queue, QoS)   │             └──────────────┘
//! │  wait token  │            │                 │  notify_*   ┌──────────────┐
//! │      ▲       │            │                 │◄────────────│ polling task │◄── socket
//! └──────┼───────┘            └────────┬────────┘             └──────────────┘
//!        │                             │ resolve / fail
//!        └──────────────────────  TokenStore
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `EventLoop::start` - Resolve the broker address and connect
//! 2. The client queues CONNECT and waits for its token
//! 3. Requests flow through `ConnectionState::enqueue`
//! 4. Any fatal error or `EventLoop::stop` fails all pending tokens and
//!    reports once to the `LifecycleOwner`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `callback` | Application callbacks |
//! | `event_loop` | Socket owner, polling and writer tasks |
//! | `state` | Outbound queue and QoS bookkeeping |
//! | `token` | Pending tokens and the token store |

// ============================================================================
// Submodules
// ============================================================================

/// Application callbacks.
pub mod callback;

/// Readiness-driven event loop.
pub mod event_loop;

/// Per-connection protocol state.
pub mod state;

/// Pending tokens and the token store.
pub mod token;

// ============================================================================
// Re-exports
// ============================================================================

pub use callback::{
    Callbacks, ConnectCompleteHandler, ConnectionLostHandler, DeliveryCompleteHandler,
    MessageHandler,
};
pub use event_loop::{EventLoop, LifecycleOwner, LoopConfig, LoopPhase};
pub use state::{ConnectionState, StateStats};
pub use token::{PendingToken, TokenStatus, TokenStore};
