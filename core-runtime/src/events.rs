//! # Events
//!
//! Process-wide notifications for the SDK using `tokio::sync::broadcast`.
//! Credential and transfer code emit typed events here instead of touching
//! global state; the host application subscribes and reacts (show a login
//! screen on `LoggedOut`, a toast on a failed transfer).
//!
//! ## Architecture
//!
//! ```text
//! AuthManager ────────┐
//! TokenAuthenticator ─┼── emit ──> EventBus ── subscribe ──> host
//! TransferContext ────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! let bus = EventBus::new(16);
//! let mut subscriber = bus.subscribe();
//!
//! bus.emit(CoreEvent::Auth(AuthEvent::LoginSucceeded)).ok();
//! assert_eq!(
//!     subscriber.try_recv().unwrap(),
//!     CoreEvent::Auth(AuthEvent::LoginSucceeded)
//! );
//! ```
//!
//! ## Event Types
//!
//! ### Auth
//! - `LoginSucceeded`: a valid token is available (restored or freshly exchanged)
//! - `LoginFailed`: code exchange failed or no code was returned
//! - `LoginCancelled`: the authorization page reported an error
//! - `LoggedOut`: the token is invalid and cannot be refreshed
//! - `TokenRefreshed`: the authenticator refreshed the access token
//! - `StatusReset`: no usable token; the host should offer login
//!
//! ### Transfer
//! - `Started`, `Completed`, `Failed`, `Aborted` per download/upload task
//!
//! ## Error Handling
//!
//! `emit` fails only when nobody is subscribed, which is normal for a
//! library; callers discard that error. Subscribers should treat
//! `RecvError::Lagged(n)` as non-fatal and `RecvError::Closed` as shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 128;

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Authentication-related events
    Auth(AuthEvent),
    /// Download/upload lifecycle events
    Transfer(TransferEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.description(),
            CoreEvent::Transfer(e) => e.description(),
        }
    }
}

/// Events emitted by the credential lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// A valid access token is available.
    LoginSucceeded,
    /// The authorization code could not be exchanged.
    LoginFailed {
        /// Human-readable error message.
        message: String,
    },
    /// The user or the authorization page aborted the login.
    LoginCancelled { message: String },
    /// The token is invalid and no refresh is possible.
    LoggedOut,
    /// The access token was refreshed.
    TokenRefreshed {
        /// When the new token expires (Unix epoch milliseconds).
        expires_at: i64,
    },
    /// Credentials were cleared or never existed.
    StatusReset,
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::LoginSucceeded => "Login succeeded",
            AuthEvent::LoginFailed { .. } => "Login failed",
            AuthEvent::LoginCancelled { .. } => "Login cancelled",
            AuthEvent::LoggedOut => "Logged out",
            AuthEvent::TokenRefreshed { .. } => "Token refreshed successfully",
            AuthEvent::StatusReset => "Authorization status reset",
        }
    }
}

/// Direction of a transfer task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Download,
    Upload,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Download => f.write_str("download"),
            TransferKind::Upload => f.write_str("upload"),
        }
    }
}

/// Lifecycle events for download and upload tasks.
///
/// Progress is deliberately absent: it goes to the task's own observers,
/// which receive every `Running` update on the callback context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransferEvent {
    Started {
        task_id: u64,
        kind: TransferKind,
        name: String,
    },
    Completed {
        task_id: u64,
        kind: TransferKind,
        /// Final local path (download target or uploaded source).
        result_path: String,
    },
    Failed {
        task_id: u64,
        kind: TransferKind,
        message: String,
    },
    Aborted { task_id: u64, kind: TransferKind },
}

impl TransferEvent {
    fn description(&self) -> &str {
        match self {
            TransferEvent::Started { .. } => "Transfer started",
            TransferEvent::Completed { .. } => "Transfer completed",
            TransferEvent::Failed { .. } => "Transfer failed",
            TransferEvent::Aborted { .. } => "Transfer aborted",
        }
    }
}

/// Broadcast channel shared by the SDK and the host.
///
/// Clones publish into the same channel. Each `subscribe()` gets its own
/// receiver starting at the next event; a receiver more than `capacity`
/// events behind sees `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Errors only when there is no receiver.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        debug!(event = event.description(), "Event emitted");
        self.tx.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn receivers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus({} receivers)", self.receivers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(task_id: u64) -> CoreEvent {
        CoreEvent::Transfer(TransferEvent::Completed {
            task_id,
            kind: TransferKind::Download,
            result_path: "/tmp/a.bin".to_string(),
        })
    }

    #[tokio::test]
    async fn test_emit_without_receivers_errors() {
        let bus = EventBus::new(4);
        assert!(bus.emit(CoreEvent::Auth(AuthEvent::StatusReset)).is_err());
    }

    #[tokio::test]
    async fn test_every_receiver_gets_the_event() {
        let bus = EventBus::new(4);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();
        assert_eq!(bus.receivers(), 2);

        let sent = bus.emit(CoreEvent::Auth(AuthEvent::LoggedOut)).unwrap();
        assert_eq!(sent, 2);

        assert_eq!(sub1.recv().await.unwrap(), CoreEvent::Auth(AuthEvent::LoggedOut));
        assert_eq!(sub2.recv().await.unwrap(), CoreEvent::Auth(AuthEvent::LoggedOut));
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for id in 0..5 {
            bus.emit(completed(id)).unwrap();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
        assert!(sub.recv().await.is_ok());
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Auth(AuthEvent::TokenRefreshed {
            expires_at: 1_700_000_000_000,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Auth");
        assert_eq!(json["payload"]["event"], "TokenRefreshed");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(completed(1).description(), "Transfer completed");
        assert_eq!(
            CoreEvent::Auth(AuthEvent::LoggedOut).description(),
            "Logged out"
        );
    }
}
