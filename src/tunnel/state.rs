//! Connection lifecycle state and host callbacks.
//!
//! Transition table (initial state `Disconnected`):
//! ```text
//! Disconnected   -> Connecting
//! Connecting     -> Authenticating | Error
//! Authenticating -> Connected | Error
//! Connected      -> Error
//! Error          -> Reconnecting
//! Reconnecting   -> Connecting
//! any            -> Disconnected
//! ```

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state of a tunnel client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Whether `self -> next` is an edge of the transition table.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Error)
                | (Authenticating, Connected)
                | (Authenticating, Error)
                | (Connected, Error)
                | (Error, Reconnecting)
                | (Reconnecting, Connecting)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public endpoint granted by the relay for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub url: String,
    /// This client's identity.
    pub client_address: String,
    /// Relay identity.
    pub server_address: String,
    pub services: Vec<String>,
}

pub type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;
pub type EndpointCallback = Box<dyn Fn(&TunnelEndpoint) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type NotifyCallback = Box<dyn Fn() + Send + Sync>;

/// Host callbacks. Invoked on the client's own task.
#[derive(Default)]
pub struct Callbacks {
    pub state_changed: Option<StateCallback>,
    pub connected: Option<EndpointCallback>,
    pub disconnected: Option<NotifyCallback>,
    pub error: Option<MessageCallback>,
    pub endpoint_ready: Option<MessageCallback>,
}

/// Owns the current state; the only place callbacks fire from.
pub struct StateMachine {
    state: ConnectionState,
    tx: watch::Sender<ConnectionState>,
    endpoint: Arc<ArcSwapOption<TunnelEndpoint>>,
    pub(crate) callbacks: Callbacks,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            tx,
            endpoint: Arc::new(ArcSwapOption::empty()),
            callbacks: Callbacks::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Shared endpoint slot, cleared whenever the client leaves `Connected`.
    pub fn endpoint_slot(&self) -> Arc<ArcSwapOption<TunnelEndpoint>> {
        Arc::clone(&self.endpoint)
    }

    /// Move to `next`. Edges outside the table are refused and logged.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        let prev = self.state;
        if prev == next {
            return false;
        }
        if !prev.can_transition_to(next) {
            warn!(from = %prev, to = %next, "refusing invalid state transition");
            return false;
        }

        self.state = next;
        info!(from = %prev, to = %next, "tunnel state changed");
        self.tx.send_replace(next);

        if let Some(cb) = &self.callbacks.state_changed {
            cb(next);
        }
        if prev == ConnectionState::Connected {
            self.endpoint.store(None);
            if let Some(cb) = &self.callbacks.disconnected {
                cb();
            }
        }
        true
    }

    /// Enter `Connected` with a fresh endpoint snapshot.
    pub fn connected(&mut self, endpoint: TunnelEndpoint) {
        let endpoint = Arc::new(endpoint);
        self.endpoint.store(Some(Arc::clone(&endpoint)));
        if !self.transition(ConnectionState::Connected) {
            self.endpoint.store(None);
            return;
        }
        if let Some(cb) = &self.callbacks.connected {
            cb(&endpoint);
        }
        if let Some(cb) = &self.callbacks.endpoint_ready {
            cb(&endpoint.url);
        }
    }

    /// Enter `Error` and surface `message`.
    pub fn fail(&mut self, message: &str) {
        self.transition(ConnectionState::Error);
        self.report_error(message);
    }

    /// Surface `message` without changing state.
    pub fn report_error(&self, message: &str) {
        if let Some(cb) = &self.callbacks.error {
            cb(message);
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
