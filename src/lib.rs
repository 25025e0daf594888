//! Keypair-authenticated tunnel client.
//!
//! Exposes local HTTP services through a relay over a single WebSocket. The
//! client proves its identity by signing the relay's challenge with an
//! Ed25519 key; the relay then delivers public requests as `tunnel_request`
//! messages, which are forwarded to `127.0.0.1:<bound port>`.

pub mod auth;
pub mod config;
pub mod error;
pub mod tunnel;

pub use auth::{Ed25519Signer, Signer};
pub use config::TunnelConfig;
pub use error::{ConfigError, TunnelError};
pub use tunnel::{ConnectionState, TunnelClient, TunnelEndpoint, TunnelHandle};
