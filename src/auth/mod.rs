pub mod handshake;
pub mod signer;

pub use signer::{verify_token, Ed25519Signer, Signer};
