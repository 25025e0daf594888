//! Keypair identity and compact signed tokens (EdDSA JWTs).

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};

use crate::error::SignError;

/// Identity and signing capability used to authenticate with the relay.
pub trait Signer: Send + Sync {
    /// Public identity string. The relay derives the public URL from it.
    fn identity(&self) -> String;

    /// Produce a compact signed token carrying `claims` plus the registered
    /// `iss`/`sub`/`aud`/`iat`/`exp` claims.
    fn sign(
        &self,
        claims: &Map<String, Value>,
        audience: &str,
        expires_at: u64,
    ) -> Result<String, SignError>;
}

/// Ed25519 keypair. Identity is the lowercase hex of the verifying key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Fresh random keypair.
    pub fn generate() -> Self {
        Self::from_seed(rand::random())
    }

    pub fn from_seed_hex(seed: &str) -> Result<Self, SignError> {
        let bytes = hex::decode(seed.trim()).map_err(|e| SignError::Key(format!("invalid hex seed: {e}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignError::Key(format!("seed must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Load a hex-encoded seed from `path`.
    pub fn load(path: &Path) -> Result<Self, SignError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SignError::Key(format!("{}: {e}", path.display())))?;
        Self::from_seed_hex(&content)
    }

    /// Write the hex-encoded seed to `path`.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, format!("{}\n", self.seed_hex()))
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    fn encoding_key(&self) -> Result<EncodingKey, SignError> {
        let der = self
            .key
            .to_pkcs8_der()
            .map_err(|e| SignError::Key(format!("pkcs8 encoding failed: {e}")))?;
        Ok(EncodingKey::from_ed_der(der.as_bytes()))
    }
}

impl Signer for Ed25519Signer {
    fn identity(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    fn sign(
        &self,
        claims: &Map<String, Value>,
        audience: &str,
        expires_at: u64,
    ) -> Result<String, SignError> {
        let identity = self.identity();
        let mut payload = claims.clone();
        // registered claims win over caller-supplied ones
        payload.insert("iss".into(), Value::String(identity.clone()));
        payload.insert("sub".into(), Value::String(identity));
        payload.insert("aud".into(), Value::String(audience.to_string()));
        payload.insert("iat".into(), Value::from(unix_now()));
        payload.insert("exp".into(), Value::from(expires_at));

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::EdDSA),
            &payload,
            &self.encoding_key()?,
        )?;
        Ok(token)
    }
}

/// Verify a token against `key` and return its claims.
///
/// Checks the signature and expiry; the audience is left to the caller.
pub fn verify_token(token: &str, key: &VerifyingKey) -> Result<Map<String, Value>, SignError> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_aud = false;
    let data = jsonwebtoken::decode::<Map<String, Value>>(
        token,
        &DecodingKey::from_ed_der(key.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_verifies_with_identity_key() {
        let signer = Ed25519Signer::from_seed([7u8; 32]);
        let mut claims = Map::new();
        claims.insert("challenge".into(), Value::String("nonce-123".into()));

        let token = signer.sign(&claims, "relay-id", unix_now() + 60).unwrap();
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::EdDSA);
        assert_eq!(header.typ.as_deref(), Some("JWT"));

        let decoded = verify_token(&token, &signer.verifying_key()).unwrap();
        assert_eq!(decoded["challenge"], "nonce-123");
        assert_eq!(decoded["aud"], "relay-id");
        assert_eq!(decoded["iss"], signer.identity().as_str());
        assert_eq!(decoded["sub"], signer.identity().as_str());
    }

    #[test]
    fn test_token_rejected_under_other_key() {
        let signer = Ed25519Signer::from_seed([7u8; 32]);
        let other = Ed25519Signer::from_seed([8u8; 32]);
        let token = signer.sign(&Map::new(), "relay-id", unix_now() + 60).unwrap();
        assert!(verify_token(&token, &other.verifying_key()).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = Ed25519Signer::from_seed([7u8; 32]);
        let token = signer.sign(&Map::new(), "relay-id", 1).unwrap();
        assert!(verify_token(&token, &signer.verifying_key()).is_err());
    }

    #[test]
    fn test_registered_claims_cannot_be_overridden() {
        let signer = Ed25519Signer::from_seed([1u8; 32]);
        let mut claims = Map::new();
        claims.insert("aud".into(), Value::String("someone-else".into()));
        let token = signer.sign(&claims, "relay-id", unix_now() + 60).unwrap();
        let decoded = verify_token(&token, &signer.verifying_key()).unwrap();
        assert_eq!(decoded["aud"], "relay-id");
    }

    #[test]
    fn test_seed_hex_roundtrip() {
        let signer = Ed25519Signer::generate();
        let restored = Ed25519Signer::from_seed_hex(&signer.seed_hex()).unwrap();
        assert_eq!(signer.identity(), restored.identity());
        assert_eq!(signer.identity().len(), 64);
    }

    #[test]
    fn test_bad_seed_rejected() {
        assert!(Ed25519Signer::from_seed_hex("zz").is_err());
        assert!(Ed25519Signer::from_seed_hex("abcd").is_err());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.key");
        let signer = Ed25519Signer::from_seed([3u8; 32]);
        signer.save(&path).unwrap();
        let loaded = Ed25519Signer::load(&path).unwrap();
        assert_eq!(loaded.identity(), signer.identity());
        assert!(Ed25519Signer::load(&dir.path().join("missing.key")).is_err());
    }
}
