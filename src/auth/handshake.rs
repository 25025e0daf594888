//! Challenge/response authentication with the relay.
//!
//! ```text
//! relay  -> auth_challenge {challenge_id, challenge, server_address}
//! client -> auth_response  {challenge_id, jwt}
//! relay  -> auth_ok {endpoint, server_address, services} | auth_failed {error}
//! ```
//! The token binds the exact challenge nonce, so it cannot be replayed
//! against a different challenge.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::config::TunnelConfig;
use crate::error::{HandshakeError, SignError};
use crate::tunnel::protocol::{ClientMessage, RelayMessage};

use super::signer::{unix_now, Signer};

/// What the relay granted on `auth_ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    /// Public URL, if the relay supplied one.
    pub endpoint: Option<String>,
    /// Confirmed relay identity.
    pub server_address: String,
    pub services: Vec<String>,
}

/// Build the signed token presented in `auth_response`.
pub fn create_token(
    signer: &dyn Signer,
    audience: &str,
    services: &[String],
    lifetime: Duration,
    challenge: Option<&str>,
) -> Result<String, SignError> {
    let mut claims = Map::new();
    claims.insert(
        "services".into(),
        Value::Array(services.iter().cloned().map(Value::String).collect()),
    );
    if let Some(challenge) = challenge {
        claims.insert("challenge".into(), Value::String(challenge.to_string()));
    }
    signer.sign(&claims, audience, unix_now() + lifetime.as_secs())
}

/// Run the handshake on a freshly opened connection.
///
/// `server_address` is the expected relay identity; when empty, the identity
/// announced in the challenge is used as the token audience.
pub async fn authenticate<S>(
    ws: &mut S,
    signer: &dyn Signer,
    config: &TunnelConfig,
    server_address: &str,
) -> Result<AuthGrant, HandshakeError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let wait = config.handshake_timeout;

    let challenge = tokio::time::timeout(wait, next_relay_message(ws))
        .await
        .map_err(|_| HandshakeError::ChallengeTimeout(wait))??;

    let (challenge_id, nonce, announced) = match challenge {
        RelayMessage::AuthChallenge {
            challenge_id,
            challenge,
            server_address,
        } => (challenge_id, challenge, server_address),
        RelayMessage::AuthFailed { error } => {
            return Err(HandshakeError::Rejected(
                error.unwrap_or_else(|| "Unknown".to_string()),
            ))
        }
        RelayMessage::Error { message } => {
            return Err(HandshakeError::UnexpectedMessage(
                message.unwrap_or_else(|| "Expected auth_challenge".to_string()),
            ))
        }
        other => {
            return Err(HandshakeError::UnexpectedMessage(format!(
                "expected auth_challenge, got {}",
                other.kind()
            )))
        }
    };

    if challenge_id.is_empty() || nonce.is_empty() {
        return Err(HandshakeError::InvalidChallenge);
    }

    let audience = if server_address.is_empty() {
        announced
    } else {
        if !announced.is_empty() && announced != server_address {
            warn!(
                expected = %server_address,
                announced = %announced,
                "relay announced a different identity"
            );
        }
        server_address.to_string()
    };

    debug!(
        challenge_id = %challenge_id.chars().take(8).collect::<String>(),
        "received auth challenge"
    );

    let jwt = create_token(
        signer,
        &audience,
        &config.services,
        config.token_lifetime,
        Some(&nonce),
    )?;
    let response = ClientMessage::AuthResponse { challenge_id, jwt }.encode()?;
    ws.send(Message::Text(response.into())).await?;
    debug!("sent auth response");

    let confirmation = tokio::time::timeout(wait, next_relay_message(ws))
        .await
        .map_err(|_| HandshakeError::ConfirmationTimeout(wait))??;

    match confirmation {
        RelayMessage::AuthOk {
            endpoint,
            server_address,
            services,
        } => Ok(AuthGrant {
            endpoint: endpoint.filter(|e| !e.is_empty()),
            server_address: server_address.filter(|s| !s.is_empty()).unwrap_or(audience),
            services: services.unwrap_or_else(|| config.services.clone()),
        }),
        RelayMessage::AuthFailed { error } => Err(HandshakeError::Rejected(
            error.unwrap_or_else(|| "Unknown".to_string()),
        )),
        RelayMessage::Error { message } => Err(HandshakeError::UnexpectedMessage(
            message.unwrap_or_else(|| "Unknown".to_string()),
        )),
        other => Err(HandshakeError::UnexpectedMessage(format!(
            "expected auth_ok, got {}",
            other.kind()
        ))),
    }
}

/// Next JSON message from the relay, skipping transport control frames.
async fn next_relay_message<S>(ws: &mut S) -> Result<RelayMessage, HandshakeError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(RelayMessage::decode(&text)?),
            Some(Ok(Message::Binary(data))) => return Ok(serde_json::from_slice(&data)?),
            Some(Ok(Message::Close(_))) | None => return Err(HandshakeError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{verify_token, Ed25519Signer};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let relay = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, relay)
    }

    async fn relay_send(ws: &mut WebSocketStream<tokio::io::DuplexStream>, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    async fn relay_recv(ws: &mut WebSocketStream<tokio::io::DuplexStream>) -> Value {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig {
            handshake_timeout: Duration::from_millis(200),
            ..TunnelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_successful_handshake_binds_challenge() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        let config = config();

        let relay_side = async {
            relay_send(
                &mut relay,
                json!({"type": "auth_challenge", "challenge_id": "cid-1", "challenge": "nonce-abc", "server_address": "relay-id"}),
            )
            .await;
            let response = relay_recv(&mut relay).await;
            relay_send(
                &mut relay,
                json!({"type": "auth_ok", "endpoint": "https://me.tunnel.example", "server_address": "relay-id", "services": ["pintheon"]}),
            )
            .await;
            response
        };

        let (grant, response) = tokio::join!(
            authenticate(&mut client, &signer, &config, ""),
            relay_side
        );
        let grant = grant.unwrap();
        assert_eq!(grant.endpoint.as_deref(), Some("https://me.tunnel.example"));
        assert_eq!(grant.server_address, "relay-id");
        assert_eq!(grant.services, vec!["pintheon".to_string()]);

        assert_eq!(response["type"], "auth_response");
        assert_eq!(response["challenge_id"], "cid-1");
        let jwt = response["jwt"].as_str().unwrap();
        assert_eq!(jwt.split('.').count(), 3);
        let claims = verify_token(jwt, &signer.verifying_key()).unwrap();
        assert_eq!(claims["challenge"], "nonce-abc");
        assert_eq!(claims["aud"], "relay-id");
        assert_eq!(claims["services"], json!(["pintheon"]));
    }

    #[tokio::test]
    async fn test_configured_identity_is_audience() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        let config = config();

        let relay_side = async {
            relay_send(
                &mut relay,
                json!({"type": "auth_challenge", "challenge_id": "c", "challenge": "n", "server_address": "other"}),
            )
            .await;
            let response = relay_recv(&mut relay).await;
            relay_send(&mut relay, json!({"type": "auth_ok"})).await;
            response
        };

        let (grant, response) = tokio::join!(
            authenticate(&mut client, &signer, &config, "pinned-relay"),
            relay_side
        );
        let grant = grant.unwrap();
        assert_eq!(grant.server_address, "pinned-relay");
        assert!(grant.endpoint.is_none());
        assert_eq!(grant.services, config.services);
        let claims =
            verify_token(response["jwt"].as_str().unwrap(), &signer.verifying_key()).unwrap();
        assert_eq!(claims["aud"], "pinned-relay");
    }

    #[tokio::test]
    async fn test_null_relay_identity_in_challenge_is_accepted() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        let config = config();

        let relay_side = async {
            relay_send(
                &mut relay,
                json!({"type": "auth_challenge", "challenge_id": "c", "challenge": "n", "server_address": null}),
            )
            .await;
            let response = relay_recv(&mut relay).await;
            relay_send(
                &mut relay,
                json!({"type": "auth_ok", "endpoint": null, "server_address": "relay-id"}),
            )
            .await;
            response
        };

        let (grant, response) = tokio::join!(
            authenticate(&mut client, &signer, &config, ""),
            relay_side
        );
        let grant = grant.unwrap();
        assert_eq!(response["type"], "auth_response");
        assert_eq!(grant.server_address, "relay-id");
        assert!(grant.endpoint.is_none());
    }

    #[tokio::test]
    async fn test_auth_failed_carries_reason() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        let config = config();

        let relay_side = async {
            relay_send(
                &mut relay,
                json!({"type": "auth_challenge", "challenge_id": "c", "challenge": "n", "server_address": "r"}),
            )
            .await;
            let _ = relay_recv(&mut relay).await;
            relay_send(&mut relay, json!({"type": "auth_failed", "error": "bad signature"})).await;
        };

        let (result, ()) = tokio::join!(
            authenticate(&mut client, &signer, &config, ""),
            relay_side
        );
        let err = result.unwrap_err();
        assert!(matches!(err, HandshakeError::Rejected(_)));
        assert!(err.to_string().contains("bad signature"));
    }

    #[tokio::test]
    async fn test_challenge_timeout() {
        let (mut client, _relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        let err = authenticate(&mut client, &signer, &config(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ChallengeTimeout(_)));
    }

    #[tokio::test]
    async fn test_confirmation_timeout() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        let config = config();

        let relay_side = async {
            relay_send(
                &mut relay,
                json!({"type": "auth_challenge", "challenge_id": "c", "challenge": "n", "server_address": "r"}),
            )
            .await;
            let _ = relay_recv(&mut relay).await;
        };

        let (result, ()) = tokio::join!(
            authenticate(&mut client, &signer, &config, ""),
            relay_side
        );
        assert!(matches!(
            result.unwrap_err(),
            HandshakeError::ConfirmationTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_incomplete_challenge_rejected() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        relay_send(&mut relay, json!({"type": "auth_challenge", "challenge_id": "c"})).await;
        let err = authenticate(&mut client, &signer, &config(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidChallenge));
    }

    #[tokio::test]
    async fn test_unexpected_first_message() {
        let (mut client, mut relay) = ws_pair().await;
        let signer = Ed25519Signer::from_seed([9u8; 32]);
        relay_send(&mut relay, json!({"type": "ping"})).await;
        let err = authenticate(&mut client, &signer, &config(), "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected auth_challenge"));
    }

    #[test]
    fn test_token_without_challenge_has_no_challenge_claim() {
        let signer = Ed25519Signer::from_seed([2u8; 32]);
        let token = create_token(
            &signer,
            "relay",
            &["a".to_string()],
            Duration::from_secs(60),
            None,
        )
        .unwrap();
        let claims = verify_token(&token, &signer.verifying_key()).unwrap();
        assert!(!claims.contains_key("challenge"));
        assert!(claims["exp"].as_u64().unwrap() > unix_now());
    }
}
