//! JSON control messages exchanged with the relay over the WebSocket.
//!
//! Every message is a JSON object whose `type` field selects the variant:
//! ```text
//! {"type":"tunnel_request","stream_id":7,"request":{"method":"GET","path":"/",...}}
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Messages sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    AuthChallenge {
        #[serde(default, deserialize_with = "null_as_default")]
        challenge_id: String,
        #[serde(default, deserialize_with = "null_as_default")]
        challenge: String,
        #[serde(default, deserialize_with = "null_as_default")]
        server_address: String,
    },
    AuthOk {
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        server_address: Option<String>,
        #[serde(default)]
        services: Option<Vec<String>>,
    },
    AuthFailed {
        #[serde(default)]
        error: Option<String>,
    },
    Ping,
    Pong,
    BindOk {
        #[serde(default)]
        service: Option<String>,
    },
    TunnelRequest {
        stream_id: u64,
        #[serde(default, deserialize_with = "null_as_default")]
        request: ForwardedRequest,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Any `type` this client does not know about.
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Wire name of the message type, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthChallenge { .. } => "auth_challenge",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::BindOk { .. } => "bind_ok",
            Self::TunnelRequest { .. } => "tunnel_request",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AuthResponse {
        challenge_id: String,
        jwt: String,
    },
    Pong,
    Bind {
        service: String,
        local_port: u16,
    },
    TunnelResponse {
        stream_id: u64,
        response: ForwardedResponse,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn bind(service: impl Into<String>, local_port: u16) -> Self {
        Self::Bind {
            service: service.into(),
            local_port,
        }
    }
}

/// HTTP request descriptor carried by `tunnel_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardedRequest {
    /// Empty means `GET`.
    #[serde(deserialize_with = "null_as_default")]
    pub method: String,
    #[serde(deserialize_with = "null_as_default")]
    pub path: String,
    #[serde(deserialize_with = "null_as_default")]
    pub query_string: String,
    #[serde(deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub body: String,
}

impl Default for ForwardedRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            query_string: String::new(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }
}

/// HTTP response descriptor carried by `tunnel_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ForwardedResponse {
    /// Plain-text response with the given status.
    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            body: body.into(),
        }
    }
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_challenge() {
        let msg = RelayMessage::decode(
            r#"{"type":"auth_challenge","challenge_id":"c1","challenge":"nonce","server_address":"relay"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayMessage::AuthChallenge {
                challenge_id: "c1".into(),
                challenge: "nonce".into(),
                server_address: "relay".into(),
            }
        );
    }

    #[test]
    fn test_decode_tunnel_request_defaults() {
        let msg = RelayMessage::decode(r#"{"type":"tunnel_request","stream_id":42,"request":{"path":"/x"}}"#)
            .unwrap();
        let (stream_id, request) = match msg {
            RelayMessage::TunnelRequest { stream_id, request } => (stream_id, request),
            other => panic!("expected tunnel_request, got {other:?}"),
        };
        assert_eq!(stream_id, 42);
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/x");
        assert!(request.headers.is_empty());
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_decode_tunnel_request_with_nulls() {
        let msg = RelayMessage::decode(
            r#"{"type":"tunnel_request","stream_id":11,"request":{"method":"POST","path":"/up","query_string":null,"headers":null,"body":null}}"#,
        )
        .unwrap();
        let RelayMessage::TunnelRequest { stream_id, request } = msg else {
            panic!("expected tunnel_request");
        };
        assert_eq!(stream_id, 11);
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/up");
        assert!(request.query_string.is_empty());
        assert!(request.headers.is_empty());
        assert!(request.body.is_empty());

        let msg = RelayMessage::decode(r#"{"type":"tunnel_request","stream_id":12,"request":null}"#)
            .unwrap();
        assert_eq!(
            msg,
            RelayMessage::TunnelRequest {
                stream_id: 12,
                request: ForwardedRequest::default(),
            }
        );
    }

    #[test]
    fn test_decode_challenge_with_null_identity() {
        let msg = RelayMessage::decode(
            r#"{"type":"auth_challenge","challenge_id":"c1","challenge":"nonce","server_address":null}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayMessage::AuthChallenge {
                challenge_id: "c1".into(),
                challenge: "nonce".into(),
                server_address: String::new(),
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = RelayMessage::decode(r#"{"type":"shiny_new_thing","x":1}"#).unwrap();
        assert_eq!(msg, RelayMessage::Unknown);
        assert_eq!(RelayMessage::decode(r#"{"type":"ping"}"#).unwrap(), RelayMessage::Ping);
    }

    #[test]
    fn test_malformed_is_an_error() {
        assert!(RelayMessage::decode("not json").is_err());
        assert!(RelayMessage::decode(r#"{"no_type":true}"#).is_err());
        assert!(RelayMessage::decode(r#"{"type":"tunnel_request"}"#).is_err());
    }

    #[test]
    fn test_encode_wire_shapes() {
        let bind: serde_json::Value =
            serde_json::from_str(&ClientMessage::bind("svc", 1234).encode().unwrap()).unwrap();
        assert_eq!(bind, json!({"type": "bind", "service": "svc", "local_port": 1234}));

        let pong: serde_json::Value =
            serde_json::from_str(&ClientMessage::Pong.encode().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));

        let resp = ClientMessage::TunnelResponse {
            stream_id: 9,
            response: ForwardedResponse::text(502, "boom"),
        };
        let value: serde_json::Value = serde_json::from_str(&resp.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "tunnel_response");
        assert_eq!(value["stream_id"], 9);
        assert_eq!(value["response"]["status_code"], 502);
        assert_eq!(value["response"]["body"], "boom");
        assert_eq!(value["response"]["headers"]["Content-Type"], "text/plain");
    }
}
