//! Named-event wire format.
//!
//! Every named event except images travels as a JSON text frame
//! `{"event": <name>, "data": <payload>}`. A `receiveImage` event is a binary
//! frame whose payload is the raw JPEG bytes, with no envelope around it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const AUTHENTICATE: &str = "authenticate";
/// Reply event name the client asks the server to answer on
pub const AUTH_REPLY: &str = "onAuthentication";
pub const RECEIVE_IMAGE: &str = "receiveImage";
/// Generic error event a server may emit
pub const ERROR: &str = "error";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unexpected payload for event {event:?}: {reason}")]
    BadPayload { event: String, reason: String },
}

/// A single frame on the wire, independent of the transport library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// JSON envelope of a named event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::BadPayload {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

/// Payload of the outbound `authenticate` event
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub username: String,
    pub password: String,
    #[serde(rename = "replyEventName")]
    pub reply_event: String,
    /// Correlation token; servers may echo it back in the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl fmt::Debug for AuthenticateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticateRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("reply_event", &self.reply_event)
            .field("token", &self.token)
            .finish()
    }
}

/// Payload of the inbound authentication reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AuthResult {
    /// Whether this reply answers the handshake identified by `token`.
    /// Replies that carry no token are taken to answer the current one.
    pub fn answers(&self, token: &str) -> bool {
        self.token.as_deref().map_or(true, |t| t == token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Events a streaming client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Authenticate(AuthenticateRequest),
    Image(Vec<u8>),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate(_) => AUTHENTICATE,
            ClientEvent::Image(_) => RECEIVE_IMAGE,
        }
    }

    pub fn encode(self) -> Result<WireMessage, ProtocolError> {
        match self {
            ClientEvent::Authenticate(req) => {
                let envelope = Envelope::new(AUTHENTICATE, serde_json::to_value(req)?);
                Ok(WireMessage::Text(serde_json::to_string(&envelope)?))
            }
            ClientEvent::Image(bytes) => Ok(WireMessage::Binary(bytes)),
        }
    }

    /// Server-side decoding of a client frame
    pub fn decode(msg: WireMessage) -> Result<Self, ProtocolError> {
        match msg {
            WireMessage::Binary(bytes) => Ok(ClientEvent::Image(bytes)),
            WireMessage::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text)?;
                if envelope.event != AUTHENTICATE {
                    return Err(ProtocolError::BadPayload {
                        event: envelope.event,
                        reason: "not a client event".to_string(),
                    });
                }
                Ok(ClientEvent::Authenticate(envelope.payload()?))
            }
        }
    }
}

/// Decode a text frame sent by the server
pub fn decode_server_event(text: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a server event as a text frame
pub fn encode_server_event<T: Serialize>(event: &str, payload: &T) -> Result<WireMessage, ProtocolError> {
    let envelope = Envelope::new(event, serde_json::to_value(payload)?);
    Ok(WireMessage::Text(serde_json::to_string(&envelope)?))
}

/// Fresh correlation token for one handshake attempt
pub fn generate_token() -> String {
    use rand::Rng;
    let random_bytes: Vec<u8> = (0..16).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_wire_shape() {
        let event = ClientEvent::Authenticate(AuthenticateRequest {
            username: "a".into(),
            password: "b".into(),
            reply_event: AUTH_REPLY.into(),
            token: Some("t1".into()),
        });
        let WireMessage::Text(text) = event.encode().unwrap() else {
            panic!("authenticate must be a text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "authenticate");
        assert_eq!(value["data"]["username"], "a");
        assert_eq!(value["data"]["password"], "b");
        assert_eq!(value["data"]["replyEventName"], "onAuthentication");
        assert_eq!(value["data"]["token"], "t1");
    }

    #[test]
    fn test_authenticate_debug_hides_password() {
        let req = AuthenticateRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            reply_event: AUTH_REPLY.into(),
            token: None,
        };
        let debug = format!("{:?}", ClientEvent::Authenticate(req));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_image_is_raw_binary() {
        let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00];
        let encoded = ClientEvent::Image(jpeg.clone()).encode().unwrap();
        assert_eq!(encoded, WireMessage::Binary(jpeg.clone()));
        assert_eq!(ClientEvent::decode(encoded).unwrap(), ClientEvent::Image(jpeg));
    }

    #[test]
    fn test_auth_reply_without_token_answers_any_handshake() {
        let envelope = decode_server_event(r#"{"event":"onAuthentication","data":{"accepted":true}}"#).unwrap();
        assert_eq!(envelope.event, AUTH_REPLY);
        let result: AuthResult = envelope.payload().unwrap();
        assert!(result.accepted);
        assert!(result.answers("anything"));

        let stale = AuthResult {
            accepted: true,
            token: Some("old".into()),
        };
        assert!(!stale.answers("new"));
    }

    #[test]
    fn test_bad_payload_is_reported() {
        let envelope = decode_server_event(r#"{"event":"onAuthentication","data":{"accepted":"yes"}}"#).unwrap();
        assert!(matches!(
            envelope.payload::<AuthResult>(),
            Err(ProtocolError::BadPayload { .. })
        ));
        assert!(decode_server_event("not json").is_err());
    }

    #[test]
    fn test_client_decode_rejects_server_events() {
        let text = r#"{"event":"onAuthentication","data":{"accepted":true}}"#.to_string();
        assert!(ClientEvent::decode(WireMessage::Text(text)).is_err());
    }

    #[test]
    fn test_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
