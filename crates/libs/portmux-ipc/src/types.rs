use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, HandlerError, IpcError};

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Opaque, JSON-compatible request/response body.
pub type Payload = serde_json::Value;

/// Correlation token chosen by the client for one logical call.
///
/// On the wire this is a JSON string or a non-negative integer. An envelope
/// carrying anything else as its id does not decode and is dropped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

// ── Errors on the wire ────────────────────────────────────────────────────────

/// Structured error carried in `{requestId, error}` responses and error frames.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Payload>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Serialize an arbitrary handler failure.
    ///
    /// [`IpcError`] keeps its code; any other error is wrapped as
    /// [`ErrorCode::Unknown`] with its display text and type name detail.
    pub fn from_handler_error(error: &HandlerError) -> Self {
        if let Some(ipc) = error.downcast_ref::<IpcError>() {
            return Self::from(ipc);
        }
        Self {
            code: ErrorCode::Unknown,
            message: error.to_string(),
            details: error.source().map(|source| Payload::String(source.to_string())),
        }
    }
}

impl From<&IpcError> for ErrorPayload {
    fn from(error: &IpcError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<IpcError> for ErrorPayload {
    fn from(error: IpcError) -> Self {
        Self::from(&error)
    }
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// A unary request from the client: `{requestId, message}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub message: Payload,
}

/// A client's request to cancel a pending call: `{requestId, abort: true}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbortEnvelope {
    pub request_id: RequestId,
    pub abort: bool,
}

/// Anything a client may post on a control channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ClientEnvelope {
    Abort(AbortEnvelope),
    Request(RequestEnvelope),
}

impl ClientEnvelope {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Abort(abort) => &abort.request_id,
            Self::Request(request) => &request.request_id,
        }
    }
}

/// The single reply addressed to one request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ResponseBody {
    /// `{requestId, message}`
    Message(Payload),
    /// `{requestId, error}`
    Error(ErrorPayload),
    /// `{requestId, channel}`: the result streams on the named channel.
    Channel(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn message(request_id: RequestId, message: Payload) -> Self {
        Self {
            request_id,
            body: ResponseBody::Message(message),
        }
    }

    pub fn error(request_id: RequestId, error: ErrorPayload) -> Self {
        Self {
            request_id,
            body: ResponseBody::Error(error),
        }
    }

    pub fn channel(request_id: RequestId, channel: impl Into<String>) -> Self {
        Self {
            request_id,
            body: ResponseBody::Channel(channel.into()),
        }
    }
}

// ── Stream frames ─────────────────────────────────────────────────────────────

/// One frame on a promoted stream channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StreamFrame {
    /// `{value}`
    Value { value: Payload },
    /// `{done: true}`
    Done { done: EndMarker },
    /// `{error}`
    Error { error: ErrorPayload },
}

impl StreamFrame {
    pub fn value(value: Payload) -> Self {
        Self::Value { value }
    }

    pub fn done() -> Self {
        Self::Done { done: EndMarker }
    }

    pub fn error(error: ErrorPayload) -> Self {
        Self::Error { error }
    }

    /// `true` for the frame that ends a stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Value { .. })
    }
}

/// The literal `true` of a `{done: true}` frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndMarker;

impl Serialize for EndMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for EndMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(EndMarker)
        } else {
            Err(de::Error::custom("end marker must be `true`"))
        }
    }
}

// ── Peers ─────────────────────────────────────────────────────────────────────

/// Who is on the other end of a channel.
///
/// Only used for trust decisions and bulk revocation, never as a capability.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub origin: String,
    /// Stable connection-local id (tab, process) when the transport knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl PeerIdentity {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}#{}", self.origin, instance),
            None => f.write_str(&self.origin),
        }
    }
}

/// Transport-supplied facts about an inbound connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub peer: PeerIdentity,
    /// Origin of the endpoint accepting the connection.
    pub local_origin: String,
    /// `false` when the peer is a nested frame rather than a top-level document.
    pub top_level: bool,
}

impl ConnectionMetadata {
    pub fn new(peer: PeerIdentity, local_origin: impl Into<String>) -> Self {
        Self {
            peer,
            local_origin: local_origin.into(),
            top_level: true,
        }
    }

    /// `true` when the peer lives in the same origin as the local endpoint.
    pub fn is_same_origin(&self) -> bool {
        self.peer.origin == self.local_origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_shapes_are_flat() {
        let ok = ResponseEnvelope::message("1".into(), json!("pong"));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"requestId": "1", "message": "pong"})
        );

        let announce = ResponseEnvelope::channel(7.into(), "ns-stream-abc");
        assert_eq!(
            serde_json::to_value(&announce).unwrap(),
            json!({"requestId": 7, "channel": "ns-stream-abc"})
        );

        let failed = ResponseEnvelope::error(
            "2".into(),
            ErrorPayload::new(ErrorCode::Internal, "boom"),
        );
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"requestId": "2", "error": {"code": "internal", "message": "boom"}})
        );
    }

    #[test]
    fn response_decodes_each_shape() {
        let decoded: ResponseEnvelope =
            serde_json::from_value(json!({"requestId": "9", "channel": "x-stream-1"})).unwrap();
        assert_eq!(decoded.body, ResponseBody::Channel("x-stream-1".into()));
    }

    #[test]
    fn client_envelopes_discriminate() {
        let request: ClientEnvelope =
            serde_json::from_value(json!({"requestId": "1", "message": {"ping": 1}})).unwrap();
        assert!(matches!(request, ClientEnvelope::Request(_)));

        let abort: ClientEnvelope =
            serde_json::from_value(json!({"requestId": 3, "abort": true})).unwrap();
        assert!(matches!(abort, ClientEnvelope::Abort(_)));
        assert_eq!(abort.request_id(), &RequestId::Number(3));

        assert!(serde_json::from_value::<ClientEnvelope>(json!({"message": 1})).is_err());
        assert!(serde_json::from_value::<ClientEnvelope>(json!("ping")).is_err());
    }

    #[test]
    fn request_id_is_a_string_or_unsigned_integer() {
        for id in [json!(-1), json!(1.5), json!(true), json!(null), json!({"id": 1}), json!([1])] {
            let envelope = json!({"requestId": id, "message": "ping"});
            assert!(serde_json::from_value::<ClientEnvelope>(envelope).is_err(), "accepted {id}");
        }
        let id: RequestId = serde_json::from_value(json!(u64::MAX)).unwrap();
        assert_eq!(id, RequestId::Number(u64::MAX));
        let id: RequestId = serde_json::from_value(json!("")).unwrap();
        assert_eq!(id, RequestId::Text(String::new()));
    }

    #[test]
    fn null_message_is_still_a_request() {
        let request: ClientEnvelope =
            serde_json::from_value(json!({"requestId": "n", "message": null})).unwrap();
        match request {
            ClientEnvelope::Request(r) => assert_eq!(r.message, Payload::Null),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stream_frames() {
        assert_eq!(serde_json::to_value(StreamFrame::done()).unwrap(), json!({"done": true}));
        assert_eq!(
            serde_json::to_value(StreamFrame::value(json!(3))).unwrap(),
            json!({"value": 3})
        );

        let frame: StreamFrame = serde_json::from_value(json!({"value": null})).unwrap();
        assert_eq!(frame, StreamFrame::value(Payload::Null));
        assert!(!frame.is_terminal());

        let frame: StreamFrame = serde_json::from_value(json!({"done": true})).unwrap();
        assert!(frame.is_terminal());
        assert!(serde_json::from_value::<StreamFrame>(json!({"done": false})).is_err());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn foreign_errors_become_unknown() {
        let error: HandlerError = Box::new(Boom);
        let payload = ErrorPayload::from_handler_error(&error);
        assert_eq!(payload.code, ErrorCode::Unknown);
        assert_eq!(payload.message, "boom");

        let error: HandlerError = Box::new(IpcError::NotFound {
            resource: "note".into(),
        });
        let payload = ErrorPayload::from_handler_error(&error);
        assert_eq!(payload.code, ErrorCode::NotFound);
        assert_eq!(payload.message, "not found: note");
    }

    #[test]
    fn identity_display() {
        let peer = PeerIdentity::new("https://example.com").with_instance("4");
        assert_eq!(peer.to_string(), "https://example.com#4");
    }
}
