//! Wire-level message types for the Tether session protocol.
//!
//! Every frame on the transport is one JSON envelope tagged by a `kind`
//! field. Requests carry a correlation id that exactly one response or
//! error reply will echo; notifications carry no id and are never replied
//! to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol version negotiated during `session/hello`.
pub const TETHER_VERSION: &str = "1.0";

/// Correlation id assigned by the client to every outbound request.
///
/// Allocated from a monotonic per-session counter, so an id is never
/// reused within one session lifetime.
pub type RequestId = u64;

/// Reserved method names. Server-declared operation names must not use the
/// `session/`, `operations/` or `resources/` prefixes.
pub mod method {
    /// Handshake request, valid exactly once per session.
    pub const HELLO: &str = "session/hello";
    /// Liveness probe round trip.
    pub const PING: &str = "session/ping";
    /// Best-effort notification that the client abandoned a request.
    pub const CANCELLED: &str = "session/cancelled";
    /// Explicit re-fetch of the capability set.
    pub const LIST_OPERATIONS: &str = "operations/list";
    /// Snapshot read of an addressable resource.
    pub const READ_RESOURCE: &str = "resources/read";

    /// Prefixes reserved for protocol-defined methods.
    pub const RESERVED_PREFIXES: [&str; 3] = ["session/", "operations/", "resources/"];
}

/// The four message kinds that travel on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// Client-initiated call awaiting exactly one reply.
    Request {
        id: RequestId,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Successful reply to the request with the same id.
    Response { id: RequestId, result: Value },
    /// Failure reply to the request with the same id.
    Error { id: RequestId, error: ErrorDetail },
    /// Server-initiated message with no reply expected.
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Envelope::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }

    /// Correlation id, present on everything except notifications.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Envelope::Request { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Error { id, .. } => Some(*id),
            Envelope::Notification { .. } => None,
        }
    }
}

/// Peer-reported failure for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorDetail {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Identity the client presents during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Identity the server reports back in the hello result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// One invocable operation the session may call while ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
}

/// One addressable resource the session may read while ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Everything the ready session has learned it may call or read.
///
/// Populated once when the handshake completes and replaced wholesale by an
/// explicit refresh; never merged incrementally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub operations: Vec<OperationDescriptor>,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// Params of `session/hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub session_id: Uuid,
    pub client_info: ClientInfo,
}

/// Result of `session/hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    pub capabilities: CapabilitySet,
}

/// Result of `operations/list`, same capability shape as the hello result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListOperationsResult {
    pub capabilities: CapabilitySet,
}

/// Params of `resources/read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// Versionless snapshot returned by a resource read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub contents: Vec<ResourceChunk>,
}

/// One addressed piece of a resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChunk {
    pub uri: String,
    pub text: String,
}

/// Params of the `session/cancelled` notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CancelledParams {
    pub id: RequestId,
}
