//! Tether Session Protocol (tether) reference implementation (v1.0).
//!
//! Implements a client-side session over any ordered message transport:
//! correlated request/response with per-call deadlines and cancellation,
//! server-initiated notification dispatch, and a capability registry
//! populated by the `session/hello` handshake. All messages are encoded as
//! JSON envelopes tagged by a `kind` discriminator.

pub mod codec;
pub mod messages;
pub mod pending;
pub mod sdk;
pub mod session;
pub mod transport;

pub use codec::{decode_envelope, encode_envelope, DecodeError, EncodeError};
pub use messages::{
    CapabilitySet, ClientInfo, Envelope, ErrorDetail, HelloParams, HelloResult,
    OperationDescriptor, RequestId, ResourceContent, ResourceDescriptor, ServerInfo,
    TETHER_VERSION,
};
pub use pending::{FailReason, PendingOutcome, PendingTable};
pub use sdk::TetherClient;
pub use session::{
    NotificationHandler, Session, SessionConfig, SessionError, SessionState,
};
pub use transport::{
    FramedStreamTransport, MessageTransport, PipeTransport, TimeoutTransport, TransportError,
};
