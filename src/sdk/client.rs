use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::messages::{
    CapabilitySet, ClientInfo, OperationDescriptor, ResourceContent, ServerInfo,
};
use crate::session::{
    NotificationHandler, Session, SessionConfig, SessionError, SessionState,
};
use crate::transport::{FramedStreamTransport, MessageTransport};

/// High-level client that folds session construction and the handshake into
/// a single connect call.
///
/// # Guarantees
/// * `connect` returns only with a `Ready` session; a failed handshake never
///   leaks a half-initialized client.
/// * All operational helpers delegate to [`Session`], so they share its
///   correlation, deadline and teardown semantics.
pub struct TetherClient {
    session: Session,
}

impl std::fmt::Debug for TetherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherClient").finish_non_exhaustive()
    }
}

impl TetherClient {
    /// Connects over an already-established message transport.
    ///
    /// # Behavior
    /// * Spawns the session I/O task, then drives `session/hello` with
    ///   `client_info` before returning.
    /// * Server-initiated notifications are delivered to `handler` for the
    ///   whole client lifetime.
    ///
    /// # Errors
    /// Returns [`SessionError::HandshakeFailed`] when the peer rejects the
    /// hello or answers with an incompatible protocol version, and
    /// [`SessionError::Timeout`] when the hello deadline elapses. The
    /// underlying session is closed in every error case.
    pub async fn connect<T, H>(
        transport: T,
        handler: H,
        config: SessionConfig,
        client_info: ClientInfo,
    ) -> Result<Self, SessionError>
    where
        T: MessageTransport + 'static,
        H: NotificationHandler,
    {
        let session = Session::new(transport, handler, config);
        session.initialize(client_info).await?;
        Ok(Self { session })
    }

    /// Connects over a raw byte stream, applying length-delimited framing.
    ///
    /// Frames larger than `max_frame_size` bytes are refused by the framing
    /// layer on both directions.
    pub async fn connect_stream<S, H>(
        stream: S,
        max_frame_size: usize,
        handler: H,
        config: SessionConfig,
        client_info: ClientInfo,
    ) -> Result<Self, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        H: NotificationHandler,
    {
        let transport = FramedStreamTransport::new(stream, max_frame_size);
        Self::connect(transport, handler, config, client_info).await
    }

    /// Operations the server declared, from the local registry.
    pub fn operations(&self) -> Result<Vec<OperationDescriptor>, SessionError> {
        self.session.list_operations()
    }

    /// Re-fetches the capability set from the server and replaces the local
    /// registry with the reply.
    pub async fn refresh_operations(&self) -> Result<Vec<OperationDescriptor>, SessionError> {
        self.session.refresh_operations().await
    }

    /// Invokes a server-declared operation.
    ///
    /// # Errors
    /// Returns [`SessionError::Operation`] when the peer answers with an
    /// error reply and [`SessionError::Timeout`] when the configured request
    /// deadline elapses first.
    pub async fn invoke(&self, operation: &str, params: Value) -> Result<Value, SessionError> {
        self.session.invoke(operation, params).await
    }

    /// Invokes with an explicit per-call deadline (`None` waits
    /// indefinitely).
    pub async fn invoke_with_deadline(
        &self,
        operation: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, SessionError> {
        self.session
            .invoke_with_deadline(operation, params, deadline)
            .await
    }

    /// Reads a snapshot of an addressable resource.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContent, SessionError> {
        self.session.read_resource(uri).await
    }

    pub async fn read_resource_with_deadline(
        &self,
        uri: &str,
        deadline: Option<Duration>,
    ) -> Result<ResourceContent, SessionError> {
        self.session.read_resource_with_deadline(uri, deadline).await
    }

    /// Liveness probe round trip.
    pub async fn ping(&self) -> Result<(), SessionError> {
        self.session.ping().await
    }

    /// Gracefully closes the client.
    ///
    /// # Behavior
    /// * Transitions the session to `Closed` and fails outstanding calls.
    /// * Waits for the session I/O task to exit.
    pub async fn close(self) {
        self.session.close().await;
    }

    /// Current session lifecycle state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Identity the server reported during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.session.server_info()
    }

    /// Snapshot of the full capability registry.
    pub fn capabilities(&self) -> CapabilitySet {
        self.session.capabilities()
    }

    /// The underlying session, for callers that need the low-level surface.
    pub fn session(&self) -> &Session {
        &self.session
    }
}
