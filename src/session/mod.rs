//! Session core: lifecycle, correlation, and the I/O task.
//!
//! One spawned task owns the transport for the whole session. It drains the
//! serialized write queue and dispatches inbound envelopes: replies to the
//! pending table, notifications to the handler. Callers never touch the
//! transport; they enqueue encoded requests and await their oneshot slot,
//! so replies may arrive in any order and still wake the right caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{decode_envelope, encode_envelope, EncodeError};
use crate::messages::{
    method, CancelledParams, CapabilitySet, ClientInfo, Envelope, ErrorDetail, HelloParams,
    HelloResult, ListOperationsResult, OperationDescriptor, ReadResourceParams, RequestId,
    ResourceContent, ServerInfo, TETHER_VERSION,
};
use crate::pending::{FailReason, PendingOutcome, PendingTable, RegisterError, Resolution};
use crate::transport::{MessageTransport, TransportError};

pub mod state;
pub use state::{SessionState, SessionStateError};

/// Knobs for a single session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the `session/hello` round trip.
    pub hello_timeout: Duration,
    /// Default deadline applied to operational calls; `None` waits
    /// indefinitely (the per-call `_with_deadline` variants override this).
    pub request_timeout: Option<Duration>,
    /// Depth of the serialized write queue between callers and the I/O task.
    pub outbound_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(10),
            request_timeout: None,
            outbound_queue_depth: 16,
        }
    }
}

/// Receiver for server-initiated notifications.
///
/// Called inline on the I/O task, so implementations must not block;
/// long-running work belongs on a task of its own.
pub trait NotificationHandler: Send + Sync + 'static {
    fn on_notification(&self, method: &str, params: Value);
}

impl<F> NotificationHandler for F
where
    F: Fn(&str, Value) + Send + Sync + 'static,
{
    fn on_notification(&self, method: &str, params: Value) {
        self(method, params)
    }
}

/// Everything that can go wrong with a session call.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The call is not admitted right now, or a peer reply violated the
    /// protocol contract.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The hello exchange did not produce a usable session.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// The peer answered this call with an error reply.
    #[error("peer error {}: {}", .0.code, .0.message)]
    Operation(ErrorDetail),
    /// No reply arrived before the deadline.
    #[error("request timed out")]
    Timeout,
    /// The session was closed locally.
    #[error("session closed")]
    Closed,
    /// The transport ended or failed underneath the session.
    #[error("transport closed")]
    Transport,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

fn fail_error(reason: FailReason) -> SessionError {
    match reason {
        FailReason::SessionClosed => SessionError::Closed,
        FailReason::TransportClosed => SessionError::Transport,
    }
}

fn encode_params<T: Serialize>(params: &T) -> Result<Value, SessionError> {
    serde_json::to_value(params).map_err(|e| SessionError::Encode(EncodeError::Serialize(e)))
}

struct Shared {
    state: Mutex<SessionState>,
    pending: PendingTable,
    registry: RwLock<CapabilitySet>,
    server_info: RwLock<Option<ServerInfo>>,
    anomalies: AtomicU64,
    next_id: AtomicU64,
    close: Notify,
}

impl Shared {
    fn note_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    fn teardown(&self, reason: FailReason) {
        {
            let mut state = self.state.lock();
            if !state.is_closed() {
                debug!(from = state.label(), ?reason, "session closed");
            }
            let _ = state.transition(SessionState::Closed);
        }
        self.pending.fail_all(reason);
    }
}

/// A client session over one message transport.
///
/// Construction spawns the I/O task immediately; the session is usable for
/// operational calls only after [`Session::initialize`] completes. All
/// methods take `&self`, so a `Session` can be shared behind an [`Arc`] and
/// driven from many tasks at once.
pub struct Session {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    session_id: Uuid,
    config: SessionConfig,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Binds to an already-open transport and starts the I/O task.
    pub fn new<T, H>(transport: T, handler: H, config: SessionConfig) -> Self
    where
        T: MessageTransport + 'static,
        H: NotificationHandler,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Uninitialized),
            pending: PendingTable::new(),
            registry: RwLock::new(CapabilitySet::default()),
            server_info: RwLock::new(None),
            anomalies: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            close: Notify::new(),
        });
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_depth.max(1));
        let io_task = tokio::spawn(io_loop(
            transport,
            handler,
            Arc::clone(&shared),
            outbound_rx,
        ));
        Self {
            shared,
            outbound: outbound_tx,
            session_id: Uuid::new_v4(),
            config,
            io_task: Mutex::new(Some(io_task)),
        }
    }

    /// Performs the `session/hello` handshake.
    ///
    /// Valid exactly once, from `Uninitialized`; concurrent callers lose the
    /// race on the `Initializing` transition. Any handshake failure closes
    /// the session for good.
    pub async fn initialize(
        &self,
        client_info: ClientInfo,
    ) -> Result<CapabilitySet, SessionError> {
        {
            let mut state = self.shared.state.lock();
            if state.is_closed() {
                return Err(self.closed_error());
            }
            let label = state.label();
            state.transition(SessionState::Initializing).map_err(|_| {
                SessionError::Protocol(format!(
                    "initialize is only valid once, from an uninitialized session (state is {label})"
                ))
            })?;
        }
        debug!(session_id = %self.session_id, "starting handshake");

        let params = HelloParams {
            protocol_version: TETHER_VERSION.to_string(),
            session_id: self.session_id,
            client_info,
        };
        match self.hello_round_trip(&params).await {
            Ok(result) => {
                *self.shared.server_info.write() = Some(result.server_info.clone());
                *self.shared.registry.write() = result.capabilities.clone();
                {
                    let mut state = self.shared.state.lock();
                    state
                        .transition(SessionState::Ready {
                            since: Instant::now(),
                        })
                        .map_err(|_| self.closed_error())?;
                }
                debug!(
                    server = %result.server_info.name,
                    operations = result.capabilities.operations.len(),
                    resources = result.capabilities.resources.len(),
                    "session ready"
                );
                Ok(result.capabilities)
            }
            Err(err) => {
                warn!(error = %err, "handshake failed; closing session");
                self.close_now();
                Err(match err {
                    SessionError::Operation(detail) => SessionError::HandshakeFailed(format!(
                        "peer rejected hello with code {}: {}",
                        detail.code, detail.message
                    )),
                    other => other,
                })
            }
        }
    }

    async fn hello_round_trip(&self, params: &HelloParams) -> Result<HelloResult, SessionError> {
        let value = self
            .call_raw(
                method::HELLO,
                encode_params(params)?,
                Some(self.config.hello_timeout),
            )
            .await?;
        let result: HelloResult = serde_json::from_value(value)
            .map_err(|e| SessionError::HandshakeFailed(format!("malformed hello result: {e}")))?;
        if result.protocol_version != TETHER_VERSION {
            return Err(SessionError::HandshakeFailed(format!(
                "peer speaks protocol {}, this client requires {}",
                result.protocol_version, TETHER_VERSION
            )));
        }
        Ok(result)
    }

    /// Operations the server declared, in declaration order. A pure local
    /// read of the registry; no round trip.
    pub fn list_operations(&self) -> Result<Vec<OperationDescriptor>, SessionError> {
        self.ensure_ready("list_operations")?;
        Ok(self.shared.registry.read().operations.clone())
    }

    /// Re-fetches the capability set via `operations/list` and replaces the
    /// registry wholesale with the reply.
    pub async fn refresh_operations(&self) -> Result<Vec<OperationDescriptor>, SessionError> {
        self.ensure_ready("refresh_operations")?;
        let value = self
            .call_raw(
                method::LIST_OPERATIONS,
                Value::Null,
                self.config.request_timeout,
            )
            .await?;
        let result: ListOperationsResult = serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("malformed operations list: {e}")))?;
        *self.shared.registry.write() = result.capabilities.clone();
        Ok(result.capabilities.operations)
    }

    /// Invokes a server-declared operation with the default deadline.
    pub async fn invoke(&self, operation: &str, params: Value) -> Result<Value, SessionError> {
        self.invoke_with_deadline(operation, params, self.config.request_timeout)
            .await
    }

    /// Invokes a server-declared operation, waiting at most `deadline` for
    /// the reply (`None` waits indefinitely).
    pub async fn invoke_with_deadline(
        &self,
        operation: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, SessionError> {
        self.ensure_ready("invoke")?;
        if method::RESERVED_PREFIXES
            .iter()
            .any(|prefix| operation.starts_with(prefix))
        {
            return Err(SessionError::Protocol(format!(
                "operation name `{operation}` uses a reserved method prefix"
            )));
        }
        self.call_raw(operation, params, deadline).await
    }

    /// Reads a snapshot of an addressable resource.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContent, SessionError> {
        self.read_resource_with_deadline(uri, self.config.request_timeout)
            .await
    }

    pub async fn read_resource_with_deadline(
        &self,
        uri: &str,
        deadline: Option<Duration>,
    ) -> Result<ResourceContent, SessionError> {
        self.ensure_ready("read_resource")?;
        let params = encode_params(&ReadResourceParams {
            uri: uri.to_string(),
        })?;
        let value = self.call_raw(method::READ_RESOURCE, params, deadline).await?;
        serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("malformed resource content: {e}")))
    }

    /// Liveness probe round trip.
    pub async fn ping(&self) -> Result<(), SessionError> {
        self.ensure_ready("ping")?;
        self.call_raw(method::PING, Value::Null, self.config.request_timeout)
            .await
            .map(|_| ())
    }

    /// Closes the session from any state and waits for the I/O task to
    /// finish. Idempotent; every outstanding call fails with
    /// [`SessionError::Closed`].
    pub async fn close(&self) {
        self.close_now();
        let task = self.io_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Dropped, late and undecodable inbound messages seen so far.
    pub fn anomaly_count(&self) -> u64 {
        self.shared.anomalies.load(Ordering::Relaxed)
    }

    /// Client-generated id presented to the peer during the handshake.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Identity the server reported in the hello result.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server_info.read().clone()
    }

    /// Snapshot of the full capability registry.
    pub fn capabilities(&self) -> CapabilitySet {
        self.shared.registry.read().clone()
    }

    fn ensure_ready(&self, call: &'static str) -> Result<(), SessionError> {
        let state = *self.shared.state.lock();
        match state {
            SessionState::Ready { .. } => Ok(()),
            SessionState::Closed => Err(self.closed_error()),
            other => Err(SessionError::Protocol(format!(
                "`{call}` requires a ready session (state is {})",
                other.label()
            ))),
        }
    }

    fn closed_error(&self) -> SessionError {
        fail_error(
            self.shared
                .pending
                .closed_reason()
                .unwrap_or(FailReason::SessionClosed),
        )
    }

    fn close_now(&self) {
        self.shared.close.notify_one();
        self.shared.teardown(FailReason::SessionClosed);
    }

    /// Sends one request and awaits its correlated reply.
    async fn call_raw(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = match self.shared.pending.register(id) {
            Ok(rx) => rx,
            Err(RegisterError::Closed(reason)) => return Err(fail_error(reason)),
            Err(RegisterError::DuplicateId(id)) => {
                return Err(SessionError::Protocol(format!(
                    "correlation id {id} allocated twice"
                )))
            }
        };
        let guard = PendingGuard::arm(&self.shared, &self.outbound, id);

        let unit = encode_envelope(&Envelope::request(id, method, params))?;
        if self.outbound.send(unit).await.is_err() {
            return Err(self.closed_error());
        }

        let outcome = match deadline {
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(res) => res,
                Err(_) => {
                    debug!(id, %method, "request deadline elapsed");
                    return Err(SessionError::Timeout);
                }
            },
            None => rx.await,
        };
        // A dropped sender without resolution can only mean teardown raced us.
        let outcome = outcome.map_err(|_| self.closed_error())?;
        guard.disarm();
        match outcome {
            PendingOutcome::Reply(value) => Ok(value),
            PendingOutcome::PeerError(detail) => Err(SessionError::Operation(detail)),
            PendingOutcome::Failed(reason) => Err(fail_error(reason)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_now();
    }
}

/// Removes the pending entry when its caller gives up before resolution and
/// tells the peer, best-effort, that the call was abandoned.
struct PendingGuard<'a> {
    shared: &'a Shared,
    outbound: &'a mpsc::Sender<Vec<u8>>,
    id: RequestId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn arm(shared: &'a Shared, outbound: &'a mpsc::Sender<Vec<u8>>, id: RequestId) -> Self {
        Self {
            shared,
            outbound,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.shared.pending.deregister(self.id) {
            return;
        }
        debug!(id = self.id, "caller abandoned request");
        let params =
            serde_json::to_value(CancelledParams { id: self.id }).unwrap_or(Value::Null);
        let cancelled = Envelope::notification(method::CANCELLED, params);
        if let Ok(unit) = encode_envelope(&cancelled) {
            // Advisory only; a full or closed queue drops the notice.
            let _ = self.outbound.try_send(unit);
        }
    }
}

enum IoEvent {
    Close,
    Outbound(Option<Vec<u8>>),
    Inbound(Result<Option<Vec<u8>>, TransportError>),
}

/// Owns the transport for the session's lifetime.
async fn io_loop<T, H>(
    mut transport: T,
    handler: H,
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
) where
    T: MessageTransport + 'static,
    H: NotificationHandler,
{
    let reason = loop {
        let event = tokio::select! {
            _ = shared.close.notified() => IoEvent::Close,
            unit = outbound.recv() => IoEvent::Outbound(unit),
            inbound = transport.recv() => IoEvent::Inbound(inbound),
        };
        match event {
            IoEvent::Close => break FailReason::SessionClosed,
            IoEvent::Outbound(Some(unit)) => {
                if let Err(err) = transport.send(unit).await {
                    warn!(error = %err, "transport send failed");
                    break FailReason::TransportClosed;
                }
            }
            IoEvent::Outbound(None) => break FailReason::SessionClosed,
            IoEvent::Inbound(Ok(Some(unit))) => dispatch(&unit, &handler, &shared),
            IoEvent::Inbound(Ok(None)) => {
                debug!("transport reached end of stream");
                break FailReason::TransportClosed;
            }
            IoEvent::Inbound(Err(err)) => {
                warn!(error = %err, "transport recv failed");
                break FailReason::TransportClosed;
            }
        }
    };
    shared.teardown(reason);
}

/// Routes one inbound frame. Never fails the loop; anything that cannot be
/// dispatched is counted and dropped.
fn dispatch<H: NotificationHandler>(unit: &[u8], handler: &H, shared: &Shared) {
    let envelope = match decode_envelope(unit) {
        Ok(envelope) => envelope,
        Err(err) => {
            shared.note_anomaly();
            warn!(error = %err, "dropping undecodable frame");
            return;
        }
    };
    match envelope {
        Envelope::Response { id, result } => {
            if shared.pending.resolve(id, Ok(result)) == Resolution::Unknown {
                shared.note_anomaly();
                warn!(id, "dropping response with no pending request");
            }
        }
        Envelope::Error { id, error } => {
            if shared.pending.resolve(id, Err(error)) == Resolution::Unknown {
                shared.note_anomaly();
                warn!(id, "dropping error reply with no pending request");
            }
        }
        Envelope::Notification { method, params } => {
            debug!(%method, "dispatching notification");
            handler.on_notification(&method, params);
        }
        Envelope::Request { id, method, .. } => {
            shared.note_anomaly();
            warn!(id, %method, "dropping inbound request; this side serves no calls");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{OperationDescriptor, ResourceDescriptor};
    use crate::transport::PipeTransport;
    use serde_json::json;

    fn noop_handler() -> impl NotificationHandler {
        |_: &str, _: Value| {}
    }

    fn hello_result() -> HelloResult {
        HelloResult {
            protocol_version: TETHER_VERSION.to_string(),
            server_info: ServerInfo {
                name: "notes-server".into(),
                version: "0.1.0".into(),
            },
            capabilities: CapabilitySet {
                operations: vec![OperationDescriptor {
                    name: "ReadNote".into(),
                    input_schema: json!({"type": "object"}),
                    output_schema: Value::Null,
                }],
                resources: vec![ResourceDescriptor {
                    uri: "resource://notes".into(),
                    name: None,
                }],
            },
        }
    }

    async fn recv_request(peer: &mut PipeTransport) -> (RequestId, String, Value) {
        let unit = peer.recv().await.unwrap().unwrap();
        match decode_envelope(&unit).unwrap() {
            Envelope::Request { id, method, params } => (id, method, params),
            other => panic!("expected request, got {other:?}"),
        }
    }

    async fn send_response(peer: &mut PipeTransport, id: RequestId, result: Value) {
        let unit = encode_envelope(&Envelope::Response { id, result }).unwrap();
        peer.send(unit).await.unwrap();
    }

    async fn serve_hello(peer: &mut PipeTransport) {
        let (id, method, params) = recv_request(peer).await;
        assert_eq!(method, method::HELLO);
        let hello: HelloParams = serde_json::from_value(params).unwrap();
        assert_eq!(hello.protocol_version, TETHER_VERSION);
        send_response(peer, id, serde_json::to_value(hello_result()).unwrap()).await;
    }

    async fn ready_session() -> (Session, PipeTransport) {
        let (near, mut far) = PipeTransport::pair();
        let session = Session::new(near, noop_handler(), SessionConfig::default());
        let init = session.initialize(ClientInfo::new("TestClient", "1.0.0"));
        let ((), caps) = tokio::join!(
            async {
                serve_hello(&mut far).await;
            },
            init
        );
        caps.unwrap();
        (session, far)
    }

    #[tokio::test]
    async fn initialize_reaches_ready_and_stores_the_registry() {
        let (session, _far) = ready_session().await;
        assert!(session.state().is_ready());
        assert_eq!(session.server_info().unwrap().name, "notes-server");
        let ops = session.list_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].name, "ReadNote");
    }

    #[tokio::test]
    async fn second_initialize_is_a_protocol_error() {
        let (session, _far) = ready_session().await;
        let err = session
            .initialize(ClientInfo::new("TestClient", "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        assert!(session.state().is_ready());
    }

    #[tokio::test]
    async fn calls_before_initialize_are_refused() {
        let (near, _far) = PipeTransport::pair();
        let session = Session::new(near, noop_handler(), SessionConfig::default());
        let err = session.invoke("ReadNote", json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[tokio::test]
    async fn version_mismatch_fails_the_handshake_and_closes() {
        let (near, mut far) = PipeTransport::pair();
        let session = Session::new(near, noop_handler(), SessionConfig::default());
        let init = session.initialize(ClientInfo::new("TestClient", "1.0.0"));
        let ((), result) = tokio::join!(
            async {
                let (id, _, _) = recv_request(&mut far).await;
                let mut reply = hello_result();
                reply.protocol_version = "9.9".into();
                send_response(&mut far, id, serde_json::to_value(reply).unwrap()).await;
            },
            init
        );
        assert!(matches!(
            result.unwrap_err(),
            SessionError::HandshakeFailed(_)
        ));
        assert!(session.state().is_closed());
    }

    #[tokio::test]
    async fn peer_error_reply_maps_to_operation_error() {
        let (session, mut far) = ready_session().await;
        let call = session.invoke("ReadNote", json!({"note_id": "missing"}));
        let ((), result) = tokio::join!(
            async {
                let (id, method, _) = recv_request(&mut far).await;
                assert_eq!(method, "ReadNote");
                let unit = encode_envelope(&Envelope::Error {
                    id,
                    error: ErrorDetail::new(404, "no such note"),
                })
                .unwrap();
                far.send(unit).await.unwrap();
            },
            call
        );
        match result.unwrap_err() {
            SessionError::Operation(detail) => assert_eq!(detail.code, 404),
            other => panic!("expected Operation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserved_prefix_operations_are_refused_locally() {
        let (session, _far) = ready_session().await;
        let err = session
            .invoke("session/hello", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[tokio::test]
    async fn timeout_deregisters_and_emits_cancelled() {
        let (session, mut far) = ready_session().await;
        let err = session
            .invoke_with_deadline("ReadNote", json!({}), Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));

        // The request itself, then the best-effort cancellation notice.
        let (id, _, _) = recv_request(&mut far).await;
        let unit = far.recv().await.unwrap().unwrap();
        match decode_envelope(&unit).unwrap() {
            Envelope::Notification { method, params } => {
                assert_eq!(method, method::CANCELLED);
                let cancelled: CancelledParams = serde_json::from_value(params).unwrap();
                assert_eq!(cancelled.id, id);
            }
            other => panic!("expected cancellation notice, got {other:?}"),
        }

        // A late reply is discarded as unknown, not delivered to anyone.
        let before = session.anomaly_count();
        send_response(&mut far, id, json!({"late": true})).await;
        wait_for_anomaly(&session, before).await;
    }

    async fn wait_for_anomaly(session: &Session, before: u64) {
        for _ in 0..50 {
            if session.anomaly_count() > before {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("late reply was never counted as an anomaly");
    }

    #[tokio::test]
    async fn notifications_reach_the_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (near, mut far) = PipeTransport::pair();
        let session = Session::new(
            near,
            move |method: &str, params: Value| {
                sink.lock().push((method.to_string(), params));
            },
            SessionConfig::default(),
        );
        let init = session.initialize(ClientInfo::new("TestClient", "1.0.0"));
        let ((), caps) = tokio::join!(
            async {
                serve_hello(&mut far).await;
            },
            init
        );
        caps.unwrap();

        for i in 0..3 {
            let unit = encode_envelope(&Envelope::notification(
                "resource/changed",
                json!({"seq": i}),
            ))
            .unwrap();
            far.send(unit).await.unwrap();
        }
        for _ in 0..50 {
            if seen.lock().len() == 3 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("resource/changed".to_string(), json!({"seq": 0})));
        assert_eq!(seen[2].1, json!({"seq": 2}));
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls_and_sticks() {
        let (session, mut far) = ready_session().await;
        let session = Arc::new(session);

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.invoke("ReadNote", json!({})).await })
        };
        // Wait for the request to hit the wire so the entry is registered.
        let _ = recv_request(&mut far).await;

        session.close().await;
        assert!(session.state().is_closed());
        assert!(matches!(
            in_flight.await.unwrap().unwrap_err(),
            SessionError::Closed
        ));
        assert!(matches!(
            session.invoke("ReadNote", json!({})).await.unwrap_err(),
            SessionError::Closed
        ));
    }

    #[tokio::test]
    async fn transport_drop_fails_outstanding_calls_as_transport() {
        let (session, mut far) = ready_session().await;
        let session = Arc::new(session);

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.invoke("ReadNote", json!({})).await })
        };
        let _ = recv_request(&mut far).await;

        drop(far);
        assert!(matches!(
            in_flight.await.unwrap().unwrap_err(),
            SessionError::Transport
        ));
        for _ in 0..50 {
            if session.state().is_closed() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.state().is_closed());
    }

    #[tokio::test]
    async fn concurrent_invokes_resolve_by_correlation_id() {
        let (session, mut far) = ready_session().await;
        let session = Arc::new(session);

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.invoke("ReadNote", json!({"n": 1})).await })
        };
        let second = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.invoke("ReadNote", json!({"n": 2})).await })
        };

        let (id_a, _, params_a) = recv_request(&mut far).await;
        let (id_b, _, params_b) = recv_request(&mut far).await;
        // Reply in reverse arrival order; correlation decides who wakes.
        send_response(&mut far, id_b, json!({"echo": params_b["n"]})).await;
        send_response(&mut far, id_a, json!({"echo": params_a["n"]})).await;

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, json!({"echo": 1}));
        assert_eq!(second, json!({"echo": 2}));
    }

    #[tokio::test]
    async fn refresh_replaces_the_registry_wholesale() {
        let (session, mut far) = ready_session().await;
        let refresh = session.refresh_operations();
        let ((), refreshed) = tokio::join!(
            async {
                let (id, method, _) = recv_request(&mut far).await;
                assert_eq!(method, method::LIST_OPERATIONS);
                let result = ListOperationsResult {
                    capabilities: CapabilitySet {
                        operations: vec![OperationDescriptor {
                            name: "DeleteNote".into(),
                            input_schema: Value::Null,
                            output_schema: Value::Null,
                        }],
                        resources: vec![],
                    },
                };
                send_response(&mut far, id, serde_json::to_value(result).unwrap()).await;
            },
            refresh
        );
        let refreshed = refreshed.unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].name, "DeleteNote");
        // The old registry is gone, not merged.
        let names: Vec<_> = session
            .list_operations()
            .unwrap()
            .into_iter()
            .map(|op| op.name)
            .collect();
        assert_eq!(names, vec!["DeleteNote".to_string()]);
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let (session, mut far) = ready_session().await;
        let ping = session.ping();
        let ((), result) = tokio::join!(
            async {
                let (id, method, _) = recv_request(&mut far).await;
                assert_eq!(method, method::PING);
                send_response(&mut far, id, json!({})).await;
            },
            ping
        );
        result.unwrap();
    }
}
