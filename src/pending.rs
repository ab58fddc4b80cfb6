//! Correlation table for requests awaiting a reply.
//!
//! Each registered id owns a single-resolution slot; the receive loop
//! resolves it when the matching response or error arrives, and teardown
//! fails every remaining slot atomically with closing the table to new
//! registrations. An id is present at most once, and no entry outlives the
//! session.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::messages::{ErrorDetail, RequestId};

/// Why every remaining entry was failed at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// `close()` was called locally.
    SessionClosed,
    /// The transport ended or errored underneath the receive loop.
    TransportClosed,
}

/// What a waiting caller is handed when its slot resolves.
#[derive(Debug, PartialEq)]
pub enum PendingOutcome {
    /// The peer replied successfully.
    Reply(serde_json::Value),
    /// The peer replied with an error local to this call.
    PeerError(ErrorDetail),
    /// The session died before a reply arrived.
    Failed(FailReason),
}

/// Outcome of [`PendingTable::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reply reached a registered waiter (or one that just gave up).
    Delivered,
    /// No entry for that id; the reply was dropped.
    Unknown,
}

/// Registration was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The table is closed to new registrations.
    #[error("pending table closed")]
    Closed(FailReason),
    /// The id is already pending. Ids are monotonic, so this indicates a
    /// correlation-allocation bug rather than anything the peer did.
    #[error("request id {0} already pending")]
    DuplicateId(RequestId),
}

#[derive(Default)]
struct TableState {
    slots: HashMap<RequestId, oneshot::Sender<PendingOutcome>>,
    closed: Option<FailReason>,
}

/// Tracks requests awaiting a reply, keyed by correlation id.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<TableState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new unresolved entry and returns the slot the caller waits
    /// on.
    pub fn register(
        &self,
        id: RequestId,
    ) -> Result<oneshot::Receiver<PendingOutcome>, RegisterError> {
        let mut state = self.inner.lock();
        if let Some(reason) = state.closed {
            return Err(RegisterError::Closed(reason));
        }
        if state.slots.contains_key(&id) {
            return Err(RegisterError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        state.slots.insert(id, tx);
        Ok(rx)
    }

    /// Completes the entry for `id` exactly once and removes it.
    ///
    /// An absent id (late, unknown or duplicate reply) is dropped and
    /// reported as [`Resolution::Unknown`]; it never disturbs other entries.
    pub fn resolve(&self, id: RequestId, reply: Result<serde_json::Value, ErrorDetail>) -> Resolution {
        let slot = self.inner.lock().slots.remove(&id);
        match slot {
            Some(tx) => {
                let outcome = match reply {
                    Ok(value) => PendingOutcome::Reply(value),
                    Err(detail) => PendingOutcome::PeerError(detail),
                };
                // A dropped receiver means the caller stopped waiting after
                // the reply was already in flight; nothing left to wake.
                let _ = tx.send(outcome);
                Resolution::Delivered
            }
            None => Resolution::Unknown,
        }
    }

    /// Removes a still-pending entry, returning whether it was present.
    ///
    /// Used when a caller abandons its request (deadline or cancellation);
    /// any later reply for that id resolves to [`Resolution::Unknown`].
    pub fn deregister(&self, id: RequestId) -> bool {
        self.inner.lock().slots.remove(&id).is_some()
    }

    /// Fails every still-pending entry with `reason`, atomically with
    /// closing the table to new registrations. Idempotent; the first reason
    /// wins.
    pub fn fail_all(&self, reason: FailReason) {
        let drained: Vec<_> = {
            let mut state = self.inner.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
            state.slots.drain().collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), ?reason, "failing outstanding requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(PendingOutcome::Failed(reason));
        }
    }

    /// Teardown reason, if the table has been closed.
    pub fn closed_reason(&self) -> Option<FailReason> {
        self.inner.lock().closed
    }

    /// Number of entries currently awaiting a reply.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
