//! Correlation of fire-and-forget backend calls with their completions.
//!
//! Every request goes out through [`AsyncCallCorrelator::issue`], which records
//! a pending entry keyed by the backend's [`CallHandle`] and hands the caller a
//! [`PendingCall`] to await. The dispatch task resolves entries with
//! [`AsyncCallCorrelator::on_completion`]. A second request for the same
//! (entity, kind) while one is in flight joins the existing entry instead of
//! going out again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backend::{Backend, CallHandle, Completion, Request, RequestKind};
use crate::error::{Error, Result};
use crate::session::ConnectionStatus;
use crate::types::EntityId;

/// How a pending call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Completed(Completion),
    /// The owning view was torn down before the backend answered.
    Cancelled,
    /// The backend answered with a payload that does not fit the request.
    Malformed(String),
}

type SharedCompletion = Shared<oneshot::Receiver<CallResult>>;

/// A request the caller can await. Clones await the same resolution.
#[derive(Clone)]
pub struct PendingCall {
    handle: CallHandle,
    kind: RequestKind,
    entity: EntityId,
    coalesced: bool,
    completion: SharedCompletion,
}

impl PendingCall {
    pub fn handle(&self) -> CallHandle {
        self.handle
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// True when this call joined a request that was already in flight.
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// Suspend until the call resolves. Returns immediately if it already has.
    pub async fn wait(self) -> CallResult {
        self.completion.await.unwrap_or(CallResult::Cancelled)
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("entity", &self.entity)
            .field("coalesced", &self.coalesced)
            .finish()
    }
}

struct PendingRequest {
    entity: EntityId,
    kind: RequestKind,
    request: Request,
    tx: oneshot::Sender<CallResult>,
    completion: SharedCompletion,
    issued_at: Instant,
}

impl PendingRequest {
    fn call(&self, handle: CallHandle, coalesced: bool) -> PendingCall {
        PendingCall {
            handle,
            kind: self.kind,
            entity: self.entity,
            coalesced,
            completion: self.completion.clone(),
        }
    }
}

#[derive(Default)]
struct Table {
    pending: HashMap<CallHandle, PendingRequest>,
    in_flight: HashMap<(EntityId, RequestKind), CallHandle>,
    /// Recently resolved handles, oldest first, for telling duplicates apart.
    resolved: VecDeque<CallHandle>,
    resolved_set: HashSet<CallHandle>,
}

impl Table {
    fn remember(&mut self, handle: CallHandle, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.resolved.len() >= capacity {
            if let Some(old) = self.resolved.pop_front() {
                self.resolved_set.remove(&old);
            }
        }
        self.resolved.push_back(handle);
        self.resolved_set.insert(handle);
    }

    fn take(&mut self, handle: CallHandle) -> Option<PendingRequest> {
        let request = self.pending.remove(&handle)?;
        let key = (request.entity, request.kind);
        if self.in_flight.get(&key) == Some(&handle) {
            self.in_flight.remove(&key);
        }
        Some(request)
    }
}

/// Handle-keyed table of pending completions.
///
/// Only the dispatcher resolves or cancels entries.
///
/// ```compile_fail
/// fn drop_everything(correlator: &kaos_social::AsyncCallCorrelator) {
///     correlator.cancel_all();
/// }
/// ```
pub struct AsyncCallCorrelator {
    backend: Arc<dyn Backend>,
    connection: Arc<dyn ConnectionStatus>,
    table: Mutex<Table>,
    resolved_history: usize,
}

impl AsyncCallCorrelator {
    pub fn new(
        backend: Arc<dyn Backend>,
        connection: Arc<dyn ConnectionStatus>,
        resolved_history: usize,
    ) -> Self {
        Self {
            backend,
            connection,
            table: Mutex::new(Table::default()),
            resolved_history,
        }
    }

    /// Issue a request, or join the one already in flight for the same
    /// (entity, kind).
    pub fn issue(&self, request: Request) -> Result<PendingCall> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }

        let key = (request.entity(), request.kind());

        // Held across submit so a fast completion cannot overtake registration.
        let mut table = self.table.lock();

        if let Some(handle) = table.in_flight.get(&key).copied() {
            if let Some(existing) = table.pending.get(&handle) {
                debug!(%handle, entity = %key.0, kind = ?key.1, "coalesced into in-flight request");
                return Ok(existing.call(handle, true));
            }
        }

        let handle = self.backend.submit(&request)?;
        if table.pending.contains_key(&handle) {
            return Err(Error::protocol_anomaly(format!(
                "backend reused live handle {handle}"
            )));
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            entity: key.0,
            kind: key.1,
            request,
            tx,
            completion: rx.shared(),
            issued_at: Instant::now(),
        };
        let call = pending.call(handle, false);
        table.pending.insert(handle, pending);
        table.in_flight.insert(key, handle);
        debug!(%handle, entity = %key.0, kind = ?key.1, "request issued");

        Ok(call)
    }

    /// The request a pending handle was issued for.
    pub fn expected(&self, handle: CallHandle) -> Option<Request> {
        self.table
            .lock()
            .pending
            .get(&handle)
            .map(|p| p.request.clone())
    }

    /// Resolve a handle. Returns false, and logs, if the handle is unknown or
    /// was already resolved; such completions are otherwise ignored.
    pub(crate) fn on_completion(&self, handle: CallHandle, result: CallResult) -> bool {
        let mut table = self.table.lock();
        let Some(request) = table.take(handle) else {
            if table.resolved_set.contains(&handle) {
                warn!(%handle, "protocol anomaly: duplicate completion ignored");
            } else {
                warn!(%handle, "protocol anomaly: completion for unknown handle ignored");
            }
            return false;
        };
        table.remember(handle, self.resolved_history);
        drop(table);

        debug!(
            %handle,
            entity = %request.entity,
            kind = ?request.kind,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "request resolved"
        );
        // Every awaiting caller may have given up already; that is fine.
        let _ = request.tx.send(result);
        true
    }

    /// Resolve every pending request of `entity` as cancelled.
    pub(crate) fn cancel_entity(&self, entity: EntityId) -> usize {
        self.cancel_where(|p| p.entity == entity)
    }

    /// Resolve the pending request of one (entity, kind) as cancelled.
    pub(crate) fn cancel(&self, entity: EntityId, kind: RequestKind) -> bool {
        self.cancel_where(|p| p.entity == entity && p.kind == kind) > 0
    }

    /// Resolve everything as cancelled (client teardown).
    pub(crate) fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, pred: impl Fn(&PendingRequest) -> bool) -> usize {
        let mut table = self.table.lock();
        let handles: Vec<CallHandle> = table
            .pending
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(h, _)| *h)
            .collect();

        let mut cancelled = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(request) = table.take(handle) {
                table.remember(handle, self.resolved_history);
                cancelled.push(request);
            }
        }
        drop(table);

        let count = cancelled.len();
        for request in cancelled {
            debug!(entity = %request.entity, kind = ?request.kind, "request cancelled");
            let _ = request.tx.send(CallResult::Cancelled);
        }
        count
    }

    pub fn in_flight(&self, entity: EntityId, kind: RequestKind) -> Option<CallHandle> {
        self.table.lock().in_flight.get(&(entity, kind)).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}
