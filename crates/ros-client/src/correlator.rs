//! Completion correlation.
//!
//! Each connection keeps two [`CorrelationTable`]s: one for work it
//! initiated that completes on the send queue (reads, writes, atomics) and
//! one for RPCs whose answer arrives on the receive queue. A caller
//! registers a request id and gets a [`PendingOp`] to wait on; the
//! connection's two drainer tasks ([`drain_completions`]) match completions
//! back to the table by id.
//!
//! Every slot is a one-shot channel, so a request resolves at most once.
//! Resolution, failure, timeout and teardown all remove the slot through
//! the table under its lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ros_transport::{Completion, CompletionStatus, Transport, WorkOpcode};
use ros_types::RequestId;
use ros_wire::{MAX_MESSAGE_LEN, peek_header};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::ClientError;

/// Which completion queue resolves a table's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

/// Work request ids above this value are never registered in a table.
/// Used for unsignaled writes whose only possible completion is a failure.
pub const UNTRACKED_WR_ID: u64 = 1 << 63;

type Slot = oneshot::Sender<Result<Bytes, ClientError>>;

#[derive(Default)]
struct TableInner {
    slots: HashMap<RequestId, Slot>,
    closed: bool,
}

/// Map from request id to the operation waiting for it.
pub struct CorrelationTable {
    direction: Direction,
    inner: Mutex<TableInner>,
}

impl CorrelationTable {
    /// Create an empty, open table.
    pub fn new(direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            direction,
            inner: Mutex::new(TableInner::default()),
        })
    }

    /// The queue this table is resolved from.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Insert an unresolved slot for `req_id`.
    pub fn register(self: &Arc<Self>, req_id: RequestId) -> Result<PendingOp, ClientError> {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        if inner.closed {
            return Err(ClientError::ConnectionClosed);
        }
        if inner.slots.contains_key(&req_id) {
            return Err(ClientError::RequestIdInUse(req_id));
        }
        let (tx, rx) = oneshot::channel();
        inner.slots.insert(req_id, tx);
        trace!(%req_id, direction = %self.direction, "registered pending op");
        Ok(PendingOp {
            req_id,
            rx: Some(rx),
            table: self.clone(),
        })
    }

    /// Resolve `req_id` with `payload`. Returns `false`, after logging, if
    /// no operation is waiting for that id.
    pub fn resolve(&self, req_id: RequestId, payload: Bytes) -> bool {
        self.complete(req_id, Ok(payload), true)
    }

    /// Fail `req_id` with `err`. Returns `false` if no operation is waiting
    /// for that id.
    pub fn fail(&self, req_id: RequestId, err: ClientError) -> bool {
        self.complete(req_id, Err(err), true)
    }

    fn complete(
        &self,
        req_id: RequestId,
        result: Result<Bytes, ClientError>,
        log_unknown: bool,
    ) -> bool {
        let slot = self
            .inner
            .lock()
            .expect("correlation lock poisoned")
            .slots
            .remove(&req_id);
        match slot {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!(%req_id, direction = %self.direction, "waiter went away before completion");
                }
                true
            }
            None => {
                if !log_unknown {
                    return false;
                }
                warn!(
                    %req_id,
                    direction = %self.direction,
                    ok = result.is_ok(),
                    "completion for unknown request id, dropping"
                );
                false
            }
        }
    }

    /// Close the table and fail every outstanding operation with `err`.
    /// Later registrations fail with [`ClientError::ConnectionClosed`].
    /// Returns the number of operations failed.
    pub fn fail_all(&self, err: ClientError) -> usize {
        let slots: Vec<_> = {
            let mut inner = self.inner.lock().expect("correlation lock poisoned");
            inner.closed = true;
            inner.slots.drain().collect()
        };
        let n = slots.len();
        for (_, tx) in slots {
            let _ = tx.send(Err(err.clone()));
        }
        if n > 0 {
            debug!(direction = %self.direction, failed = n, %err, "failed outstanding operations");
        }
        n
    }

    /// Whether `req_id` has an outstanding operation.
    pub fn contains(&self, req_id: RequestId) -> bool {
        self.inner
            .lock()
            .expect("correlation lock poisoned")
            .slots
            .contains_key(&req_id)
    }

    /// Number of outstanding operations.
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .expect("correlation lock poisoned")
            .slots
            .len()
    }

    /// Whether the table was closed by [`CorrelationTable::fail_all`].
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("correlation lock poisoned").closed
    }

    /// Drop the slot for `req_id` if its waiter is gone.
    fn discard_abandoned(&self, req_id: RequestId) {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        if inner.slots.get(&req_id).is_some_and(|tx| tx.is_closed()) {
            inner.slots.remove(&req_id);
            trace!(%req_id, direction = %self.direction, "discarded abandoned pending op");
        }
    }
}

/// An operation waiting for its completion.
///
/// Dropping it without waiting releases its request id; a completion that
/// arrives afterwards is logged and dropped like any unknown id.
pub struct PendingOp {
    req_id: RequestId,
    rx: Option<oneshot::Receiver<Result<Bytes, ClientError>>>,
    table: Arc<CorrelationTable>,
}

impl PendingOp {
    /// The request id to put on the wire.
    pub fn req_id(&self) -> RequestId {
        self.req_id
    }

    /// Wait for the completion.
    pub async fn wait(mut self) -> Result<Bytes, ClientError> {
        let result = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or(Err(ClientError::ConnectionClosed)),
            None => Err(ClientError::ConnectionClosed),
        };
        self.rx = None;
        result
    }

    /// Wait for the completion for at most `limit`.
    ///
    /// On timeout the slot is failed through the table, so a completion
    /// racing with the timeout is either delivered here or dropped by the
    /// drainer, never both.
    pub async fn wait_timeout(mut self, limit: Duration) -> Result<Bytes, ClientError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(ClientError::ConnectionClosed);
        };
        let result = match tokio::time::timeout(limit, &mut *rx).await {
            Ok(result) => result.unwrap_or(Err(ClientError::ConnectionClosed)),
            Err(_) => {
                let timed_out = self.table.complete(
                    self.req_id,
                    Err(ClientError::Timeout(self.req_id)),
                    false,
                );
                if timed_out {
                    debug!(req_id = %self.req_id, ?limit, "request timed out");
                }
                // Either our own timeout or the completion that beat it.
                rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
            }
        };
        self.rx = None;
        result
    }

    /// Wait for the completion for at most `limit`, keeping the slot on
    /// timeout. The op handed back in `Err` can be waited on again.
    pub async fn wait_for(
        mut self,
        limit: Duration,
    ) -> Result<Result<Bytes, ClientError>, PendingOp> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(Err(ClientError::ConnectionClosed));
        };
        match tokio::time::timeout(limit, &mut *rx).await {
            Ok(result) => {
                self.rx = None;
                Ok(result.unwrap_or(Err(ClientError::ConnectionClosed)))
            }
            Err(_) => Err(self),
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            drop(rx);
            self.table.discard_abandoned(self.req_id);
        }
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOp")
            .field("req_id", &self.req_id)
            .field("direction", &self.table.direction)
            .finish()
    }
}

/// The two tables of one connection.
#[derive(Clone)]
pub struct Tables {
    pub send: Arc<CorrelationTable>,
    pub recv: Arc<CorrelationTable>,
}

impl Tables {
    /// Create both tables.
    pub fn new() -> Self {
        Self {
            send: CorrelationTable::new(Direction::Send),
            recv: CorrelationTable::new(Direction::Recv),
        }
    }

    /// The table resolved from `direction`'s queue.
    pub fn get(&self, direction: Direction) -> &Arc<CorrelationTable> {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one completion queue of a connection until it is torn down.
///
/// Runs as a background task, one per queue. Successful completions
/// resolve the operation registered under the echoed request id: the work
/// request id on the send queue, the message header's id on the receive
/// queue. A flushed completion, or the queue closing, fails every
/// outstanding operation of `direction`'s table and ends the task.
pub async fn drain_completions(
    mut queue: mpsc::UnboundedReceiver<Completion>,
    tables: Tables,
    direction: Direction,
    transport: Arc<dyn Transport>,
) {
    while let Some(completion) = queue.recv().await {
        if completion.status == CompletionStatus::Flushed {
            debug!(%direction, wr_id = completion.wr_id, "queue flushed, connection closing");
            break;
        }
        match direction {
            Direction::Send => on_send_completion(&tables, completion),
            Direction::Recv => on_recv_completion(&tables, completion, transport.as_ref()),
        }
    }
    tables.get(direction).fail_all(ClientError::ConnectionClosed);
    debug!(%direction, "completion drainer stopped");
}

fn on_send_completion(tables: &Tables, completion: Completion) {
    if completion.wr_id >= UNTRACKED_WR_ID {
        if let CompletionStatus::Failed(reason) = &completion.status {
            warn!(opcode = ?completion.opcode, %reason, "unsignaled work request failed");
        }
        return;
    }
    let req_id = RequestId::from(completion.wr_id as u16);
    match completion.status {
        CompletionStatus::Success => {
            tables.send.resolve(req_id, completion.payload);
        }
        CompletionStatus::Failed(reason) => {
            let err = ClientError::WorkFailed {
                opcode: completion.opcode,
                reason,
            };
            warn!(%req_id, %err, "work request failed");
            // A failed send belongs to an RPC waiting on the receive table.
            if completion.opcode == WorkOpcode::Send && !tables.send.contains(req_id) {
                tables.recv.fail(req_id, err);
            } else {
                tables.send.fail(req_id, err);
            }
        }
        CompletionStatus::Flushed => {}
    }
}

fn on_recv_completion(tables: &Tables, completion: Completion, transport: &dyn Transport) {
    match completion.status {
        CompletionStatus::Success => match peek_header(&completion.payload) {
            Ok(header) => {
                trace!(req_id = %header.req_id, opcode = ?header.opcode, "message received");
                tables.recv.resolve(header.req_id, completion.payload);
            }
            Err(e) => warn!(error = %e, len = completion.payload.len(), "dropping undecodable message"),
        },
        CompletionStatus::Failed(reason) => {
            warn!(wr_id = completion.wr_id, %reason, "receive failed");
        }
        CompletionStatus::Flushed => return,
    }
    if let Err(e) = transport.post_receive(completion.wr_id, MAX_MESSAGE_LEN) {
        warn!(wr_id = completion.wr_id, error = %e, "failed to re-post receive buffer");
    }
}
