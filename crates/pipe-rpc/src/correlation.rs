//! Response correlation: matching inbound replies to the calls awaiting them.
//!
//! Every inbound envelope is first offered here. A reply carries the
//! `MessageId` of the request it answers, so a hit resolves the waiter and a
//! miss means the envelope is a fresh request for the local handler.
//!
//! Each entry resolves at most once. Whoever removes it from the table
//! (a matching reply, the waiter's own timeout, or an explicit failure) is
//! the one that delivers the outcome; later attempts find nothing.
//!
//! A waiter dropped before resolution (e.g. the losing branches of a fan-out
//! call) leaves a tombstone until its deadline. A reply that arrives for a
//! tombstone is swallowed instead of being mistaken for a request. Expired
//! tombstones are swept on the next registration.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bridge::protocol::{Envelope, MessageId};
use crate::connection::ConnectionId;
use crate::error::{Result, RpcError};

type Outcome = Result<Envelope>;

struct Slot {
    /// `None` once the waiter has been dropped.
    tx: Option<oneshot::Sender<Outcome>>,
    deadline: Instant,
    owner: Option<ConnectionId>,
}

/// Table of in-flight calls keyed by `MessageId`. Cheap to clone.
#[derive(Clone, Default)]
pub struct ResponseChannel {
    pending: Arc<DashMap<MessageId, Slot>>,
}

impl ResponseChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request`.
    ///
    /// `owner` ties the call to the connection it was sent on so the whole
    /// set can be failed when that connection drops. Fails with
    /// [`RpcError::DuplicatePending`] if the message id is already in use.
    pub fn register(
        &self,
        request: &Envelope,
        timeout: Duration,
        owner: Option<ConnectionId>,
    ) -> Result<PendingResponse> {
        self.sweep_tombstones();

        let id = request.message_id();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(RpcError::DuplicatePending(id)),
            Entry::Vacant(slot) => {
                slot.insert(Slot {
                    tx: Some(tx),
                    deadline,
                    owner,
                });
            }
        }
        tracing::trace!(message_id = %id, kind = request.kind(), ?timeout, "Registered pending call");

        Ok(PendingResponse {
            id,
            rx,
            deadline,
            timeout,
            table: Arc::clone(&self.pending),
            settled: false,
        })
    }

    /// Resolve the waiter for `request` with `response`.
    ///
    /// Returns false when nothing is pending under the request's message id.
    pub fn complete(&self, request: &Envelope, response: Envelope) -> bool {
        self.resolve(request.message_id(), Ok(response))
    }

    /// Offer an inbound envelope as a reply.
    ///
    /// Hands the envelope back when it does not answer any pending call, so
    /// the caller can dispatch it as a request.
    pub fn offer(&self, inbound: Envelope) -> Option<Envelope> {
        let id = inbound.message_id();
        match self.pending.remove(&id) {
            Some((_, slot)) => {
                match slot.tx {
                    Some(tx) => {
                        // The receiver may have timed out a moment ago; the
                        // reply is consumed either way.
                        let _ = tx.send(Ok(inbound));
                    }
                    None => {
                        tracing::debug!(message_id = %id, kind = inbound.kind(), "Discarding reply for abandoned call");
                    }
                }
                None
            }
            None => Some(inbound),
        }
    }

    /// Fail the waiter for `request`, if any. Returns whether one was pending.
    pub fn fail(&self, request: &Envelope, error: RpcError) -> bool {
        self.resolve(request.message_id(), Err(error))
    }

    /// Fail every call that was sent on `connection`.
    pub fn fail_connection(&self, connection: ConnectionId, error: RpcError) -> usize {
        let ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|entry| entry.owner == Some(connection))
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id)
                && let Some(tx) = slot.tx
            {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(%connection, failed, "Failed pending calls for closed connection");
        }
        failed
    }

    /// Fail everything still waiting, e.g. on shutdown.
    pub fn fail_all(&self, error: RpcError) {
        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.resolve(id, Err(error.clone()));
        }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn resolve(&self, id: MessageId, outcome: Outcome) -> bool {
        match self.pending.remove(&id) {
            Some((_, slot)) => {
                if let Some(tx) = slot.tx {
                    let _ = tx.send(outcome);
                }
                true
            }
            None => false,
        }
    }

    fn sweep_tombstones(&self) {
        let now = Instant::now();
        self.pending
            .retain(|_, slot| slot.tx.is_some() || slot.deadline > now);
    }
}

/// A registered call. Consume with [`PendingResponse::wait`].
pub struct PendingResponse {
    id: MessageId,
    rx: oneshot::Receiver<Outcome>,
    deadline: Instant,
    timeout: Duration,
    table: Arc<DashMap<MessageId, Slot>>,
    settled: bool,
}

impl PendingResponse {
    pub fn message_id(&self) -> MessageId {
        self.id
    }

    /// Wait for the reply, a failure, or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<Envelope> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::connection_lost("response table dropped")),
            Err(_) => {
                let removed = self
                    .table
                    .remove_if(&self.id, |_, slot| slot.tx.is_some())
                    .is_some();
                if removed {
                    tracing::debug!(message_id = %self.id, timeout = ?self.timeout, "Call timed out");
                    Err(RpcError::Timeout(self.timeout))
                } else {
                    // Someone else took the entry first and is about to deliver.
                    (&mut self.rx)
                        .await
                        .unwrap_or(Err(RpcError::Timeout(self.timeout)))
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(mut slot) = self.table.get_mut(&self.id) {
            slot.tx = None;
        }
    }
}
