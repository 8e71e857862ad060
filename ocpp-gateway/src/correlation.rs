//! Request/reply correlation.
//!
//! # Architecture
//!
//! ```text
//! send_and_wait:
//!   1. allocate request id
//!   2. deadline = now + timeout
//!   3. insert pending entry (oneshot sender) BEFORE the frame is written
//!   4. dispatcher.send
//!        UnknownClient / TransmissionFailed ──► remove entry, return at once
//!   5. select { reply on oneshot | sleep until deadline | cancel }
//!
//! on_inbound_reply:
//!   remove entry by request id ──► found: fire oneshot
//!                              └─► missing: drop (late or unknown reply)
//! ```
//!
//! Whoever removes the entry from the pending table terminates the request,
//! which makes termination exactly-once. A timeout or cancellation that loses
//! the race to a reply still delivers that reply. If the waiting future is
//! dropped, its entry is removed on drop.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::envelope::{Envelope, Payload, RequestEnvelope};
use crate::error::{GatewayError, RequestOutcome, SendResult};
use crate::observer::{GatewayEvent, ObserverList};
use crate::time::TimeProvider;
use crate::types::{NetworkPath, NetworkingMode, NodeId, RequestId, RequestIdFactory};

/// State of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Waiting for a reply.
    Pending,
    /// A response or error reply arrived.
    Satisfied,
    /// The deadline elapsed.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
    /// The request could not be sent.
    SendFailed,
}

/// A correlated request in its terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// Destination node.
    pub destination: NodeId,
    /// Action name.
    pub action: String,
    /// When the request was registered.
    pub sent_at: Duration,
    /// When the request would have timed out.
    pub deadline: Duration,
    /// When the request was terminated.
    pub completed_at: Duration,
    /// How it ended.
    pub outcome: RequestOutcome,
}

impl PendingRequest {
    /// State implied by the outcome.
    pub fn state(&self) -> PendingState {
        match self.outcome {
            RequestOutcome::Response(_) | RequestOutcome::Error { .. } => PendingState::Satisfied,
            RequestOutcome::Timeout => PendingState::TimedOut,
            RequestOutcome::Cancelled => PendingState::Cancelled,
            RequestOutcome::UnknownClient
            | RequestOutcome::TransmissionFailed
            | RequestOutcome::InternalError(_) => PendingState::SendFailed,
        }
    }

    /// Time between registration and termination.
    pub fn elapsed(&self) -> Duration {
        self.completed_at.saturating_sub(self.sent_at)
    }
}

struct PendingEntry {
    destination: NodeId,
    sender: oneshot::Sender<RequestOutcome>,
}

/// Removes a pending entry when the waiting future goes away.
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, PendingEntry>,
    request_id: RequestId,
}

impl PendingGuard<'_> {
    /// Remove the entry. `true` if this call terminated the request.
    fn terminate(&self) -> bool {
        self.pending.remove(&self.request_id).is_some()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Tracks requests awaiting a reply.
pub struct CorrelationEngine {
    dispatcher: Arc<Dispatcher>,
    pending: DashMap<RequestId, PendingEntry>,
    ids: RequestIdFactory,
    time: Arc<dyn TimeProvider>,
    observers: ObserverList,
}

impl CorrelationEngine {
    /// Create an engine sending through `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>, time: Arc<dyn TimeProvider>, observers: ObserverList) -> Self {
        Self {
            dispatcher,
            pending: DashMap::new(),
            ids: RequestIdFactory::new(),
            time,
            observers,
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `request_id` is awaiting a reply.
    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    fn register_pending(
        &self,
        request_id: &RequestId,
        destination: &NodeId,
    ) -> Result<oneshot::Receiver<RequestOutcome>, GatewayError> {
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => Err(GatewayError::DuplicateRequestId(request_id.clone())),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingEntry {
                    destination: destination.clone(),
                    sender,
                });
                Ok(receiver)
            }
        }
    }

    fn request(&self, destination: &NodeId, action: &str, payload: Payload) -> Envelope {
        Envelope::Request(RequestEnvelope {
            request_id: self.ids.next_id(),
            action: action.to_string(),
            destination: destination.clone(),
            network_path: NetworkPath::new(),
            networking_mode: NetworkingMode::Standard,
            payload,
        })
    }

    /// Send a request without tracking a reply.
    ///
    /// Encoding failures are reported as [`SendResult::TransmissionFailed`].
    pub async fn send_and_forget(&self, destination: &NodeId, action: &str, payload: Payload) -> SendResult {
        let envelope = self.request(destination, action, payload);
        match self.dispatcher.send(destination, &envelope).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(%destination, action, error = %e, "failed to encode request");
                SendResult::TransmissionFailed
            }
        }
    }

    /// Send a request and wait for its reply, the deadline or `cancel`.
    ///
    /// Send failures terminate immediately with
    /// [`RequestOutcome::UnknownClient`] or
    /// [`RequestOutcome::TransmissionFailed`] without waiting for the
    /// deadline. The deadline is fixed before the frame is written, so time
    /// spent in the write counts against `timeout`. Cancellation removes the
    /// pending entry; a reply arriving afterwards is dropped.
    pub async fn send_and_wait(
        &self,
        destination: &NodeId,
        action: &str,
        payload: Payload,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> PendingRequest {
        let envelope = self.request(destination, action, payload);
        let request_id = envelope.request_id().clone();
        let sent_at = self.time.now();
        let deadline = sent_at + timeout;

        let mut receiver = match self.register_pending(&request_id, destination) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!(%destination, request_id = %request_id, error = %e, "request id collision");
                return PendingRequest {
                    request_id,
                    destination: destination.clone(),
                    action: action.to_string(),
                    sent_at,
                    deadline,
                    completed_at: self.time.now(),
                    outcome: RequestOutcome::InternalError(e.to_string()),
                };
            }
        };
        let guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let outcome = match self.dispatcher.send(destination, &envelope).await {
            Ok(SendResult::Success) => {
                let remaining = deadline.saturating_sub(self.time.now());
                let cancelled = async {
                    match cancel {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    reply = &mut receiver => reply.unwrap_or_else(|_| {
                        RequestOutcome::InternalError("reply channel closed".to_string())
                    }),
                    _ = self.time.sleep(remaining) => {
                        if guard.terminate() {
                            RequestOutcome::Timeout
                        } else {
                            Self::raced_reply(&mut receiver).await
                        }
                    }
                    _ = cancelled => {
                        if guard.terminate() {
                            RequestOutcome::Cancelled
                        } else {
                            Self::raced_reply(&mut receiver).await
                        }
                    }
                }
            }
            Ok(failed) => {
                guard.terminate();
                RequestOutcome::from(failed)
            }
            Err(e) => {
                guard.terminate();
                RequestOutcome::InternalError(e.to_string())
            }
        };
        drop(guard);

        let completed_at = self.time.now();
        tracing::debug!(
            %destination,
            request_id = %request_id,
            action,
            outcome = ?outcome,
            elapsed = ?completed_at.saturating_sub(sent_at),
            "request terminated"
        );

        PendingRequest {
            request_id,
            destination: destination.clone(),
            action: action.to_string(),
            sent_at,
            deadline,
            completed_at,
            outcome,
        }
    }

    // The entry was removed by a reply that is already on its way.
    async fn raced_reply(receiver: &mut oneshot::Receiver<RequestOutcome>) -> RequestOutcome {
        receiver
            .await
            .unwrap_or_else(|_| RequestOutcome::InternalError("reply channel closed".to_string()))
    }

    /// Match an inbound response or error to its pending request.
    ///
    /// Returns `true` if a waiting request was terminated. Unmatched replies,
    /// including duplicates and replies arriving after a timeout, are
    /// dropped. Requests are ignored.
    pub fn on_inbound_reply(&self, from: &NodeId, envelope: Envelope) -> bool {
        let (request_id, outcome) = match envelope {
            Envelope::Response(response) => (response.request_id, RequestOutcome::Response(response.payload)),
            Envelope::Error(error) => (
                error.request_id,
                RequestOutcome::Error {
                    code: error.code,
                    description: error.description,
                    details: error.details,
                },
            ),
            Envelope::Request(_) => return false,
        };

        match self.pending.remove(&request_id) {
            Some((_, entry)) => {
                if &entry.destination != from {
                    tracing::debug!(
                        node_id = %from,
                        destination = %entry.destination,
                        request_id = %request_id,
                        "reply relayed by another node"
                    );
                }
                // The waiter may have been dropped; nothing left to do then.
                let _ = entry.sender.send(outcome);
                true
            }
            None => {
                tracing::debug!(node_id = %from, request_id = %request_id, "dropping unmatched reply");
                self.observers.notify(&GatewayEvent::ReplyUnmatched {
                    node_id: from.clone(),
                    request_id,
                });
                false
            }
        }
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("pending", &self.pending.len())
            .finish()
    }
}
