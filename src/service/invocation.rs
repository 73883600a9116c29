/// Outbound invocation tracking
///
/// Every correlated request the client sends (service invocations, service
/// announcements, locate queries) gets a [`PendingInvocation`] keyed by a
/// fresh correlation id. The first resolution wins: a reply, a timeout, the
/// connection dropping or the client closing. Anything arriving later finds
/// no entry and is discarded.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use crate::error::ClientError;
use crate::packet::{CorrelationId, FailureKind, IdSequence, RemoteFailure, ResponseFrame, ResponseOutcome};

pub(crate) type Outcome = Result<Bytes, ClientError>;

/// An outbound request awaiting its single resolution
pub struct PendingInvocation {
    correlation_id: CorrelationId,
    operation: String,
    created_at: Instant,
    slot: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl PendingInvocation {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Service (or node operation) the request addresses
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Applies the outcome. A second resolution is rejected.
    pub(crate) fn resolve(&self, outcome: Outcome) -> Result<(), ClientError> {
        let sender = self.slot.lock().take().ok_or(ClientError::AlreadyResolved {
            correlation_id: self.correlation_id,
        })?;
        // the future may have been dropped already
        let _ = sender.send(outcome);
        Ok(())
    }
}

impl std::fmt::Debug for PendingInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInvocation")
            .field("correlation_id", &self.correlation_id)
            .field("operation", &self.operation)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Pending outbound requests by correlation id
pub struct InvocationRegistry {
    pending: DashMap<CorrelationId, Arc<PendingInvocation>>,
    ids: IdSequence,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self {
            pending: DashMap::with_capacity(64),
            ids: IdSequence::new(),
        }
    }

    /// Registers a new pending invocation and returns the future resolving it
    pub(crate) fn register<T>(self: &Arc<Self>, operation: &str, timeout: Duration) -> (CorrelationId, ConnectionFuture<T>)
    where
        T: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();
        let pending = loop {
            let correlation_id = CorrelationId::new(self.ids.next());
            if let Entry::Vacant(slot) = self.pending.entry(correlation_id) {
                let pending = Arc::new(PendingInvocation {
                    correlation_id,
                    operation: operation.to_string(),
                    created_at: Instant::now(),
                    slot: Mutex::new(Some(tx)),
                });
                slot.insert(pending.clone());
                break pending;
            }
        };

        tracing::debug!("[REGISTER] invocation registered: {} ({})", pending.correlation_id, operation);
        let future = ConnectionFuture::new(pending.correlation_id, operation, rx, Arc::downgrade(self), timeout);
        (pending.correlation_id, future)
    }

    /// Resolves and removes the invocation. Returns false if it was already
    /// resolved or never existed.
    pub fn complete(&self, correlation_id: CorrelationId, outcome: Outcome) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => match pending.resolve(outcome) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("[COMPLETE] {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Resolves the invocation from a response frame
    pub fn complete_response(&self, response: ResponseFrame) -> bool {
        let operation = match self.pending.get(&response.correlation_id) {
            Some(pending) => pending.operation.clone(),
            None => {
                tracing::warn!(
                    "[COMPLETE] no pending invocation {}, reply discarded",
                    response.correlation_id
                );
                return false;
            }
        };

        let outcome = match response.outcome {
            ResponseOutcome::Success(payload) => Ok(payload),
            ResponseOutcome::Failure(failure) => Err(remote_error(&operation, failure)),
        };
        self.complete(response.correlation_id, outcome)
    }

    pub(crate) fn expire(&self, correlation_id: CorrelationId, timeout: Duration) -> bool {
        let operation = match self.pending.get(&correlation_id) {
            Some(pending) => pending.operation.clone(),
            None => return false,
        };
        tracing::debug!("[TIMEOUT] invocation {} ({}) timed out", correlation_id, operation);
        self.complete(correlation_id, Err(ClientError::timeout_error(operation, timeout)))
    }

    /// Forgets an invocation whose future was dropped
    pub(crate) fn abandon(&self, correlation_id: CorrelationId) {
        self.pending.remove(&correlation_id);
    }

    /// Resolves every outstanding invocation with `error`
    pub fn fail_all(&self, error: ClientError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.complete(*id, Err(error.clone())))
            .count()
    }

    pub fn get(&self, correlation_id: CorrelationId) -> Option<Arc<PendingInvocation>> {
        self.pending.get(&correlation_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for InvocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remote_error(operation: &str, failure: RemoteFailure) -> ClientError {
    match failure.kind {
        FailureKind::ServiceNotFound => ClientError::ServiceNotFound {
            service: operation.to_string(),
        },
        FailureKind::Remote => ClientError::Remote {
            service: operation.to_string(),
            message: failure.message,
        },
        FailureKind::TargetUnavailable => ClientError::Disconnected { reason: failure.message },
    }
}

fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ClientError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Result of a correlated request
///
/// Resolves exactly once with the decoded reply, the remote failure, a
/// timeout or a connection failure. The timeout runs from creation, is
/// enforced while the future is polled, and dropping the future forgets the
/// invocation.
#[must_use = "futures do nothing unless polled"]
pub struct ConnectionFuture<T> {
    correlation_id: CorrelationId,
    operation: String,
    receiver: oneshot::Receiver<Outcome>,
    registry: Weak<InvocationRegistry>,
    created_at: Instant,
    timeout: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    decode: fn(&[u8]) -> Result<T, ClientError>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ConnectionFuture<T> {
    fn new(
        correlation_id: CorrelationId,
        operation: &str,
        receiver: oneshot::Receiver<Outcome>,
        registry: Weak<InvocationRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            correlation_id,
            operation: operation.to_string(),
            receiver,
            registry,
            created_at: Instant::now(),
            timeout,
            sleep: None,
            decode: decode_json::<T>,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<T> ConnectionFuture<T> {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Overrides the reply window, still measured from creation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.sleep = None;
        self
    }

    fn finish(&mut self, outcome: Result<Outcome, oneshot::error::RecvError>) -> Result<T, ClientError> {
        self.done = true;
        match outcome {
            Ok(Ok(payload)) => (self.decode)(&payload),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }
}

impl<T> Future for ConnectionFuture<T> {
    type Output = Result<T, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Poll::Ready(outcome) = Pin::new(&mut this.receiver).poll(cx) {
            return Poll::Ready(this.finish(outcome));
        }

        let Some(deadline) = this.created_at.checked_add(this.timeout) else {
            // past what the clock can represent, only a resolution ends this
            return Poll::Pending;
        };
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        if let Some(registry) = this.registry.upgrade() {
            registry.expire(this.correlation_id, this.timeout);
        }
        // either the timeout or a racing resolution is in the slot now
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(outcome) => Poll::Ready(this.finish(outcome)),
            Poll::Pending => {
                this.done = true;
                Poll::Ready(Err(ClientError::timeout_error(this.operation.clone(), this.timeout)))
            }
        }
    }
}

impl<T> Drop for ConnectionFuture<T> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(registry) = self.registry.upgrade() {
                registry.abandon(self.correlation_id);
            }
        }
    }
}

impl<T> std::fmt::Debug for ConnectionFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFuture")
            .field("correlation_id", &self.correlation_id)
            .field("operation", &self.operation)
            .field("timeout", &self.timeout)
            .finish()
    }
}
