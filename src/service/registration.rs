/// Inbound service registrations
///
/// Each service name has at most one active callback per client. Requests
/// for a registered service are handed to its callback together with an
/// [`InvocationContext`], through which the callback answers exactly once,
/// either right away or later from another task.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::ClientError;
use crate::message::ServiceMessage;
use crate::model::MaritimeId;
use crate::packet::{CorrelationId, FailureKind, Frame, RemoteFailure, RequestFrame, ResponseOutcome};
use crate::transport::ConnectionManager;

/// Handles invocations of a locally registered service
pub trait InvocationCallback<S: ServiceMessage>: Send + Sync + 'static {
    fn process(&self, message: S, context: InvocationContext<S::Reply>);
}

impl<S, F> InvocationCallback<S> for F
where
    S: ServiceMessage,
    F: Fn(S, InvocationContext<S::Reply>) + Send + Sync + 'static,
{
    fn process(&self, message: S, context: InvocationContext<S::Reply>) {
        self(message, context)
    }
}

/// Sends the single response of one inbound request
pub(crate) struct Responder {
    correlation_id: CorrelationId,
    caller: MaritimeId,
    service: String,
    connection: Weak<ConnectionManager>,
}

impl Responder {
    pub(crate) fn new(request: &RequestFrame, connection: Weak<ConnectionManager>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            caller: request.origin.clone(),
            service: request.service.clone(),
            connection,
        }
    }

    pub(crate) fn send(self, outcome: ResponseOutcome) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let response = crate::packet::ResponseFrame {
            correlation_id: self.correlation_id,
            target: self.caller,
            outcome,
        };
        if let Err(e) = connection.send_detached(Frame::Response(response)) {
            tracing::debug!("[RESPOND] reply to {} for {} dropped: {}", self.correlation_id, self.service, e);
        }
    }

    pub(crate) fn fail(self, kind: FailureKind, message: impl Into<String>) {
        self.send(ResponseOutcome::Failure(RemoteFailure::new(kind, message)))
    }
}

/// Completion handle passed to a service callback
///
/// Consumed by [`complete`](Self::complete) or [`fail`](Self::fail). A
/// context dropped without either reports a failure to the caller, so every
/// inbound request gets exactly one answer.
pub struct InvocationContext<R> {
    caller: MaritimeId,
    responder: Option<Responder>,
    _marker: PhantomData<fn(R)>,
}

impl<R> InvocationContext<R> {
    pub(crate) fn new(responder: Responder) -> Self {
        Self {
            caller: responder.caller.clone(),
            responder: Some(responder),
            _marker: PhantomData,
        }
    }

    /// Identity of the invoking client
    pub fn caller(&self) -> &MaritimeId {
        &self.caller
    }

    /// Reports failure to the caller
    pub fn fail(mut self, message: impl Into<String>) {
        if let Some(responder) = self.responder.take() {
            responder.fail(FailureKind::Remote, message);
        }
    }
}

impl<R: Serialize> InvocationContext<R> {
    /// Replies to the caller
    pub fn complete(mut self, reply: R) {
        let Some(responder) = self.responder.take() else {
            return;
        };
        match serde_json::to_vec(&reply) {
            Ok(payload) => responder.send(ResponseOutcome::Success(Bytes::from(payload))),
            Err(e) => responder.fail(FailureKind::Remote, format!("reply could not be encoded: {}", e)),
        }
    }
}

impl<R> Drop for InvocationContext<R> {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            tracing::warn!("[RESPOND] {} finished without replying", responder.service);
            responder.fail(FailureKind::Remote, "service callback finished without replying");
        }
    }
}

impl<R> std::fmt::Debug for InvocationContext<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("caller", &self.caller)
            .field("answered", &self.responder.is_none())
            .finish()
    }
}

pub(crate) type RequestHandler = Arc<dyn Fn(RequestFrame, Responder) + Send + Sync>;

/// A service hosted by this client
pub(crate) struct RegisteredService {
    service: &'static str,
    handler: RequestHandler,
    active: AtomicBool,
    /// Whether the node acknowledged the current announcement
    announced: watch::Sender<bool>,
}

impl RegisteredService {
    pub(crate) fn service(&self) -> &'static str {
        self.service
    }

    pub(crate) fn handler(&self) -> RequestHandler {
        self.handler.clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn is_announced(&self) -> bool {
        *self.announced.borrow()
    }

    pub(crate) fn set_announced(&self, announced: bool) {
        self.announced.send_replace(announced);
    }
}

/// Active services by name
pub struct ServiceRegistry {
    services: DashMap<&'static str, Arc<RegisteredService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, service: &'static str, handler: RequestHandler) -> Result<Arc<RegisteredService>, ClientError> {
        match self.services.entry(service) {
            Entry::Occupied(_) => Err(ClientError::DuplicateRegistration {
                service: service.to_string(),
            }),
            Entry::Vacant(slot) => {
                let (announced, _) = watch::channel(false);
                let registered = Arc::new(RegisteredService {
                    service,
                    handler,
                    active: AtomicBool::new(true),
                    announced,
                });
                slot.insert(registered.clone());
                tracing::info!("[SERVICE] registered {}", service);
                Ok(registered)
            }
        }
    }

    /// Removes the registration. Returns false if it was already removed.
    pub(crate) fn deregister(&self, registered: &Arc<RegisteredService>) -> bool {
        if !registered.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.services
            .remove_if(registered.service, |_, current| Arc::ptr_eq(current, registered));
        tracing::info!("[SERVICE] deregistered {}", registered.service);
        true
    }

    pub(crate) fn find(&self, service: &str) -> Option<Arc<RegisteredService>> {
        self.services
            .get(service)
            .map(|entry| entry.value().clone())
            .filter(|registered| registered.is_active())
    }

    pub(crate) fn active(&self) -> Vec<Arc<RegisteredService>> {
        self.services
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|registered| registered.is_active())
            .collect()
    }

    /// Forgets every node acknowledgment after the connection dropped
    pub(crate) fn mark_unannounced(&self) {
        for entry in self.services.iter() {
            entry.value().set_announced(false);
        }
    }

    /// Deactivates and removes every registration
    pub(crate) fn deactivate_all(&self) -> usize {
        let names: Vec<&'static str> = self.services.iter().map(|entry| *entry.key()).collect();
        names
            .into_iter()
            .filter_map(|name| self.services.remove(name))
            .filter(|(_, registered)| registered.active.swap(false, Ordering::SeqCst))
            .count()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.find(service).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a locally registered service
pub struct ServiceRegistration {
    registered: Arc<RegisteredService>,
    registry: Weak<ServiceRegistry>,
    connection: Weak<ConnectionManager>,
}

impl ServiceRegistration {
    pub(crate) fn new(
        registered: Arc<RegisteredService>,
        registry: Weak<ServiceRegistry>,
        connection: Weak<ConnectionManager>,
    ) -> Self {
        Self {
            registered,
            registry,
            connection,
        }
    }

    pub fn service_name(&self) -> &'static str {
        self.registered.service
    }

    pub fn is_active(&self) -> bool {
        self.registered.is_active()
    }

    /// Stops accepting invocations. Calling it again has no effect.
    pub fn cancel(&self) {
        let Some(registry) = self.registry.upgrade() else {
            self.registered.active.store(false, Ordering::SeqCst);
            return;
        };
        if !registry.deregister(&self.registered) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            let frame = Frame::DeregisterService {
                service: self.registered.service.to_string(),
            };
            if let Err(e) = connection.send_detached(frame) {
                tracing::debug!("[SERVICE] deregistration of {} not sent: {}", self.registered.service, e);
            }
        }
    }

    /// Waits until the node acknowledged the registration
    ///
    /// Returns false on timeout or if the registration was cancelled.
    pub async fn await_registered(&self, timeout: Duration) -> bool {
        let mut announced = self.registered.announced.subscribe();
        let registered = self.registered.clone();
        let wait = announced.wait_for(move |acked| *acked || !registered.is_active());
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => self.registered.is_active() && self.registered.is_announced(),
            _ => false,
        };
        result
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("service", &self.registered.service)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Builds the type erased handler decoding requests for `callback`
pub(crate) fn request_handler<S, C>(callback: C) -> RequestHandler
where
    S: ServiceMessage,
    C: InvocationCallback<S>,
{
    Arc::new(move |request: RequestFrame, responder: Responder| {
        match serde_json::from_slice::<S>(&request.payload) {
            Ok(message) => callback.process(message, InvocationContext::new(responder)),
            Err(e) => {
                tracing::warn!("[SERVICE] undecodable {} request from {}: {}", request.service, request.origin, e);
                responder.fail(FailureKind::Remote, format!("request could not be decoded: {}", e));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> RequestHandler {
        Arc::new(|_request: RequestFrame, _responder: Responder| {})
    }

    #[test]
    fn second_registration_of_a_service_is_rejected() {
        let registry = ServiceRegistry::new();
        registry.register("test.Echo", noop_handler()).unwrap();

        let err = registry.register("test.Echo", noop_handler()).err().unwrap();
        assert!(matches!(err, ClientError::DuplicateRegistration { ref service } if service == "test.Echo"));
    }

    #[test]
    fn cancelled_registration_frees_the_name() {
        let registry = Arc::new(ServiceRegistry::new());
        let registered = registry.register("test.Echo", noop_handler()).unwrap();
        let handle = ServiceRegistration::new(registered, Arc::downgrade(&registry), Weak::new());

        handle.cancel();
        handle.cancel();
        assert!(!handle.is_active());
        assert!(registry.find("test.Echo").is_none());
        assert!(registry.register("test.Echo", noop_handler()).is_ok());
    }

    #[test]
    fn stale_handle_cannot_remove_a_newer_registration() {
        let registry = Arc::new(ServiceRegistry::new());
        let old = registry.register("test.Echo", noop_handler()).unwrap();
        assert!(registry.deregister(&old));

        let current = registry.register("test.Echo", noop_handler()).unwrap();
        assert!(!registry.deregister(&old));
        assert!(Arc::ptr_eq(&registry.find("test.Echo").unwrap(), &current));
    }

    #[test]
    fn deactivate_all_empties_the_registry() {
        let registry = ServiceRegistry::new();
        let a = registry.register("test.A", noop_handler()).unwrap();
        registry.register("test.B", noop_handler()).unwrap();

        assert_eq!(registry.deactivate_all(), 2);
        assert!(registry.is_empty());
        assert!(!a.is_active());
    }

    #[tokio::test]
    async fn await_registered_follows_the_acknowledgment() {
        let registry = Arc::new(ServiceRegistry::new());
        let registered = registry.register("test.Echo", noop_handler()).unwrap();
        let handle = ServiceRegistration::new(registered.clone(), Arc::downgrade(&registry), Weak::new());

        assert!(!handle.await_registered(Duration::from_millis(20)).await);
        registered.set_announced(true);
        assert!(handle.await_registered(Duration::from_millis(20)).await);
    }
}
