/// Maritime cloud client
///
/// [`MaritimeCloudClient`] is the public face of one client identity. It
/// wires the type registry, the broadcast router and both service registries
/// to a [`ConnectionManager`] driving the transport.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::broadcast::{BroadcastFuture, BroadcastListener, BroadcastRouter, BroadcastSubscription};
use crate::config::{BroadcastOptions, ClientConfiguration};
use crate::error::{ClientError, CloseReason};
use crate::event::ConnectionListener;
use crate::message::{BroadcastMessage, ServiceInitiationPoint, ServiceMessage};
use crate::model::MaritimeId;
use crate::packet::{BroadcastAck, BroadcastEnvelope, CorrelationId, FailureKind, Frame, RequestFrame};
use crate::registry::MessageTypeRegistry;
use crate::service::registration::{request_handler, RegisteredService, Responder};
use crate::service::{
    ConnectionFuture, InvocationCallback, InvocationRegistry, ServiceLocator, ServiceRegistration, ServiceRegistry,
};
use crate::stream::ConnectionEventStream;
use crate::transport::connection::InboundHandler;
use crate::transport::{ConnectionManager, ConnectionState, Transport};

/// Shared state behind a client and the handles it gives out
pub(crate) struct ClientInner {
    id: MaritimeId,
    broadcast_defaults: BroadcastOptions,
    types: Arc<MessageTypeRegistry>,
    connection: Arc<ConnectionManager>,
    broadcasts: Arc<BroadcastRouter>,
    invocations: Arc<InvocationRegistry>,
    services: Arc<ServiceRegistry>,
}

impl ClientInner {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.connection.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    pub(crate) fn invoke<S: ServiceMessage>(
        &self,
        target: &MaritimeId,
        message: &S,
    ) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        self.ensure_open()?;
        if target.is_empty() {
            return Err(ClientError::NullArgument { argument: "target" });
        }
        let descriptor = self.types.resolve_service::<S>()?;
        let payload = serde_json::to_vec(message)?;

        tracing::debug!("[INVOKE] {} -> {} {}.{}", self.id, target, descriptor.service(), descriptor.message());
        self.send_correlated(descriptor.service(), |correlation_id| {
            Frame::Request(RequestFrame {
                correlation_id,
                origin: self.id.clone(),
                target: target.clone(),
                service: descriptor.service().to_string(),
                message: descriptor.message().to_string(),
                payload: payload.into(),
            })
        })
    }

    pub(crate) fn locate<S: ServiceMessage>(&self, limit: usize) -> Result<ConnectionFuture<Vec<MaritimeId>>, ClientError> {
        self.ensure_open()?;
        let descriptor = self.types.resolve_service::<S>()?;
        tracing::debug!("[LOCATE] {} looking up {} (limit {})", self.id, descriptor.service(), limit);
        self.send_correlated(descriptor.service(), |correlation_id| Frame::Locate {
            correlation_id,
            service: descriptor.service().to_string(),
            limit,
        })
    }

    /// Registers a pending invocation and sends the frame carrying its id
    ///
    /// A frame the transport refuses resolves the invocation with the
    /// transport's error.
    fn send_correlated<T, F>(&self, operation: &str, frame: F) -> Result<ConnectionFuture<T>, ClientError>
    where
        T: DeserializeOwned,
        F: FnOnce(CorrelationId) -> Frame,
    {
        let timeout = self.connection.settings().invocation_timeout;
        let (correlation_id, future) = self.invocations.register::<T>(operation, timeout);
        let accepted = self.connection.send(frame(correlation_id))?;

        let invocations = Arc::downgrade(&self.invocations);
        self.connection.spawn_tracked(async move {
            let result = accepted.await.unwrap_or(Err(ClientError::ConnectionClosed));
            if let (Err(e), Some(invocations)) = (result, invocations.upgrade()) {
                invocations.complete(correlation_id, Err(e));
            }
        });
        Ok(future)
    }

    /// Announces a local service to the node
    fn announce(&self, registered: &Arc<RegisteredService>) {
        let service = registered.service();
        let ack = match self.send_correlated::<(), _>(service, |correlation_id| Frame::RegisterService {
            correlation_id,
            service: service.to_string(),
        }) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::debug!("[SERVICE] announcement of {} not sent: {}", service, e);
                return;
            }
        };

        let registered = Arc::downgrade(registered);
        self.connection.spawn_tracked(async move {
            let result = ack.await;
            let Some(registered) = registered.upgrade() else {
                return;
            };
            match result {
                Ok(()) => {
                    tracing::debug!("[SERVICE] node acknowledged {}", registered.service());
                    registered.set_announced(true);
                }
                Err(e) => tracing::warn!("[SERVICE] node did not acknowledge {}: {}", registered.service(), e),
            }
        });
    }

    fn dispatch_broadcast(&self, envelope: BroadcastEnvelope) {
        let delivered = self.broadcasts.dispatch(&envelope);
        if !envelope.ack_requested || delivered == 0 {
            return;
        }

        let Ok(receiver_position) = catch_unwind(AssertUnwindSafe(|| self.connection.current_position())) else {
            tracing::warn!("[BROADCAST] position supplier panicked, ack for {} not sent", envelope.broadcast_id);
            return;
        };
        let ack = BroadcastAck {
            broadcast_id: envelope.broadcast_id,
            origin: envelope.sender,
            receiver: self.id.clone(),
            receiver_position,
        };
        if let Err(e) = self.connection.send_detached(Frame::BroadcastAck(ack)) {
            tracing::debug!("[BROADCAST] ack for {} not sent: {}", envelope.broadcast_id, e);
        }
    }

    fn dispatch_request(&self, request: RequestFrame) {
        let responder = Responder::new(&request, Arc::downgrade(&self.connection));
        let Some(registered) = self.services.find(&request.service) else {
            tracing::debug!("[DISPATCH] {} has no service {} (from {})", self.id, request.service, request.origin);
            let message = format!("{} does not provide {}", self.id, request.service);
            responder.fail(FailureKind::ServiceNotFound, message);
            return;
        };

        tracing::debug!(
            "[DISPATCH] {} {}.{} from {}",
            request.correlation_id,
            request.service,
            request.message,
            request.origin
        );
        let handler = registered.handler();
        self.connection.spawn_tracked(async move {
            let service = request.service.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(request, responder))).is_err() {
                tracing::warn!("[DISPATCH] callback of {} panicked", service);
            }
        });
    }

    fn close(&self) -> bool {
        self.connection.close_with(|| {
            let services = self.services.deactivate_all();
            let invocations = self.invocations.fail_all(ClientError::ConnectionClosed);
            let subscriptions = self.broadcasts.clear();
            tracing::info!(
                "[CLOSE] {} closing: {} services deregistered, {} invocations failed, {} subscriptions cancelled",
                self.id,
                services,
                invocations,
                subscriptions
            );
        })
    }
}

impl InboundHandler for ClientInner {
    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Broadcast(envelope) => self.dispatch_broadcast(envelope),
            Frame::BroadcastAck(ack) => self.broadcasts.deliver_ack(ack),
            Frame::Request(request) => self.dispatch_request(request),
            Frame::Response(response) => {
                self.invocations.complete_response(response);
            }
            other => tracing::debug!("[DISPATCH] {} ignoring {} frame", self.id, other.kind()),
        }
    }

    fn connection_lost(&self, reason: &CloseReason) {
        self.services.mark_unannounced();
        let failed = self
            .invocations
            .fail_all(ClientError::Disconnected { reason: reason.to_string() });
        if failed > 0 {
            tracing::warn!("[DISCONNECT] {} failed {} pending invocations: {}", self.id, failed, reason);
        }
    }

    fn connection_established(&self) {
        for registered in self.services.active() {
            if !registered.is_announced() {
                self.announce(&registered);
            }
        }
    }
}

/// A client of the maritime cloud
///
/// Dropping the client closes it.
pub struct MaritimeCloudClient {
    inner: Arc<ClientInner>,
}

impl MaritimeCloudClient {
    pub(crate) fn new(config: ClientConfiguration, transport: Arc<dyn Transport>) -> Result<Self, ClientError> {
        let ClientConfiguration {
            id,
            settings,
            broadcast_defaults,
            position_supplier,
            listeners,
            message_types,
        } = config;
        let id = id.ok_or(ClientError::NullArgument { argument: "id" })?;
        let auto_connect = settings.auto_connect;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClientError::config_error("runtime", "the client must be built inside a tokio runtime"));
        }

        let inner = Arc::new_cyclic(|inner: &Weak<ClientInner>| {
            let handler: Weak<dyn InboundHandler> = inner.clone();
            let connection = ConnectionManager::start(
                id.clone(),
                settings,
                transport,
                position_supplier,
                listeners,
                handler,
            );
            ClientInner {
                id,
                broadcast_defaults,
                types: message_types.clone(),
                broadcasts: Arc::new(BroadcastRouter::new(message_types, connection.clone())),
                connection,
                invocations: Arc::new(InvocationRegistry::new()),
                services: Arc::new(ServiceRegistry::new()),
            }
        });

        tracing::info!("[CLIENT] {} created", inner.id);
        if auto_connect {
            let connection = inner.connection.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.connect().await {
                    tracing::warn!("[CONNECT] automatic connect of {} failed: {}", connection.client_id(), e);
                }
            });
        }
        Ok(Self { inner })
    }

    pub fn client_id(&self) -> &MaritimeId {
        &self.inner.id
    }

    /// Broadcasts `message` with the client's default options
    pub fn broadcast<M: BroadcastMessage>(&self, message: &M) -> Result<BroadcastFuture, ClientError> {
        self.broadcast_with(message, self.inner.broadcast_defaults.clone())
    }

    pub fn broadcast_with<M: BroadcastMessage>(
        &self,
        message: &M,
        options: BroadcastOptions,
    ) -> Result<BroadcastFuture, ClientError> {
        self.inner.ensure_open()?;
        self.inner.broadcasts.broadcast(&self.inner.id, message, &options)
    }

    /// Subscribes to broadcasts of type `M`
    pub fn listen<M, L>(&self, listener: L) -> Result<BroadcastSubscription, ClientError>
    where
        M: BroadcastMessage,
        L: BroadcastListener<M>,
    {
        self.inner.ensure_open()?;
        self.inner.broadcasts.listen::<M, L>(listener)
    }

    /// Invokes the service of `S` on `target`
    pub fn invoke<S: ServiceMessage>(
        &self,
        target: &MaritimeId,
        message: &S,
    ) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        self.inner.invoke(target, message)
    }

    /// Returns a locator for providers of the service `sip` starts
    pub fn locate<S: ServiceMessage>(&self, sip: ServiceInitiationPoint<S>) -> Result<ServiceLocator<S>, ClientError> {
        self.inner.ensure_open()?;
        self.inner.types.resolve_service::<S>()?;
        tracing::debug!("[LOCATE] locator for {}", sip.service_name());
        Ok(ServiceLocator::new(self.inner.clone()))
    }

    /// Hosts the service `sip` starts, answering invocations with `callback`
    pub fn register<S, C>(&self, sip: ServiceInitiationPoint<S>, callback: C) -> Result<ServiceRegistration, ClientError>
    where
        S: ServiceMessage,
        C: InvocationCallback<S>,
    {
        self.inner.ensure_open()?;
        let descriptor = self.inner.types.resolve_service::<S>()?;
        let registered = self
            .inner
            .services
            .register(descriptor.service(), request_handler::<S, C>(callback))?;

        let registration = ServiceRegistration::new(
            registered.clone(),
            Arc::downgrade(&self.inner.services),
            Arc::downgrade(&self.inner.connection),
        );
        // close may have swept the registry before the insert
        if self.inner.connection.is_closed() {
            registration.cancel();
            return Err(ClientError::ConnectionClosed);
        }

        tracing::debug!("[SERVICE] {} hosting {} via {}", self.inner.id, sip.service_name(), sip.message_name());
        self.inner.announce(&registered);
        Ok(registration)
    }

    /// Handle to the underlying connection
    pub fn connection(&self) -> ConnectionHandle {
        ConnectionHandle {
            manager: self.inner.connection.clone(),
        }
    }

    /// Closes the client
    ///
    /// Returns immediately; use [`await_termination`](Self::await_termination)
    /// to wait for the shutdown to finish. Closing again has no effect.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.connection.is_terminated()
    }

    /// Waits until the client terminated or `timeout` elapsed
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.connection.await_termination(timeout).await
    }
}

impl Drop for MaritimeCloudClient {
    fn drop(&mut self) {
        if self.inner.close() {
            tracing::debug!("[CLIENT] {} dropped without close", self.inner.id);
        }
    }
}

impl std::fmt::Debug for MaritimeCloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaritimeCloudClient")
            .field("id", &self.inner.id)
            .field("state", &self.inner.connection.state())
            .finish()
    }
}

/// Connection level view of a client
#[derive(Clone)]
pub struct ConnectionHandle {
    manager: Arc<ConnectionManager>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.manager.connect().await
    }

    /// Drops the connection, keeping the client usable
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.manager.disconnect().await
    }

    pub fn add_listener<L: ConnectionListener>(&self, listener: L) {
        self.manager.add_listener(Arc::new(listener));
    }

    pub fn events(&self) -> ConnectionEventStream {
        self.manager.events()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client_id", self.manager.client_id())
            .field("state", &self.manager.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastMessageHeader;
    use crate::message::Service;
    use crate::service::InvocationContext;
    use crate::transport::LocalNode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        text: String,
    }

    struct Echo;

    impl Service for Echo {
        const NAME: &'static str = "test.Echo";
    }

    impl ServiceMessage for Ping {
        type Service = Echo;
        type Reply = String;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Hello;

    impl BroadcastMessage for Hello {
        const CHANNEL: &'static str = "test.Hello";
    }

    async fn client(node: &LocalNode, id: &str) -> MaritimeCloudClient {
        let client = ClientConfiguration::create(id)
            .auto_connect(false)
            .build(node.transport())
            .unwrap();
        client.connection().connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn operations_after_close_fail_fast() {
        let node = LocalNode::new();
        let client = client(&node, "mmsi://1").await;
        client.close();
        client.close();

        assert!(client.is_closed());
        assert!(matches!(client.broadcast(&Hello), Err(ClientError::ConnectionClosed)));
        assert!(matches!(
            client.listen::<Hello, _>(|_: &BroadcastMessageHeader, _: &Hello| {}),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            client.invoke(&MaritimeId::new("mmsi://2"), &Ping { text: "x".into() }),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            client.register(ServiceInitiationPoint::<Ping>::new(), |_: Ping, _: InvocationContext<String>| {}),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(client.await_termination(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn close_fails_pending_invocations_and_deactivates_services() {
        let node = LocalNode::new();
        let a = client(&node, "mmsi://1").await;
        let b = client(&node, "mmsi://2").await;
        // b never answers
        let registration = b
            .register(ServiceInitiationPoint::<Ping>::new(), |_: Ping, context: InvocationContext<String>| {
                std::mem::forget(context);
            })
            .unwrap();
        let hosted = a
            .register(ServiceInitiationPoint::<Ping>::new(), |_: Ping, context: InvocationContext<String>| {
                context.complete("a".into());
            })
            .unwrap();

        let pending = a.invoke(b.client_id(), &Ping { text: "hi".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close();

        assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
        assert!(!hosted.is_active());
        assert!(registration.is_active());
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let node = LocalNode::new();
        let client = client(&node, "mmsi://1").await;
        assert!(matches!(
            client.invoke(&MaritimeId::new(" "), &Ping { text: "x".into() }),
            Err(ClientError::NullArgument { argument: "target" })
        ));
    }

    #[tokio::test]
    async fn unknown_service_is_reported_by_the_target() {
        let node = LocalNode::new();
        let a = client(&node, "mmsi://1").await;
        let b = client(&node, "mmsi://2").await;

        let err = a.invoke(b.client_id(), &Ping { text: "x".into() }).unwrap().await.unwrap_err();
        assert!(matches!(err, ClientError::ServiceNotFound { ref service } if service == "test.Echo"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let node = LocalNode::new();
        let client = client(&node, "mmsi://1").await;
        let sip = ServiceInitiationPoint::<Ping>::new();
        let first = client
            .register(sip, |_: Ping, context: InvocationContext<String>| context.complete(String::new()))
            .unwrap();
        assert!(first.await_registered(Duration::from_secs(2)).await);

        assert!(matches!(
            client.register(sip, |_: Ping, context: InvocationContext<String>| context.complete(String::new())),
            Err(ClientError::DuplicateRegistration { .. })
        ));
        first.cancel();
        assert!(client
            .register(sip, |_: Ping, context: InvocationContext<String>| context.complete(String::new()))
            .is_ok());
    }
}
