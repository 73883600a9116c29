/// In-process cloud node
///
/// Routes frames between clients of the same process the way a cloud node
/// routes them between vessels: broadcasts fan out to every other connected
/// client, requests go to their target, responses back to the requester.
/// Useful for tests and for wiring several clients together without sockets.
///
/// Positions come from keep-alives and broadcasts. A filtered broadcast skips
/// receivers that never reported one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{CloseReason, TransportError};
use crate::event::TransportEvent;
use crate::model::{MaritimeId, PositionTime};
use crate::packet::{
    CorrelationId, FailureKind, Frame, RemoteFailure, ResponseFrame, ResponseOutcome,
};
use crate::transport::{InboundEvents, Transport};

struct Session {
    session_id: u64,
    sender: mpsc::UnboundedSender<TransportEvent>,
    position: Option<PositionTime>,
}

struct NodeInner {
    sessions: DashMap<MaritimeId, Session>,
    /// Service name -> providers in registration order
    services: DashMap<String, Vec<MaritimeId>>,
    /// (requester, correlation id) -> target of requests awaiting a response
    in_flight: DashMap<(MaritimeId, CorrelationId), MaritimeId>,
    keep_alive_acks: AtomicBool,
    next_session: AtomicU64,
}

/// A cloud node living in this process
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl LocalNode {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NodeInner {
                sessions: DashMap::new(),
                services: DashMap::new(),
                in_flight: DashMap::new(),
                keep_alive_acks: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Transport for one client of this node
    pub fn transport(&self) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node: self.inner.clone(),
            session: Mutex::new(None),
        })
    }

    pub fn connected_clients(&self) -> Vec<MaritimeId> {
        self.inner.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_connected(&self, id: &MaritimeId) -> bool {
        self.inner.sessions.contains_key(id)
    }

    /// Providers currently registered for `service`
    pub fn providers(&self, service: &str) -> Vec<MaritimeId> {
        self.inner
            .services
            .get(service)
            .map(|providers| providers.value().clone())
            .unwrap_or_default()
    }

    /// Last position a connected client reported
    pub fn position_of(&self, id: &MaritimeId) -> Option<PositionTime> {
        self.inner.sessions.get(id).and_then(|session| session.position)
    }

    /// Whether keep-alives are acknowledged. Turning this off makes clients
    /// report their connection as unhealthy.
    pub fn set_keep_alive_acks(&self, enabled: bool) {
        self.inner.keep_alive_acks.store(enabled, Ordering::SeqCst);
    }

    /// Drops a client's connection as if the network failed
    pub fn kick(&self, id: &MaritimeId) -> bool {
        self.inner.remove_session(id, None, CloseReason::Forced)
    }
}

impl Default for LocalNode {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("sessions", &self.inner.sessions.len())
            .field("services", &self.inner.services.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl NodeInner {
    fn deliver(&self, to: &MaritimeId, frame: Frame) -> bool {
        let sender = match self.sessions.get(to) {
            Some(session) => session.sender.clone(),
            None => return false,
        };
        sender.send(TransportEvent::Frame(frame)).is_ok()
    }

    fn respond(&self, to: &MaritimeId, correlation_id: CorrelationId, outcome: ResponseOutcome) {
        let response = ResponseFrame {
            correlation_id,
            target: to.clone(),
            outcome,
        };
        if !self.deliver(to, Frame::Response(response)) {
            tracing::debug!("[NODE] response {} for {} dropped, requester gone", correlation_id, to);
        }
    }

    fn route(&self, origin: &MaritimeId, frame: Frame) {
        match frame {
            Frame::Broadcast(envelope) => {
                if let Some(mut session) = self.sessions.get_mut(origin) {
                    session.position = Some(envelope.sender_position);
                }

                let receivers: Vec<_> = self
                    .sessions
                    .iter()
                    .filter(|entry| entry.key() != origin)
                    .map(|entry| (entry.key().clone(), entry.sender.clone(), entry.position))
                    .collect();

                let mut delivered = 0usize;
                for (id, sender, position) in receivers {
                    if let Some(filter) = &envelope.receiver_filter {
                        match position {
                            Some(position) if filter.accepts(&id, &position) => {}
                            _ => continue,
                        }
                    }
                    if sender.send(TransportEvent::Frame(Frame::Broadcast(envelope.clone()))).is_ok() {
                        delivered += 1;
                    }
                }
                tracing::debug!("[NODE] broadcast on {} from {} reached {} clients", envelope.channel, origin, delivered);
            }
            Frame::BroadcastAck(ack) => {
                let origin_of_broadcast = ack.origin.clone();
                self.deliver(&origin_of_broadcast, Frame::BroadcastAck(ack));
            }
            Frame::Request(request) => {
                let target = request.target.clone();
                let correlation_id = request.correlation_id;
                self.in_flight.insert((origin.clone(), correlation_id), target.clone());

                if !self.deliver(&target, Frame::Request(request)) {
                    self.in_flight.remove(&(origin.clone(), correlation_id));
                    self.respond(
                        origin,
                        correlation_id,
                        ResponseOutcome::Failure(RemoteFailure::new(
                            FailureKind::TargetUnavailable,
                            format!("{} is not connected", target),
                        )),
                    );
                }
            }
            Frame::Response(response) => {
                self.in_flight.remove(&(response.target.clone(), response.correlation_id));
                let target = response.target.clone();
                if !self.deliver(&target, Frame::Response(response)) {
                    tracing::debug!("[NODE] response for {} dropped, requester gone", target);
                }
            }
            Frame::RegisterService { correlation_id, service } => {
                let mut providers = self.services.entry(service).or_default();
                if !providers.contains(origin) {
                    providers.push(origin.clone());
                }
                drop(providers);
                self.respond(origin, correlation_id, ResponseOutcome::Success(Bytes::from_static(b"null")));
            }
            Frame::DeregisterService { service } => {
                if let Some(mut providers) = self.services.get_mut(&service) {
                    providers.retain(|id| id != origin);
                }
                self.services.remove_if(&service, |_, providers| providers.is_empty());
            }
            Frame::Locate { correlation_id, service, limit } => {
                let found: Vec<MaritimeId> = self
                    .services
                    .get(&service)
                    .map(|providers| {
                        providers
                            .iter()
                            .filter(|id| *id != origin)
                            .take(limit)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();

                let outcome = match serde_json::to_vec(&found) {
                    Ok(payload) => ResponseOutcome::Success(Bytes::from(payload)),
                    Err(e) => ResponseOutcome::Failure(RemoteFailure::new(FailureKind::Remote, e.to_string())),
                };
                self.respond(origin, correlation_id, outcome);
            }
            Frame::KeepAlive { position } => {
                if let Some(mut session) = self.sessions.get_mut(origin) {
                    session.position = Some(position);
                }
                if self.keep_alive_acks.load(Ordering::SeqCst) {
                    self.deliver(origin, Frame::KeepAliveAck);
                }
            }
            Frame::KeepAliveAck => {}
        }
    }

    /// Removes a session, its registrations and its in-flight requests
    fn remove_session(&self, id: &MaritimeId, session_id: Option<u64>, reason: CloseReason) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, session| session_id.map_or(true, |sid| sid == session.session_id));
        let (_, session) = match removed {
            Some(removed) => removed,
            None => return false,
        };
        tracing::debug!("[NODE] {} left ({})", id, reason);
        let _ = session.sender.send(TransportEvent::Disconnected { reason });

        for mut providers in self.services.iter_mut() {
            providers.retain(|provider| provider != id);
        }
        self.services.retain(|_, providers| !providers.is_empty());

        let stranded: Vec<(MaritimeId, CorrelationId)> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value() == id || &entry.key().0 == id)
            .map(|entry| entry.key().clone())
            .collect();

        for key in stranded {
            if self.in_flight.remove(&key).is_none() {
                continue;
            }
            let (requester, correlation_id) = key;
            if &requester != id {
                self.respond(
                    &requester,
                    correlation_id,
                    ResponseOutcome::Failure(RemoteFailure::new(
                        FailureKind::TargetUnavailable,
                        format!("{} disconnected before responding", id),
                    )),
                );
            }
        }
        true
    }
}

/// One client's connection to a [`LocalNode`]
pub struct LocalTransport {
    node: Arc<NodeInner>,
    session: Mutex<Option<(MaritimeId, u64)>>,
}

impl LocalTransport {
    fn current_session(&self) -> Result<MaritimeId, TransportError> {
        let (id, session_id) = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| TransportError::connection_error("Not connected", true))?;

        match self.node.sessions.get(&id) {
            Some(session) if session.session_id == session_id => Ok(id),
            _ => Err(TransportError::connection_error("Connection lost", true)),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, client_id: &MaritimeId, _nodes: &str) -> Result<InboundEvents, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session_id = self.node.next_session.fetch_add(1, Ordering::Relaxed);

        match self.node.sessions.entry(client_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::connection_error(
                    format!("{} is already connected", client_id),
                    false,
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(Session {
                    session_id,
                    sender,
                    position: None,
                });
            }
        }

        tracing::debug!("[NODE] {} joined", client_id);
        *self.session.lock() = Some((client_id.clone(), session_id));
        Ok(receiver)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let origin = self.current_session()?;
        self.node.route(&origin, frame);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = self.session.lock().take();
        if let Some((id, session_id)) = session {
            self.node.remove_session(&id, Some(session_id), CloseReason::Normal);
        }
        Ok(())
    }
}
