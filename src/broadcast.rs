/// Broadcast router
///
/// Outbound: encodes a typed message into a [`BroadcastEnvelope`] and hands
/// it to the connection, optionally collecting receiver acknowledgments.
///
/// Inbound: decodes each broadcast once and fans it out to every active
/// subscription of its channel. Every subscription owns a queue drained by
/// its own task, so one listener sees messages in arrival order while
/// different listeners run concurrently. A cancelled subscription is
/// checked right before each delivery and never sees another message.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::BroadcastOptions;
use crate::error::ClientError;
use crate::message::BroadcastMessage;
use crate::model::{MaritimeId, PositionTime};
use crate::packet::{BroadcastAck, BroadcastEnvelope, Frame, IdSequence};
use crate::registry::{DecodedMessage, MessageTypeRegistry};
use crate::transport::connection::SendAck;
use crate::transport::ConnectionManager;

/// Metadata of a received broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessageHeader {
    pub broadcast_id: u64,
    pub sender: MaritimeId,
    pub sender_position: PositionTime,
    pub channel: String,
}

/// Receives broadcasts of type `M`
pub trait BroadcastListener<M>: Send + Sync + 'static {
    fn on_message(&self, header: &BroadcastMessageHeader, message: &M);
}

impl<M, F> BroadcastListener<M> for F
where
    F: Fn(&BroadcastMessageHeader, &M) + Send + Sync + 'static,
{
    fn on_message(&self, header: &BroadcastMessageHeader, message: &M) {
        self(header, message)
    }
}

struct Delivery {
    header: BroadcastMessageHeader,
    message: DecodedMessage,
}

struct SubscriptionState {
    id: u64,
    channel: &'static str,
    active: AtomicBool,
}

struct Route {
    state: Arc<SubscriptionState>,
    queue: mpsc::UnboundedSender<Arc<Delivery>>,
}

type AckCallback = Arc<dyn Fn(&BroadcastAck) + Send + Sync>;

/// Acknowledgments collected for one outbound broadcast
struct AckSink {
    /// `None` when the time to live is too long to put on the clock
    expires_at: Option<Instant>,
    inner: Mutex<AckSinkInner>,
}

impl AckSink {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct AckSinkInner {
    received: Vec<BroadcastAck>,
    callbacks: Vec<AckCallback>,
}

pub struct BroadcastRouter {
    types: Arc<MessageTypeRegistry>,
    connection: Arc<ConnectionManager>,
    routes: DashMap<&'static str, Vec<Route>>,
    acks: DashMap<u64, Arc<AckSink>>,
    ids: IdSequence,
}

impl BroadcastRouter {
    pub(crate) fn new(types: Arc<MessageTypeRegistry>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            types,
            connection,
            routes: DashMap::new(),
            acks: DashMap::new(),
            ids: IdSequence::new(),
        }
    }

    /// Subscribes `listener` to the channel of `M`
    pub(crate) fn listen<M, L>(self: &Arc<Self>, listener: L) -> Result<BroadcastSubscription, ClientError>
    where
        M: BroadcastMessage,
        L: BroadcastListener<M>,
    {
        let descriptor = self.types.register_broadcast::<M>()?;
        let state = Arc::new(SubscriptionState {
            id: self.ids.next(),
            channel: descriptor.channel(),
            active: AtomicBool::new(true),
        });
        let (queue, mut deliveries) = mpsc::unbounded_channel::<Arc<Delivery>>();
        self.routes.entry(state.channel).or_default().push(Route {
            state: state.clone(),
            queue,
        });

        let subscription = BroadcastSubscription {
            state: state.clone(),
            router: Arc::downgrade(self),
        };
        // close may have cleared the routes before ours was added
        if self.connection.is_closed() {
            subscription.cancel();
            return Err(ClientError::ConnectionClosed);
        }

        self.connection.spawn_tracked(async move {
            while let Some(delivery) = deliveries.recv().await {
                if !state.active.load(Ordering::SeqCst) {
                    break;
                }
                let Some(message) = delivery.message.downcast_ref::<M>() else {
                    tracing::warn!(
                        "[BROADCAST] dropping message on {}: not a {}",
                        state.channel,
                        std::any::type_name::<M>()
                    );
                    continue;
                };
                if catch_unwind(AssertUnwindSafe(|| listener.on_message(&delivery.header, message))).is_err() {
                    tracing::warn!("[BROADCAST] listener on {} panicked", state.channel);
                }
            }
            tracing::debug!("[BROADCAST] subscription {} on {} finished", state.id, state.channel);
        });

        tracing::debug!("[BROADCAST] listening on {}", descriptor.channel());
        Ok(subscription)
    }

    /// Sends `message` on its channel
    pub(crate) fn broadcast<M: BroadcastMessage>(
        &self,
        sender: &MaritimeId,
        message: &M,
        options: &BroadcastOptions,
    ) -> Result<BroadcastFuture, ClientError> {
        let descriptor = self.types.resolve::<M>()?;
        let payload = Bytes::from(serde_json::to_vec(message)?);
        let broadcast_id = self.ids.next();

        let envelope = BroadcastEnvelope {
            broadcast_id,
            sender: sender.clone(),
            sender_position: self.connection.current_position(),
            channel: descriptor.channel().to_string(),
            payload,
            time_to_live: options.time_to_live,
            radius: options.radius,
            ack_requested: options.receiver_ack_enabled,
            receiver_filter: options.receiver_filter.clone(),
        };

        let sink = if options.receiver_ack_enabled {
            self.prune_acks();
            let sink = Arc::new(AckSink {
                expires_at: Instant::now().checked_add(options.time_to_live),
                inner: Mutex::new(AckSinkInner::default()),
            });
            self.acks.insert(broadcast_id, sink.clone());
            Some(sink)
        } else {
            None
        };

        let accepted = match self.connection.send(Frame::Broadcast(envelope)) {
            Ok(accepted) => accepted,
            Err(e) => {
                self.acks.remove(&broadcast_id);
                return Err(e);
            }
        };

        tracing::debug!("[BROADCAST] {} sent on {}", broadcast_id, descriptor.channel());
        Ok(BroadcastFuture {
            broadcast_id,
            accepted,
            sink,
            connection: Arc::downgrade(&self.connection),
        })
    }

    /// Fans an inbound broadcast out to the channel's subscriptions
    ///
    /// Returns how many subscriptions it was queued for.
    pub(crate) fn dispatch(&self, envelope: &BroadcastEnvelope) -> usize {
        let targets: Vec<mpsc::UnboundedSender<Arc<Delivery>>> = match self.routes.get(envelope.channel.as_str()) {
            Some(routes) => routes
                .iter()
                .filter(|route| route.state.active.load(Ordering::SeqCst))
                .map(|route| route.queue.clone())
                .collect(),
            None => Vec::new(),
        };
        if targets.is_empty() {
            tracing::debug!("[BROADCAST] no listener for {}, dropped", envelope.channel);
            return 0;
        }

        let message = match self.types.decode(&envelope.channel, &envelope.payload) {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::warn!("[BROADCAST] undecodable message on {} from {}: {}", envelope.channel, envelope.sender, e);
                return 0;
            }
            None => {
                tracing::debug!("[BROADCAST] unknown channel {}, dropped", envelope.channel);
                return 0;
            }
        };

        let delivery = Arc::new(Delivery {
            header: BroadcastMessageHeader {
                broadcast_id: envelope.broadcast_id,
                sender: envelope.sender.clone(),
                sender_position: envelope.sender_position,
                channel: envelope.channel.clone(),
            },
            message,
        });
        targets
            .into_iter()
            .filter(|queue| queue.send(delivery.clone()).is_ok())
            .count()
    }

    /// Hands a receiver acknowledgment to the broadcast it belongs to
    pub(crate) fn deliver_ack(&self, ack: BroadcastAck) {
        let Some(sink) = self.acks.get(&ack.broadcast_id).map(|entry| entry.value().clone()) else {
            tracing::debug!("[BROADCAST] ack for unknown broadcast {} from {}", ack.broadcast_id, ack.receiver);
            return;
        };
        if sink.is_expired(Instant::now()) {
            self.acks.remove(&ack.broadcast_id);
            return;
        }

        let callbacks = {
            let mut inner = sink.inner.lock();
            inner.received.push(ack.clone());
            inner.callbacks.clone()
        };
        if callbacks.is_empty() {
            return;
        }
        self.connection.spawn_tracked(async move {
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(&ack))).is_err() {
                    tracing::warn!("[BROADCAST] ack callback panicked for broadcast {}", ack.broadcast_id);
                }
            }
        });
    }

    fn prune_acks(&self) {
        let now = Instant::now();
        self.acks.retain(|_, sink| !sink.is_expired(now));
    }

    fn remove(&self, state: &SubscriptionState) {
        if let Some(mut routes) = self.routes.get_mut(state.channel) {
            routes.retain(|route| route.state.id != state.id);
        }
        self.routes.remove_if(state.channel, |_, routes| routes.is_empty());
    }

    /// Cancels every subscription and forgets pending acknowledgments
    pub(crate) fn clear(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.routes.iter() {
            for route in entry.value() {
                if route.state.active.swap(false, Ordering::SeqCst) {
                    cancelled += 1;
                }
            }
        }
        self.routes.clear();
        self.acks.clear();
        cancelled
    }

    pub fn subscription_count(&self) -> usize {
        self.routes.iter().map(|entry| entry.value().len()).sum()
    }
}

impl std::fmt::Debug for BroadcastRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRouter")
            .field("channels", &self.routes.len())
            .field("pending_acks", &self.acks.len())
            .finish()
    }
}

/// Handle of a broadcast listener
pub struct BroadcastSubscription {
    state: Arc<SubscriptionState>,
    router: Weak<BroadcastRouter>,
}

impl BroadcastSubscription {
    pub fn channel(&self) -> &'static str {
        self.state.channel
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Stops delivery. No message is delivered after this returns, including
    /// messages already queued.
    pub fn cancel(&self) {
        if !self.state.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.remove(&self.state);
        }
        tracing::debug!("[BROADCAST] subscription {} on {} cancelled", self.state.id, self.state.channel);
    }
}

impl std::fmt::Debug for BroadcastSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSubscription")
            .field("channel", &self.state.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Result of an outbound broadcast
///
/// Resolves once the transport accepted the broadcast. Receiver
/// acknowledgments, when requested, arrive through [`on_ack`](Self::on_ack)
/// until the broadcast's time to live runs out.
#[must_use = "futures do nothing unless polled"]
pub struct BroadcastFuture {
    broadcast_id: u64,
    accepted: SendAck,
    sink: Option<Arc<AckSink>>,
    connection: Weak<ConnectionManager>,
}

impl BroadcastFuture {
    pub fn broadcast_id(&self) -> u64 {
        self.broadcast_id
    }

    /// Registers a callback for receiver acknowledgments
    ///
    /// Acknowledgments that arrived before the callback was added are
    /// replayed to it. Returns false if acknowledgments were not requested.
    pub fn on_ack<F>(&self, callback: F) -> bool
    where
        F: Fn(&BroadcastAck) + Send + Sync + 'static,
    {
        let Some(sink) = &self.sink else {
            return false;
        };
        let callback: AckCallback = Arc::new(callback);
        let replay = {
            let mut inner = sink.inner.lock();
            inner.callbacks.push(callback.clone());
            inner.received.clone()
        };
        if replay.is_empty() {
            return true;
        }

        match self.connection.upgrade() {
            Some(connection) => connection.spawn_tracked(async move {
                for ack in &replay {
                    if catch_unwind(AssertUnwindSafe(|| callback(ack))).is_err() {
                        tracing::warn!("[BROADCAST] ack callback panicked for broadcast {}", ack.broadcast_id);
                    }
                }
            }),
            None => tracing::debug!("[BROADCAST] client gone, {} acks not replayed", replay.len()),
        }
        true
    }

    /// Acknowledgments received so far
    pub fn acks(&self) -> Vec<BroadcastAck> {
        self.sink
            .as_ref()
            .map(|sink| sink.inner.lock().received.clone())
            .unwrap_or_default()
    }
}

impl Future for BroadcastFuture {
    type Output = Result<(), ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.accepted).poll(cx).map(|accepted| match accepted {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionClosed),
        })
    }
}

impl std::fmt::Debug for BroadcastFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastFuture")
            .field("broadcast_id", &self.broadcast_id)
            .field("acks_requested", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::error::CloseReason;
    use crate::transport::connection::InboundHandler;
    use crate::transport::LocalNode;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Hello {
        n: u32,
    }

    impl BroadcastMessage for Hello {
        const CHANNEL: &'static str = "test.Hello";
    }

    struct NoopHandler;

    impl InboundHandler for NoopHandler {
        fn handle_frame(&self, _frame: Frame) {}
        fn connection_lost(&self, _reason: &CloseReason) {}
    }

    fn router(node: &LocalNode) -> (Arc<BroadcastRouter>, Arc<dyn InboundHandler>) {
        let handler: Arc<dyn InboundHandler> = Arc::new(NoopHandler);
        let connection = ConnectionManager::start(
            MaritimeId::new("mmsi://7"),
            ConnectionSettings::default(),
            node.transport(),
            Arc::new(|| PositionTime::now(0.0, 0.0)),
            Vec::new(),
            Arc::downgrade(&handler),
        );
        let router = Arc::new(BroadcastRouter::new(Arc::new(MessageTypeRegistry::new()), connection));
        (router, handler)
    }

    fn envelope(n: u32) -> BroadcastEnvelope {
        BroadcastEnvelope {
            broadcast_id: u64::from(n),
            sender: MaritimeId::new("mmsi://8"),
            sender_position: PositionTime::now(1.0, 1.0),
            channel: Hello::CHANNEL.to_string(),
            payload: Bytes::from(serde_json::to_vec(&Hello { n }).unwrap()),
            time_to_live: Duration::from_secs(60),
            radius: None,
            ack_requested: false,
            receiver_filter: None,
        }
    }

    #[tokio::test]
    async fn one_listener_sees_messages_in_order() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .listen::<Hello, _>(move |_: &BroadcastMessageHeader, message: &Hello| {
                let _ = tx.send(message.n);
            })
            .unwrap();

        for n in 0..50 {
            assert_eq!(router.dispatch(&envelope(n)), 1);
        }
        for n in 0..50 {
            assert_eq!(rx.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn cancelled_listener_receives_nothing_more() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        let received = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let received = received.clone();
            router
                .listen::<Hello, _>(move |_: &BroadcastMessageHeader, message: &Hello| {
                    std::thread::sleep(Duration::from_millis(5));
                    received.lock().push(message.n);
                })
                .unwrap()
        };

        for n in 0..20 {
            router.dispatch(&envelope(n));
        }
        subscription.cancel();
        let seen_at_cancel = received.lock().len();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // at most the delivery already running when cancel returned
        assert!(received.lock().len() <= seen_at_cancel + 1);
        assert!(!subscription.is_active());
        assert_eq!(router.dispatch(&envelope(99)), 0);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_others() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        router
            .listen::<Hello, _>(|_: &BroadcastMessageHeader, _: &Hello| panic!("listener failure"))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .listen::<Hello, _>(move |header: &BroadcastMessageHeader, message: &Hello| {
                let _ = tx.send((header.sender.clone(), message.n));
            })
            .unwrap();

        assert_eq!(router.dispatch(&envelope(1)), 2);
        assert_eq!(router.dispatch(&envelope(2)), 2);
        assert_eq!(rx.recv().await, Some((MaritimeId::new("mmsi://8"), 1)));
        assert_eq!(rx.recv().await, Some((MaritimeId::new("mmsi://8"), 2)));
    }

    #[tokio::test]
    async fn unknown_channel_is_dropped() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        let mut stray = envelope(1);
        stray.channel = "test.Unknown".to_string();
        assert_eq!(router.dispatch(&stray), 0);
    }

    #[tokio::test]
    async fn acks_are_replayed_to_late_callbacks() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        let future = router
            .broadcast(
                &MaritimeId::new("mmsi://7"),
                &Hello { n: 1 },
                &BroadcastOptions::default().with_receiver_ack(true),
            )
            .unwrap();

        router.deliver_ack(BroadcastAck {
            broadcast_id: future.broadcast_id(),
            origin: MaritimeId::new("mmsi://7"),
            receiver: MaritimeId::new("mmsi://9"),
            receiver_position: PositionTime::now(2.0, 2.0),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(future.on_ack(move |ack: &BroadcastAck| {
            let _ = tx.send(ack.receiver.clone());
        }));
        assert_eq!(rx.recv().await, Some(MaritimeId::new("mmsi://9")));
        assert_eq!(future.acks().len(), 1);
    }

    #[tokio::test]
    async fn unbounded_time_to_live_keeps_collecting_acks() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        let options = BroadcastOptions::default()
            .with_receiver_ack(true)
            .with_time_to_live(Duration::MAX);
        let future = router.broadcast(&MaritimeId::new("mmsi://7"), &Hello { n: 1 }, &options).unwrap();

        router.deliver_ack(BroadcastAck {
            broadcast_id: future.broadcast_id(),
            origin: MaritimeId::new("mmsi://7"),
            receiver: MaritimeId::new("mmsi://9"),
            receiver_position: PositionTime::now(2.0, 2.0),
        });
        router.prune_acks();

        assert_eq!(future.acks().len(), 1);
        assert_eq!(router.acks.len(), 1);
    }

    #[tokio::test]
    async fn clear_cancels_every_subscription() {
        let node = LocalNode::new();
        let (router, _handler) = router(&node);
        let a = router.listen::<Hello, _>(|_: &BroadcastMessageHeader, _: &Hello| {}).unwrap();
        let b = router.listen::<Hello, _>(|_: &BroadcastMessageHeader, _: &Hello| {}).unwrap();
        assert_eq!(router.subscription_count(), 2);

        assert_eq!(router.clear(), 2);
        assert!(!a.is_active() && !b.is_active());
        assert_eq!(router.subscription_count(), 0);
    }
}
