/// Connection manager
///
/// Owns the connection state machine and the background tasks of one client:
///
/// - the outbound writer, which serializes every frame handed to the
///   transport and holds frames back while the client is not connected
/// - the inbound reader of the current connection
/// - the keep-alive ticker
/// - the notifier delivering [`ConnectionEvent`]s to listeners in order
///
/// Closing flips the state to `Closing` synchronously, then shuts the
/// transport down in the background. `Closed` follows once the transport
/// confirmed and `Terminated` once every tracked task (including listener and
/// callback deliveries) has drained.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{ConnectionSettings, PositionSupplier};
use crate::error::{ClientError, CloseReason};
use crate::event::{ConnectionEvent, ConnectionListener, TransportEvent};
use crate::model::{MaritimeId, PositionTime};
use crate::packet::Frame;
use crate::stream::ConnectionEventStream;
use crate::transport::{ConnectionState, InboundEvents, Transport};

const EVENT_CAPACITY: usize = 64;

/// Receiver of the frames read from the connection
pub(crate) trait InboundHandler: Send + Sync + 'static {
    fn handle_frame(&self, frame: Frame);

    /// The connection dropped without the client closing
    fn connection_lost(&self, reason: &CloseReason);

    /// A (re)connection was established
    fn connection_established(&self) {}
}

/// Resolves once the transport accepted (or refused) a frame
pub(crate) type SendAck = oneshot::Receiver<Result<(), ClientError>>;

enum Notification {
    Event(ConnectionEvent),
    /// Answered once every event queued before it was delivered
    Flush(oneshot::Sender<()>),
}

struct Outbound {
    frame: Frame,
    ack: Option<oneshot::Sender<Result<(), ClientError>>>,
}

pub struct ConnectionManager {
    client_id: MaritimeId,
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    handler: Weak<dyn InboundHandler>,
    position_supplier: PositionSupplier,
    runtime: Handle,
    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    notifier: mpsc::UnboundedSender<Notification>,
    events: broadcast::Sender<ConnectionEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// Bumped for every established connection so a stale reader cannot
    /// report the loss of a connection it no longer owns
    epoch: AtomicU64,
    last_inbound: Mutex<Instant>,
    unhealthy: AtomicBool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Creates the manager and starts its background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn start(
        client_id: MaritimeId,
        settings: ConnectionSettings,
        transport: Arc<dyn Transport>,
        position_supplier: PositionSupplier,
        listeners: Vec<Arc<dyn ConnectionListener>>,
        handler: Weak<dyn InboundHandler>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(RwLock::new(listeners));

        let manager = Arc::new(Self {
            client_id,
            settings,
            transport,
            handler,
            position_supplier,
            runtime: Handle::current(),
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            notifier: notify_tx,
            events: events.clone(),
            listeners: listeners.clone(),
            outbound: Mutex::new(Some(outbound_tx)),
            epoch: AtomicU64::new(0),
            last_inbound: Mutex::new(Instant::now()),
            unhealthy: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        manager.runtime.spawn(notify_listeners(listeners, events, notify_rx));
        manager.tracker.spawn_on(manager.clone().run_writer(outbound_rx), &manager.runtime);
        manager.tracker.spawn_on(manager.clone().run_keep_alive(), &manager.runtime);
        manager
    }

    pub fn client_id(&self) -> &MaritimeId {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ConnectionState::Terminated
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn events(&self) -> ConnectionEventStream {
        ConnectionEventStream::new(self.events.subscribe())
    }

    /// Current position as reported by the configured supplier
    pub fn current_position(&self) -> PositionTime {
        (self.position_supplier)()
    }

    /// Applies `current -> to` if the current state is one of `from`
    ///
    /// Returns the state that was left. The event is queued for listeners
    /// while the state lock is held, so listeners see transitions in order.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> Option<ConnectionState> {
        let mut state = self.state.lock();
        let current = *state;
        if !from.contains(&current) || !current.can_transition_to(to) {
            return None;
        }

        *state = to;
        self.state_tx.send_replace(to);
        tracing::info!("[STATE] {}: {} -> {}", self.client_id, current, to);
        self.emit(ConnectionEvent::StateChanged { from: current, to });
        Some(current)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.notifier.send(Notification::Event(event));
    }

    /// Waits until listeners have handled every event emitted so far
    async fn flush_listeners(&self) {
        let (done, flushed) = oneshot::channel();
        if self.notifier.send(Notification::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }

    /// Connects if currently disconnected
    ///
    /// Connecting while another connect is in progress waits for and shares
    /// its outcome; connecting while connected is a no-op. Fails with
    /// [`ClientError::ConnectionClosed`] once close was requested.
    ///
    /// The node learns the client's position before this returns.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting).is_none() {
            return self.join_connect().await;
        }

        let nodes = self.settings.node_list();
        tracing::info!("[CONNECT] {} connecting to {}", self.client_id, nodes);

        match self.transport.connect(&self.client_id, &nodes).await {
            Ok(inbound) => {
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                *self.last_inbound.lock() = Instant::now();
                self.unhealthy.store(false, Ordering::SeqCst);

                if self.transition(&[ConnectionState::Connecting], ConnectionState::Connected).is_none() {
                    tracing::debug!("[CONNECT] {} closed while connecting", self.client_id);
                    if let Err(e) = self.transport.disconnect().await {
                        tracing::debug!("[CONNECT] disconnect after aborted connect failed: {}", e);
                    }
                    return Err(ClientError::ConnectionClosed);
                }

                self.tracker.spawn_on(self.clone().run_reader(inbound, epoch), &self.runtime);
                if let Some(position) = self.position_frame() {
                    match self.send(position) {
                        Ok(ack) => {
                            if let Ok(Err(e)) = ack.await {
                                tracing::debug!("[CONNECT] {} position not reported: {}", self.client_id, e);
                            }
                        }
                        Err(e) => tracing::debug!("[CONNECT] {} position not reported: {}", self.client_id, e),
                    }
                }
                if let Some(handler) = self.handler.upgrade() {
                    handler.connection_established();
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[CONNECT] {} failed to connect: {}", self.client_id, e);
                self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Waits for a connect started elsewhere to settle
    async fn join_connect(&self) -> Result<(), ClientError> {
        let mut state_rx = self.state_tx.subscribe();
        let settled = state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state);

        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            Ok(state) if state.is_closed() => Err(ClientError::ConnectionClosed),
            Ok(_) => Err(ClientError::Disconnected {
                reason: "concurrent connect attempt failed".to_string(),
            }),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Drops the current connection without closing the client
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if self.transition(&[ConnectionState::Connected], ConnectionState::Disconnected).is_none() {
            return if self.is_closed() {
                Err(ClientError::ConnectionClosed)
            } else {
                Ok(())
            };
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        let result = self.transport.disconnect().await;
        if let Some(handler) = self.handler.upgrade() {
            handler.connection_lost(&CloseReason::Normal);
        }
        result.map_err(Into::into)
    }

    /// Queues a frame and returns a receiver for the transport's verdict
    pub(crate) fn send(&self, frame: Frame) -> Result<SendAck, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(frame, Some(tx))?;
        Ok(rx)
    }

    /// Queues a frame nobody waits on
    pub(crate) fn send_detached(&self, frame: Frame) -> Result<(), ClientError> {
        self.enqueue(frame, None)
    }

    fn enqueue(&self, frame: Frame, ack: Option<oneshot::Sender<Result<(), ClientError>>>) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(ClientError::ConnectionClosed)?;
        sender
            .send(Outbound { frame, ack })
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Runs work that may call into user code; termination waits for it
    pub(crate) fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(task, &self.runtime);
    }

    /// Keep-alive carrying the current position, if the supplier delivers one
    fn position_frame(&self) -> Option<Frame> {
        match catch_unwind(AssertUnwindSafe(|| self.current_position())) {
            Ok(position) => Some(Frame::KeepAlive { position }),
            Err(_) => {
                tracing::warn!("[KEEPALIVE] position supplier panicked, skipping keep-alive");
                None
            }
        }
    }

    /// Sends one keep-alive and reports prolonged silence
    pub fn send_keep_alive(&self) {
        let Some(frame) = self.position_frame() else {
            return;
        };

        if let Err(e) = self.send_detached(frame) {
            tracing::debug!("[KEEPALIVE] not sent: {}", e);
            return;
        }

        let silent_for = self.last_inbound.lock().elapsed();
        if silent_for > self.settings.keep_alive_timeout && !self.unhealthy.swap(true, Ordering::SeqCst) {
            tracing::warn!("[KEEPALIVE] {} heard nothing for {:?}", self.client_id, silent_for);
            self.emit(ConnectionEvent::Unhealthy { silent_for });
        }
    }

    fn record_inbound(&self) {
        *self.last_inbound.lock() = Instant::now();
        if self.unhealthy.swap(false, Ordering::SeqCst) {
            tracing::info!("[KEEPALIVE] {} traffic resumed", self.client_id);
            self.emit(ConnectionEvent::Healthy);
        }
    }

    /// Requests close
    ///
    /// Moves to `Closing`, runs `on_closing` and shuts the transport down in
    /// the background. Returns `false` if close was already requested.
    pub(crate) fn close_with<F: FnOnce()>(self: &Arc<Self>, on_closing: F) -> bool {
        let previous = match self.transition(
            &[
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ],
            ConnectionState::Closing,
        ) {
            Some(previous) => previous,
            None => return false,
        };

        on_closing();
        self.shutdown.cancel();
        self.outbound.lock().take();

        let manager = self.clone();
        self.runtime.spawn(async move { manager.shutdown_transport(previous).await });
        true
    }

    async fn shutdown_transport(self: Arc<Self>, previous: ConnectionState) {
        if previous != ConnectionState::Disconnected {
            match tokio::time::timeout(self.settings.shutdown_timeout, self.transport.disconnect()).await {
                Ok(Ok(())) => tracing::debug!("[CLOSE] {} transport shut down", self.client_id),
                Ok(Err(e)) => tracing::warn!("[CLOSE] {} transport shutdown failed: {}", self.client_id, e),
                Err(_) => tracing::warn!(
                    "[CLOSE] {} transport shutdown timed out after {:?}",
                    self.client_id,
                    self.settings.shutdown_timeout
                ),
            }
        }
        self.transition(&[ConnectionState::Closing], ConnectionState::Closed);

        self.flush_listeners().await;
        self.tracker.close();
        self.tracker.wait().await;

        self.transition(&[ConnectionState::Closed], ConnectionState::Terminated);
        tracing::info!("[CLOSE] {} terminated", self.client_id);
    }

    /// Waits until the client terminated or `timeout` elapsed
    ///
    /// Returns whether termination was observed, in which case listeners
    /// have also handled the `Terminated` event. Any number of callers may
    /// wait concurrently.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        let terminated = tokio::time::timeout(timeout, async {
            let reached = state_rx
                .wait_for(|state| *state == ConnectionState::Terminated)
                .await
                .is_ok();
            if reached {
                self.flush_listeners().await;
            }
            reached
        })
        .await;
        matches!(terminated, Ok(true)) || self.is_terminated()
    }

    async fn run_writer(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut state_rx = self.state_tx.subscribe();

        while let Some(Outbound { frame, ack }) = outbound.recv().await {
            let ready = state_rx
                .wait_for(|state| *state == ConnectionState::Connected || state.is_closed())
                .await
                .map(|state| !state.is_closed())
                .unwrap_or(false);

            let result = if ready {
                let kind = frame.kind();
                self.transport.send(frame).await.map_err(|e| {
                    tracing::error!("[WRITER] {} failed to send {}: {}", self.client_id, kind, e);
                    ClientError::from(e)
                })
            } else {
                Err(ClientError::ConnectionClosed)
            };

            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
        }
        tracing::debug!("[WRITER] {} stopped", self.client_id);
    }

    async fn run_keep_alive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.is_connected() {
                self.send_keep_alive();
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut inbound: InboundEvents, epoch: u64) {
        let reason = loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                event = inbound.recv() => event,
            };

            match event {
                Some(TransportEvent::Frame(frame)) => {
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        break None;
                    }
                    if self.is_closed() {
                        tracing::debug!("[READER] {} ignoring {} while closing", self.client_id, frame.kind());
                        continue;
                    }
                    self.record_inbound();
                    if matches!(frame, Frame::KeepAliveAck) {
                        continue;
                    }
                    match self.handler.upgrade() {
                        Some(handler) => handler.handle_frame(frame),
                        None => break None,
                    }
                }
                Some(TransportEvent::Disconnected { reason }) => break Some(reason),
                None => break Some(CloseReason::Error("inbound stream ended".to_string())),
            }
        };

        if let Some(reason) = reason {
            self.connection_lost(epoch, reason);
        }
    }

    fn connection_lost(&self, epoch: u64, reason: CloseReason) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if self.transition(&[ConnectionState::Connected], ConnectionState::Disconnected).is_some() {
            tracing::warn!("[READER] {} lost connection: {}", self.client_id, reason);
            if let Some(handler) = self.handler.upgrade() {
                handler.connection_lost(&reason);
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn notify_listeners(
    listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    mut queue: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(notification) = queue.recv().await {
        let event = match notification {
            Notification::Event(event) => event,
            Notification::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let _ = events.send(event.clone());

        let snapshot: Vec<_> = listeners.read().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                tracing::warn!("[LISTENER] connection listener panicked on {:?}", event);
            }
        }
    }
}
