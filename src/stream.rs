use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::event::ConnectionEvent;
use crate::transport::ConnectionState;

/// Stream of connection events
///
/// Backed by a broadcast channel; a subscriber that falls too far behind
/// skips the events it missed rather than blocking the connection.
pub struct ConnectionEventStream {
    inner: BroadcastStream<ConnectionEvent>,
    state_changes_only: bool,
}

impl ConnectionEventStream {
    pub fn new(receiver: broadcast::Receiver<ConnectionEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            state_changes_only: false,
        }
    }

    /// Only yield state transitions
    pub fn state_changes(mut self) -> Self {
        self.state_changes_only = true;
        self
    }

    /// Waits until the connection enters `state`
    ///
    /// Returns `false` if the stream ended first.
    pub async fn wait_for(&mut self, state: ConnectionState) -> bool {
        while let Some(event) = self.next().await {
            if event.new_state() == Some(state) {
                return true;
            }
        }
        false
    }

    fn should_emit(&self, event: &ConnectionEvent) -> bool {
        !self.state_changes_only || event.is_state_change()
    }
}

impl Stream for ConnectionEventStream {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.should_emit(&event) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(lagged))) => {
                    tracing::debug!("[EVENTS] connection event stream lagged: {}", lagged);
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
