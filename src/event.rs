use std::time::Duration;

use crate::error::CloseReason;
use crate::packet::Frame;
use crate::transport::ConnectionState;

/// Events delivered by the transport for one connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Inbound frame from the node
    Frame(Frame),
    /// The transport lost or ended the connection
    Disconnected { reason: CloseReason },
}

/// Observable events of a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One transition of the connection state machine
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// No keep-alive acknowledgment for `silent_for`. Informational only.
    Unhealthy { silent_for: Duration },
    /// Traffic resumed after an unhealthy report
    Healthy,
}

impl ConnectionEvent {
    pub fn is_state_change(&self) -> bool {
        matches!(self, ConnectionEvent::StateChanged { .. })
    }

    /// State entered by this event, if it is a transition
    pub fn new_state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Receives connection events in the order they happened
///
/// A panicking listener is logged and skipped; the remaining listeners are
/// still notified.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event)
    }
}
