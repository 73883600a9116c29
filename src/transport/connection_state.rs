/// Connection state
///
/// States are ordered so that `state >= ConnectionState::Closing` reads as
/// "permanently going away".

/// Lifecycle state of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Not connected, may connect
    Disconnected,
    /// Waiting for the transport to establish the connection
    Connecting,
    /// Connected, working normally
    Connected,
    /// Close requested, ignore all inbound traffic
    Closing,
    /// Transport confirmed shutdown
    Closed,
    /// Every in-flight listener and callback has finished
    Terminated,
}

impl ConnectionState {
    /// Whether the client can no longer be used
    pub fn is_closed(&self) -> bool {
        *self >= ConnectionState::Closing
    }

    /// Whether `self -> next` is a legal transition
    ///
    /// Disconnected, connecting and connected may cycle until close is
    /// requested. From then on the state only moves forward.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (*self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Closing)
                | (Connecting, Closing)
                | (Connected, Closing)
                | (Closing, Closed)
                | (Closed, Terminated)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}
