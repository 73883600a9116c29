/// Transport collaborator contract and the connection machinery built on it
///
/// The client never touches sockets. A [`Transport`] connects to a cloud
/// node, accepts outbound frames and hands back a stream of classified
/// inbound events. [`LocalNode`] is an in-process implementation that routes
/// between clients living in the same process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::TransportEvent;
use crate::model::MaritimeId;
use crate::packet::Frame;

pub mod connection;
pub mod connection_state;
pub mod local;

pub use connection::ConnectionManager;
pub use connection_state::ConnectionState;
pub use local::{LocalNode, LocalTransport};

/// Inbound events of one established connection
pub type InboundEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Connection to a cloud node
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes the connection for `client_id`
    ///
    /// `nodes` is a comma separated list of `host:port` addresses. The
    /// returned receiver yields every inbound frame until the connection ends.
    async fn connect(&self, client_id: &MaritimeId, nodes: &str) -> Result<InboundEvents, TransportError>;

    /// Hands a frame to the transport. Success means the frame was accepted
    /// for delivery, not that any peer received it.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Gracefully shuts the connection down
    async fn disconnect(&self) -> Result<(), TransportError>;
}
