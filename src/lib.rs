/// maritime-cloud - client runtime for the maritime cloud
///
/// A client identified by a [`MaritimeId`] broadcasts typed messages on named
/// channels, listens to the broadcasts of others, invokes services hosted by
/// remote clients and hosts services of its own. The wire transport is a
/// collaborator behind the [`Transport`] trait; [`LocalNode`] connects
/// clients living in the same process.

// Transport and connection lifecycle
pub mod transport;

// Core types
pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod packet;
pub mod stream;

pub mod broadcast;
pub mod client;
pub mod config;
pub mod registry;
pub mod service;

// Re-exports
pub use broadcast::{BroadcastFuture, BroadcastListener, BroadcastMessageHeader, BroadcastSubscription};
pub use client::{ConnectionHandle, MaritimeCloudClient};
pub use config::{BroadcastOptions, ClientConfiguration, ConnectionSettings, ReceiverFilter};
pub use error::{ClientError, CloseReason, TransportError};
pub use event::{ConnectionEvent, ConnectionListener, TransportEvent};
pub use message::{BroadcastMessage, Service, ServiceInitiationPoint, ServiceMessage};
pub use model::{MaritimeId, PositionTime};
pub use packet::{BroadcastAck, CorrelationId, Frame, FrameKind};
pub use registry::{ChannelDescriptor, MessageTypeRegistry, ServiceDescriptor};
pub use service::{
    ConnectionFuture, InvocationCallback, InvocationContext, ServiceEndpoint, ServiceLocator, ServiceRegistration,
};
pub use stream::ConnectionEventStream;
pub use transport::{ConnectionState, LocalNode, LocalTransport, Transport};

pub type Result<T> = std::result::Result<T, ClientError>;
