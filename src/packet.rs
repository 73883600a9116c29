/// Frame model exchanged with the transport collaborator
///
/// Frames are already classified; turning them into bytes on a socket is the
/// transport's business. Message payloads travel as JSON encoded [`Bytes`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::config::ReceiverFilter;
use crate::model::{MaritimeId, PositionTime};

/// Identifier linking an outbound request to its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "corr-{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Monotonic id source shared by correlation and broadcast ids
#[derive(Debug)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Frame kinds, used for routing and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Broadcast = 0,
    BroadcastAck = 1,
    Request = 2,
    Response = 3,
    RegisterService = 4,
    DeregisterService = 5,
    Locate = 6,
    KeepAlive = 7,
    KeepAliveAck = 8,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Wire level broadcast
#[derive(Debug, Clone)]
pub struct BroadcastEnvelope {
    /// Unique per sender, used to correlate acknowledgments
    pub broadcast_id: u64,
    pub sender: MaritimeId,
    pub sender_position: PositionTime,
    pub channel: String,
    pub payload: Bytes,
    pub time_to_live: Duration,
    /// Propagation scope in meters, interpreted by the node
    pub radius: Option<u32>,
    pub ack_requested: bool,
    pub receiver_filter: Option<ReceiverFilter>,
}

/// Acknowledgment sent by a receiver of a broadcast back to its sender
#[derive(Debug, Clone)]
pub struct BroadcastAck {
    pub broadcast_id: u64,
    /// Sender of the acknowledged broadcast
    pub origin: MaritimeId,
    pub receiver: MaritimeId,
    pub receiver_position: PositionTime,
}

/// Correlated invocation of a service hosted by `target`
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub correlation_id: CorrelationId,
    pub origin: MaritimeId,
    pub target: MaritimeId,
    pub service: String,
    pub message: String,
    pub payload: Bytes,
}

impl RequestFrame {
    /// Builds the response addressed back at the requester
    pub fn respond(&self, outcome: ResponseOutcome) -> ResponseFrame {
        ResponseFrame {
            correlation_id: self.correlation_id,
            target: self.origin.clone(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No callback registered for the service at the target
    ServiceNotFound,
    /// The callback reported a failure
    Remote,
    /// Target not connected to the node
    TargetUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Success(Bytes),
    Failure(RemoteFailure),
}

/// Response correlated to an earlier request, addressed to the requester
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub correlation_id: CorrelationId,
    pub target: MaritimeId,
    pub outcome: ResponseOutcome,
}

/// A frame travelling between a client and its cloud node
#[derive(Debug, Clone)]
pub enum Frame {
    Broadcast(BroadcastEnvelope),
    BroadcastAck(BroadcastAck),
    Request(RequestFrame),
    Response(ResponseFrame),
    /// Announces a locally hosted service; the node answers with a `Response`
    RegisterService {
        correlation_id: CorrelationId,
        service: String,
    },
    DeregisterService {
        service: String,
    },
    /// Asks the node for providers of a service; answered with a `Response`
    /// whose payload is a JSON list of ids
    Locate {
        correlation_id: CorrelationId,
        service: String,
        limit: usize,
    },
    KeepAlive {
        position: PositionTime,
    },
    KeepAliveAck,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Broadcast(_) => FrameKind::Broadcast,
            Frame::BroadcastAck(_) => FrameKind::BroadcastAck,
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
            Frame::RegisterService { .. } => FrameKind::RegisterService,
            Frame::DeregisterService { .. } => FrameKind::DeregisterService,
            Frame::Locate { .. } => FrameKind::Locate,
            Frame::KeepAlive { .. } => FrameKind::KeepAlive,
            Frame::KeepAliveAck => FrameKind::KeepAliveAck,
        }
    }
}
