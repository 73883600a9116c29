/// Client configuration
///
/// [`ConnectionSettings`] is the serializable part that deployments keep in a
/// settings file. [`ClientConfiguration`] adds what only code can provide
/// (identity, position supplier, listeners, shared type registry) and builds
/// the client directly.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::MaritimeCloudClient;
use crate::error::ClientError;
use crate::event::ConnectionListener;
use crate::model::{MaritimeId, PositionTime};
use crate::registry::MessageTypeRegistry;
use crate::transport::Transport;

pub const DEFAULT_NODE: &str = "localhost:43234";

/// Supplies the client's current position
pub type PositionSupplier = Arc<dyn Fn() -> PositionTime + Send + Sync>;

/// Predicate restricting which receivers a broadcast may reach
#[derive(Clone)]
pub struct ReceiverFilter(Arc<dyn Fn(&MaritimeId, &PositionTime) -> bool + Send + Sync>);

impl ReceiverFilter {
    pub fn new<F>(filter: F) -> Self
    where
        F: Fn(&MaritimeId, &PositionTime) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(filter))
    }

    pub fn accepts(&self, receiver: &MaritimeId, position: &PositionTime) -> bool {
        (self.0)(receiver, position)
    }
}

impl std::fmt::Debug for ReceiverFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReceiverFilter(..)")
    }
}

/// Options applied to a single broadcast
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    /// How long the broadcast is considered live. Acknowledgments are
    /// collected for this long.
    pub time_to_live: Duration,
    /// Propagation scope in meters, left to the node to interpret
    pub radius: Option<u32>,
    pub receiver_filter: Option<ReceiverFilter>,
    /// Ask receivers to acknowledge the broadcast
    pub receiver_ack_enabled: bool,
}

impl BroadcastOptions {
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    pub fn with_radius(mut self, meters: u32) -> Self {
        self.radius = Some(meters);
        self
    }

    pub fn with_receiver_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&MaritimeId, &PositionTime) -> bool + Send + Sync + 'static,
    {
        self.receiver_filter = Some(ReceiverFilter::new(filter));
        self
    }

    pub fn with_receiver_ack(mut self, enabled: bool) -> Self {
        self.receiver_ack_enabled = enabled;
        self
    }
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            time_to_live: Duration::from_secs(120),
            radius: None,
            receiver_filter: None,
            receiver_ack_enabled: false,
        }
    }
}

/// Connection settings that can live in a settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Cloud node addresses as `host:port`
    pub nodes: Vec<String>,
    /// Interval between keep-alive frames
    pub keep_alive: Duration,
    /// Silence after which the connection is reported unhealthy
    pub keep_alive_timeout: Duration,
    /// Default reply window for service invocations
    pub invocation_timeout: Duration,
    /// Upper bound on the transport's graceful shutdown
    pub shutdown_timeout: Duration,
    /// Connect as soon as the client is built
    pub auto_connect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let keep_alive = Duration::from_secs(2);
        Self {
            nodes: vec![DEFAULT_NODE.to_string()],
            keep_alive,
            keep_alive_timeout: keep_alive.saturating_mul(3),
            invocation_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            auto_connect: true,
        }
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.nodes.is_empty() {
            return Err(ClientError::config_error("nodes", "at least one node address is required"));
        }
        for node in &self.nodes {
            validate_node(node)?;
        }

        let durations = [
            ("keep_alive", self.keep_alive),
            ("keep_alive_timeout", self.keep_alive_timeout),
            ("invocation_timeout", self.invocation_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ClientError::config_error(field, "must be greater than zero"));
            }
        }

        if self.keep_alive_timeout < self.keep_alive {
            return Err(ClientError::config_error(
                "keep_alive_timeout",
                "must not be shorter than keep_alive",
            ));
        }
        Ok(())
    }

    /// Node addresses joined the way transports expect them
    pub fn node_list(&self) -> String {
        self.nodes.join(",")
    }
}

fn validate_node(node: &str) -> Result<(), ClientError> {
    let parsed = url::Url::parse(&format!("tcp://{}", node))
        .map_err(|e| ClientError::config_error("nodes", format!("invalid node address '{}': {}", node, e)))?;

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ClientError::config_error("nodes", format!("node '{}' has no host", node)));
    }
    if parsed.port().is_none() {
        return Err(ClientError::config_error("nodes", format!("node '{}' has no port", node)));
    }
    if parsed.path() != "" && parsed.path() != "/" {
        return Err(ClientError::config_error("nodes", format!("node '{}' must be host:port", node)));
    }
    Ok(())
}

/// Builder for [`MaritimeCloudClient`]
pub struct ClientConfiguration {
    pub(crate) id: Option<MaritimeId>,
    pub(crate) settings: ConnectionSettings,
    pub(crate) broadcast_defaults: BroadcastOptions,
    pub(crate) position_supplier: PositionSupplier,
    pub(crate) listeners: Vec<Arc<dyn ConnectionListener>>,
    pub(crate) message_types: Arc<MessageTypeRegistry>,
}

impl ClientConfiguration {
    pub fn new() -> Self {
        Self {
            id: None,
            settings: ConnectionSettings::default(),
            broadcast_defaults: BroadcastOptions::default(),
            position_supplier: Arc::new(|| PositionTime::now(0.0, 0.0)),
            listeners: Vec::new(),
            message_types: Arc::new(MessageTypeRegistry::new()),
        }
    }

    pub fn create(id: impl Into<MaritimeId>) -> Self {
        Self::new().with_id(id)
    }

    pub fn with_id(mut self, id: impl Into<MaritimeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the keep-alive interval. The unhealthy threshold follows at
    /// three intervals unless set explicitly afterwards.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.settings.keep_alive = interval;
        self.settings.keep_alive_timeout = interval.saturating_mul(3);
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.settings.keep_alive_timeout = timeout;
        self
    }

    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.invocation_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.settings.auto_connect = enabled;
        self
    }

    pub fn default_broadcast_options(mut self, options: BroadcastOptions) -> Self {
        self.broadcast_defaults = options;
        self
    }

    pub fn position_supplier<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> PositionTime + Send + Sync + 'static,
    {
        self.position_supplier = Arc::new(supplier);
        self
    }

    /// Adds a listener invoked on every connection event
    pub fn add_listener<L: ConnectionListener>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Shares a type registry between several clients
    pub fn message_types(mut self, registry: Arc<MessageTypeRegistry>) -> Self {
        self.message_types = registry;
        self
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        match &self.id {
            None => return Err(ClientError::NullArgument { argument: "id" }),
            Some(id) if id.is_empty() => return Err(ClientError::NullArgument { argument: "id" }),
            Some(_) => {}
        }
        self.settings.validate()
    }

    /// Builds the client on top of `transport`
    ///
    /// Must be called from within a tokio runtime. Connects right away when
    /// auto connect is enabled.
    pub fn build(self, transport: Arc<dyn Transport>) -> Result<MaritimeCloudClient, ClientError> {
        self.validate()?;
        MaritimeCloudClient::new(self, transport)
    }
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("broadcast_defaults", &self.broadcast_defaults)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cloud_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.keep_alive, Duration::from_secs(2));
        assert_eq!(settings.nodes, vec!["localhost:43234".to_string()]);
        assert!(settings.auto_connect);
        settings.validate().unwrap();
    }

    #[test]
    fn missing_identity_is_a_null_argument() {
        let err = ClientConfiguration::new().validate().unwrap_err();
        assert!(matches!(err, ClientError::NullArgument { argument: "id" }));

        let err = ClientConfiguration::create("  ").validate().unwrap_err();
        assert!(matches!(err, ClientError::NullArgument { .. }));
    }

    #[test]
    fn node_addresses_need_host_and_port() {
        let bad = ConnectionSettings {
            nodes: vec!["localhost".into()],
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ClientError::Configuration { .. })));

        let good = ConnectionSettings {
            nodes: vec!["node1.example.org:43234".into(), "10.0.0.2:43234".into()],
            ..Default::default()
        };
        good.validate().unwrap();
        assert_eq!(good.node_list(), "node1.example.org:43234,10.0.0.2:43234");
    }

    #[test]
    fn zero_durations_are_rejected() {
        let settings = ConnectionSettings {
            invocation_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ClientError::Configuration { ref field, .. } if field == "invocation_timeout"));
    }

    #[test]
    fn keep_alive_moves_timeout_along() {
        let config = ClientConfiguration::create("mmsi://1").keep_alive(Duration::from_millis(100));
        assert_eq!(config.settings().keep_alive_timeout, Duration::from_millis(300));
    }

    #[test]
    fn huge_keep_alive_saturates() {
        let config = ClientConfiguration::create("mmsi://1").keep_alive(Duration::MAX);
        assert_eq!(config.settings().keep_alive_timeout, Duration::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn receiver_filter_is_applied() {
        let options = BroadcastOptions::default().with_receiver_filter(|id, _| id.as_str().ends_with('2'));
        let filter = options.receiver_filter.unwrap();
        let here = PositionTime::now(55.0, 12.0);
        assert!(filter.accepts(&MaritimeId::new("mmsi://2"), &here));
        assert!(!filter.accepts(&MaritimeId::new("mmsi://3"), &here));
    }
}
