/// Message type registry
///
/// Resolves broadcast and service message types to their declared channel
/// and service names. Each distinct type is validated once and the resulting
/// descriptor is cached; concurrent first resolutions of the same type agree
/// on a single descriptor.
///
/// The registry also owns the channel name -> decoder mapping used to turn
/// inbound broadcast payloads back into typed messages. A channel nobody in
/// this process registered is simply unknown.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ClientError;
use crate::message::{BroadcastMessage, Service, ServiceMessage};

/// Type erased, decoded broadcast message
pub type DecodedMessage = Arc<dyn Any + Send + Sync>;

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<DecodedMessage, ClientError> + Send + Sync>;

/// Resolved channel of a broadcast message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    channel: &'static str,
}

impl ChannelDescriptor {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }
}

/// Resolved service and message name of a service message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    service: &'static str,
    message: &'static str,
}

impl ServiceDescriptor {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn message(&self) -> &'static str {
        self.message
    }
}

#[derive(Clone)]
struct ChannelDecoder {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

/// Cache of resolved message types, safe to share between clients
#[derive(Default)]
pub struct MessageTypeRegistry {
    channels: DashMap<TypeId, Arc<ChannelDescriptor>>,
    services: DashMap<TypeId, Arc<ServiceDescriptor>>,
    decoders: DashMap<&'static str, ChannelDecoder>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the channel declared by `M`
    pub fn resolve<M: BroadcastMessage>(&self) -> Result<Arc<ChannelDescriptor>, ClientError> {
        let type_id = TypeId::of::<M>();
        if let Some(found) = self.channels.get(&type_id) {
            return Ok(found.value().clone());
        }

        let type_name = std::any::type_name::<M>();
        validate_name(type_name, "channel", M::CHANNEL)?;

        let descriptor = self
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                tracing::debug!("[RESOLVE] {} -> channel {}", type_name, M::CHANNEL);
                Arc::new(ChannelDescriptor {
                    type_id,
                    type_name,
                    channel: M::CHANNEL,
                })
            })
            .value()
            .clone();
        Ok(descriptor)
    }

    /// Resolves the service and message name declared by `S`
    pub fn resolve_service<S: ServiceMessage>(&self) -> Result<Arc<ServiceDescriptor>, ClientError> {
        let type_id = TypeId::of::<S>();
        if let Some(found) = self.services.get(&type_id) {
            return Ok(found.value().clone());
        }

        let type_name = std::any::type_name::<S>();
        let service = <S::Service as Service>::NAME;
        validate_name(type_name, "service", service)?;
        validate_name(type_name, "message", S::message_name())?;

        let descriptor = self
            .services
            .entry(type_id)
            .or_insert_with(|| {
                tracing::debug!("[RESOLVE] {} -> service {}", type_name, service);
                Arc::new(ServiceDescriptor {
                    type_id,
                    type_name,
                    service,
                    message: S::message_name(),
                })
            })
            .value()
            .clone();
        Ok(descriptor)
    }

    /// Installs the decoder for `M` under its channel name
    ///
    /// Registering the same type again is a no-op. A different type claiming
    /// an already registered channel is rejected.
    pub fn register_broadcast<M: BroadcastMessage>(&self) -> Result<Arc<ChannelDescriptor>, ClientError> {
        let descriptor = self.resolve::<M>()?;
        let type_id = TypeId::of::<M>();

        match self.decoders.entry(descriptor.channel()) {
            Entry::Occupied(existing) => {
                if existing.get().type_id != type_id {
                    return Err(ClientError::InvalidMessageType {
                        type_name: descriptor.type_name(),
                        reason: format!(
                            "channel '{}' is already declared by {}",
                            descriptor.channel(),
                            existing.get().type_name
                        ),
                    });
                }
            }
            Entry::Vacant(slot) => {
                let decode: DecodeFn = Arc::new(|payload: &[u8]| {
                    let message: M = serde_json::from_slice(payload)?;
                    Ok(Arc::new(message) as DecodedMessage)
                });
                slot.insert(ChannelDecoder {
                    type_id,
                    type_name: descriptor.type_name(),
                    decode,
                });
            }
        }

        Ok(descriptor)
    }

    /// Decodes a payload received on `channel`
    ///
    /// Returns `None` when no type in this process declared the channel.
    pub fn decode(&self, channel: &str, payload: &[u8]) -> Option<Result<DecodedMessage, ClientError>> {
        let decoder = self.decoders.get(channel)?.value().clone();
        Some((decoder.decode)(payload))
    }

}

impl std::fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTypeRegistry")
            .field("channels", &self.channels.len())
            .field("services", &self.services.len())
            .field("decoders", &self.decoders.len())
            .finish()
    }
}

fn validate_name(type_name: &'static str, what: &str, name: &str) -> Result<(), ClientError> {
    let invalid = |reason: String| ClientError::InvalidMessageType { type_name, reason };

    if name.trim().is_empty() {
        return Err(invalid(format!("declared {} name is empty", what)));
    }
    if name.trim() != name {
        return Err(invalid(format!("{} name '{}' has surrounding whitespace", what, name)));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid(format!("{} name contains control characters", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Hello {
        text: String,
    }

    impl BroadcastMessage for Hello {
        const CHANNEL: &'static str = "test.Hello";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Nameless;

    impl BroadcastMessage for Nameless {
        const CHANNEL: &'static str = "  ";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor;

    impl BroadcastMessage for Impostor {
        const CHANNEL: &'static str = "test.Hello";
    }

    struct Echo;

    impl Service for Echo {
        const NAME: &'static str = "test.Echo";
    }

    struct Unnamed;

    impl Service for Unnamed {
        const NAME: &'static str = "";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping(String);

    impl ServiceMessage for Ping {
        type Service = Echo;
        type Reply = String;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Orphan;

    impl ServiceMessage for Orphan {
        type Service = Unnamed;
        type Reply = ();
    }

    #[test]
    fn resolve_is_memoized() {
        let registry = MessageTypeRegistry::new();
        let first = registry.resolve::<Hello>().unwrap();
        let second = registry.resolve::<Hello>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.channel(), "test.Hello");
    }

    #[test]
    fn invalid_channel_is_never_cached() {
        let registry = MessageTypeRegistry::new();
        for _ in 0..2 {
            let err = registry.resolve::<Nameless>().unwrap_err();
            assert!(matches!(err, ClientError::InvalidMessageType { .. }));
        }
        assert!(registry.channels.is_empty());
    }

    #[test]
    fn concurrent_first_resolution_has_single_winner() {
        let registry = Arc::new(MessageTypeRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve::<Hello>().unwrap())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn service_name_comes_from_declaring_service() {
        let registry = MessageTypeRegistry::new();
        let descriptor = registry.resolve_service::<Ping>().unwrap();
        assert_eq!(descriptor.service(), "test.Echo");
        assert_eq!(descriptor.message(), "Ping");

        assert!(matches!(
            registry.resolve_service::<Orphan>(),
            Err(ClientError::InvalidMessageType { .. })
        ));
    }

    #[test]
    fn decoders_are_exact_match_on_channel() {
        let registry = MessageTypeRegistry::new();
        registry.register_broadcast::<Hello>().unwrap();
        registry.register_broadcast::<Hello>().unwrap();

        let decoded = registry
            .decode("test.Hello", br#"{"text":"hi"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.downcast_ref::<Hello>().unwrap().text, "hi");

        assert!(registry.decode("channel", b"{}").is_none());
        assert!(registry.decode("test.hello", b"{}").is_none());
    }

    #[test]
    fn second_type_on_taken_channel_is_rejected() {
        let registry = MessageTypeRegistry::new();
        let first = registry.register_broadcast::<Hello>().unwrap();
        assert_eq!(ChannelDescriptor::type_id(&first), TypeId::of::<Hello>());

        let err = registry.register_broadcast::<Impostor>().unwrap_err();
        match err {
            ClientError::InvalidMessageType { type_name, reason } => {
                assert!(type_name.ends_with("Impostor"));
                assert!(reason.contains("test.Hello"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(registry.decoders.len(), 1);
        let decoded = registry.decode("test.Hello", br#"{"text":"still hello"}"#).unwrap().unwrap();
        assert!(decoded.downcast_ref::<Hello>().is_some());
    }
}
