/// Message type contracts.
///
/// Broadcast and service message types declare their channel or service name
/// through associated constants. The names are read once by the
/// [`MessageTypeRegistry`](crate::registry::MessageTypeRegistry), validated
/// and cached.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A message that can be broadcast on a named channel
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct HelloWorld { message: String }
///
/// impl BroadcastMessage for HelloWorld {
///     const CHANNEL: &'static str = "imo.HelloWorld";
/// }
/// ```
pub trait BroadcastMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Channel the message is sent on. Must be non-empty.
    const CHANNEL: &'static str;
}

/// A named unit of remote functionality
pub trait Service: 'static {
    const NAME: &'static str;
}

/// The initiating message of a service invocation
pub trait ServiceMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Service this message belongs to
    type Service: Service;
    /// Value the remote side answers with
    type Reply: Serialize + DeserializeOwned + Send + 'static;

    /// Name of the message within its service
    fn message_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Typed token identifying where a service invocation starts
///
/// Used both to register a service locally and to locate remote providers.
pub struct ServiceInitiationPoint<S> {
    _marker: PhantomData<fn() -> S>,
}

impl<S: ServiceMessage> ServiceInitiationPoint<S> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    pub fn service_name(&self) -> &'static str {
        <S::Service as Service>::NAME
    }

    pub fn message_name(&self) -> &'static str {
        S::message_name()
    }
}

impl<S: ServiceMessage> Default for ServiceInitiationPoint<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for ServiceInitiationPoint<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for ServiceInitiationPoint<S> {}

impl<S: ServiceMessage> std::fmt::Debug for ServiceInitiationPoint<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInitiationPoint")
            .field("service", &self.service_name())
            .field("message", &self.message_name())
            .finish()
    }
}
