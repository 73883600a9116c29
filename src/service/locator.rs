use std::marker::PhantomData;
use std::sync::Arc;

use crate::client::ClientInner;
use crate::error::ClientError;
use crate::message::ServiceMessage;
use crate::model::MaritimeId;
use crate::service::ConnectionFuture;

/// Finds remote providers of the service `S` belongs to
pub struct ServiceLocator<S> {
    client: Arc<ClientInner>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: ServiceMessage> ServiceLocator<S> {
    pub(crate) fn new(client: Arc<ClientInner>) -> Self {
        Self {
            client,
            _marker: PhantomData,
        }
    }

    /// Nearest provider, if any is connected
    pub async fn nearest(&self) -> Result<Option<ServiceEndpoint<S>>, ClientError> {
        Ok(self.nearest_n(1).await?.into_iter().next())
    }

    /// Up to `limit` providers, nearest first
    pub async fn nearest_n(&self, limit: usize) -> Result<Vec<ServiceEndpoint<S>>, ClientError> {
        let providers = self.client.locate::<S>(limit)?.await?;
        Ok(providers
            .into_iter()
            .map(|id| ServiceEndpoint {
                id,
                client: self.client.clone(),
                _marker: PhantomData,
            })
            .collect())
    }
}

/// A remote client providing the service of `S`
pub struct ServiceEndpoint<S> {
    id: MaritimeId,
    client: Arc<ClientInner>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: ServiceMessage> ServiceEndpoint<S> {
    pub fn id(&self) -> &MaritimeId {
        &self.id
    }

    /// Invokes the provider
    pub fn invoke(&self, message: &S) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        self.client.invoke(&self.id, message)
    }
}

impl<S> Clone for ServiceEndpoint<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            client: self.client.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S> std::fmt::Debug for ServiceEndpoint<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint").field("id", &self.id).finish()
    }
}
