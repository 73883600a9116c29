//! Remote procedure calls between clients
//!
//! Outbound invocations are tracked by [`InvocationRegistry`], inbound ones
//! are dispatched through [`ServiceRegistry`] to the registered callback.

pub mod invocation;
pub mod locator;
pub mod registration;

pub use invocation::{ConnectionFuture, InvocationRegistry, PendingInvocation};
pub use locator::{ServiceEndpoint, ServiceLocator};
pub use registration::{InvocationCallback, InvocationContext, ServiceRegistration, ServiceRegistry};
