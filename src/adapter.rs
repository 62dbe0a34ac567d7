//! Provider adapter abstraction consumed by the provisioning engine.
//!
//! Each cloud or sandbox provider implements [`ProviderAdapter`] once. The
//! engine drives credentials, key registration, readiness polling, and
//! environment injection generically; the adapter only supplies the provider
//! specific calls.

use std::future::Future;
use std::pin::Pin;

use crate::credentials::{CredentialValidator, Credentials, ProviderCredentials};
use crate::inject::PayloadTransport;
use crate::poller::{PollTarget, ProbeError};
use crate::ssh_key::{KeyRegistrar, SshIdentity};

/// Future returned by adapter capabilities.
pub type AdapterFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Handle returned by an adapter once an instance has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Human readable name used in log output and error messages.
    pub label: String,
}

impl InstanceHandle {
    /// Creates a handle from a provider identifier and a display label.
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Provider specific half of the provisioning flow.
///
/// Credential validation and SSH key registration are separate capability
/// traits so adapters for providers without SSH (sandboxed execution
/// environments) can return trivial implementations.
pub trait ProviderAdapter: CredentialValidator + KeyRegistrar {
    /// Provider specific error type returned by create and destroy calls.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transport used to deliver the environment payload once ready.
    type Transport: PayloadTransport;

    /// Credential declaration for this provider.
    fn credentials(&self) -> &ProviderCredentials;

    /// Whether the provider authenticates sessions with the local SSH key.
    fn uses_ssh_keys(&self) -> bool {
        true
    }

    /// Environment variable that receives the ready instance address.
    fn ip_env_var(&self) -> Option<&str> {
        None
    }

    /// Reports whether a create failure is worth retrying (for example API
    /// rate limiting).
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        false
    }

    /// Creates a new instance.
    fn create<'a>(
        &'a self,
        credentials: &'a Credentials,
        identity: Option<&'a SshIdentity>,
    ) -> AdapterFuture<'a, InstanceHandle, Self::Error>;

    /// Describes how readiness is detected for `handle`.
    fn poll_target(&self, handle: &InstanceHandle) -> PollTarget;

    /// Fetches the raw status document for `handle`.
    fn fetch_status<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> AdapterFuture<'a, String, ProbeError>;

    /// Builds the payload transport for a ready instance.
    fn transport(&self, handle: &InstanceHandle, ip: &str) -> Self::Transport;

    /// Destroys the instance.
    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> AdapterFuture<'a, (), Self::Error>;
}
