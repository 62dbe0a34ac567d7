//! Core library for the Spawn provisioning engine.
//!
//! The crate drives short-lived cloud instances through a fixed lifecycle
//! (resolve credentials → register an SSH key → create → wait for readiness
//! → inject the agent environment) behind a [`ProviderAdapter`] seam, and
//! keeps local secret material in tracked temporary files that are erased on
//! every exit path.

pub mod adapter;
pub mod backoff;
pub mod command;
pub mod config;
pub mod credentials;
pub mod error;
pub mod identifier;
pub mod inject;
pub mod logging;
pub mod poller;
pub mod provision;
pub mod ssh_key;
pub mod temp_tracker;
pub mod test_support;

pub use adapter::{AdapterFuture, InstanceHandle, ProviderAdapter};
pub use backoff::{RetryPolicy, backoff, retry};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, SpawnConfig};
pub use credentials::{
    CredentialEnv, CredentialError, CredentialResolver, CredentialSource, CredentialSpec,
    CredentialStore, Credentials, JsonCredentialStore, ProviderCredentials, TerminalLineReader,
};
pub use error::{ErrorKind, ProvisionError};
pub use identifier::{Manifest, ManifestError};
pub use inject::{EnvInjector, InjectError, LocalTransport, PayloadTransport, SshTransport};
pub use poller::{PollError, PollTarget, poll_until_ready};
pub use provision::{Provisioned, Provisioner, ProvisioningContext};
pub use ssh_key::{Fingerprint, SshIdentity, SshKeyError, SshKeyManager};
pub use temp_tracker::{TempTracker, TempTrackerError};
