//! Failure taxonomy shared by every provisioning step.

use std::fmt;

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::inject::InjectError;
use crate::poller::PollError;
use crate::ssh_key::SshKeyError;

/// Broad classification of a failure, used to pick remediation and exit
/// behaviour.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Missing or unusable settings. The user must act; never retried.
    Configuration,
    /// A resolved credential was rejected by the provider.
    Validation,
    /// A probe failed or returned unparsable data. Absorbed by the poller.
    Transient,
    /// The readiness budget ran out.
    Timeout,
    /// Local file system work failed (key generation, config writes,
    /// temporary files).
    Filesystem,
    /// A provider call or remote transport failed.
    Provider,
}

impl ErrorKind {
    /// Process exit code conventionally reported for this kind.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Configuration | Self::Validation => 2,
            Self::Timeout => 3,
            Self::Transient | Self::Filesystem | Self::Provider => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Filesystem => "filesystem",
            Self::Provider => "provider",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Credential resolution or validation failed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    /// The SSH key could not be prepared or registered.
    #[error(transparent)]
    SshKey(#[from] SshKeyError),
    /// The provider refused to create the instance.
    #[error("failed to create {provider} instance: {source}")]
    Create {
        /// Provider name.
        provider: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The instance never became ready.
    #[error(transparent)]
    Readiness(#[from] PollError),
    /// The environment payload could not be delivered.
    #[error(transparent)]
    Injection(#[from] InjectError),
    /// A step failed after creation and destroying the instance failed too.
    #[error("{source} (teardown also failed: {teardown})")]
    Teardown {
        /// Failure that triggered the teardown.
        source: Box<Self>,
        /// Error reported by the destroy call.
        teardown: String,
    },
}

impl<E> ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Classifies the failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Credentials(err) => err.kind(),
            Self::SshKey(err) => err.kind(),
            Self::Create { .. } => ErrorKind::Provider,
            Self::Readiness(err) => err.kind(),
            Self::Injection(err) => err.kind(),
            Self::Teardown { source, .. } => source.kind(),
        }
    }

    /// Process exit code conventionally reported for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}
