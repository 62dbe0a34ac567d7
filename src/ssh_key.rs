//! SSH keypair lifecycle.
//!
//! [`SshKeyManager::ensure`] makes sure a local ed25519 keypair exists and
//! reports its MD5 fingerprint; [`ensure_registered`] registers the public
//! key with a provider at most once per fingerprint.

use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info};

use crate::adapter::AdapterFuture;
use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};
use crate::error::ErrorKind;

/// Default key generation binary.
pub const DEFAULT_SSH_KEYGEN_BIN: &str = "ssh-keygen";

/// Comment embedded in generated keys.
pub const DEFAULT_KEY_COMMENT: &str = "spawn";

const FILESYSTEM_REMEDIATION: &str =
    "Check free disk space and that the directory is writable by the current user.";

/// Hex-encoded MD5 fingerprint of a public key, without the `MD5:` prefix.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a fingerprint string, dropping any `MD5:` prefix.
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        let raw = value.as_ref().trim();
        Self(raw.strip_prefix("MD5:").unwrap_or(raw).to_owned())
    }

    /// Fingerprint text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local keypair ready for registration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshIdentity {
    /// Private key path.
    pub private_key: Utf8PathBuf,
    /// Public key path.
    pub public_key_path: Utf8PathBuf,
    /// Public key in OpenSSH format.
    pub public_key: String,
    /// Fingerprint of the public key.
    pub fingerprint: Fingerprint,
}

/// Error reported by a provider key registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct RegistrarError {
    /// Provider message.
    pub message: String,
}

impl RegistrarError {
    /// Wraps a provider message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Whether the provider reported the key as already present.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        let lowered = self.message.to_lowercase();
        lowered.contains("already exists")
            || lowered.contains("already in use")
            || lowered.contains("duplicate")
    }
}

/// Provider-side SSH key registry.
pub trait KeyRegistrar {
    /// Reports whether a key with `fingerprint` is registered.
    fn is_registered<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> AdapterFuture<'a, bool, RegistrarError>;

    /// Registers `identity` with the provider.
    fn register<'a>(&'a self, identity: &'a SshIdentity) -> AdapterFuture<'a, (), RegistrarError>;
}

/// How [`ensure_registered`] concluded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registration {
    /// The provider already listed the fingerprint.
    AlreadyRegistered,
    /// The key was registered by this call.
    Registered,
    /// Registration raced with another client and the provider reported a
    /// duplicate.
    AlreadyPresent,
}

/// Errors raised while preparing or registering SSH keys.
#[derive(Debug, Error)]
pub enum SshKeyError {
    /// Raised when key files or directories cannot be accessed.
    #[error("cannot access {path}: {message}. {remediation}")]
    Filesystem {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
        /// Suggested fix.
        remediation: String,
    },
    /// Raised when `ssh-keygen` fails to generate or derive a key.
    #[error("failed to generate SSH key at {path}: {message}. {remediation}")]
    Generate {
        /// Target private key path.
        path: Utf8PathBuf,
        /// Command failure text.
        message: String,
        /// Suggested fix.
        remediation: String,
    },
    /// Raised when the fingerprint cannot be computed.
    #[error("failed to fingerprint {path}: {message}")]
    Fingerprint {
        /// Public key path.
        path: Utf8PathBuf,
        /// Failure description.
        message: String,
    },
    /// Raised when the provider rejects the lookup or registration.
    #[error("SSH key registration failed: {source}")]
    Registration {
        /// Provider error.
        #[from]
        source: RegistrarError,
    },
}

impl SshKeyError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Filesystem { .. } | Self::Generate { .. } | Self::Fingerprint { .. } => {
                ErrorKind::Filesystem
            }
            Self::Registration { .. } => ErrorKind::Provider,
        }
    }

    fn filesystem(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Filesystem {
            path: path.to_path_buf(),
            message: err.to_string(),
            remediation: String::from(FILESYSTEM_REMEDIATION),
        }
    }
}

/// Creates and fingerprints local keypairs with `ssh-keygen`.
#[derive(Clone, Debug)]
pub struct SshKeyManager<R: CommandRunner = ProcessCommandRunner> {
    runner: R,
    keygen_bin: String,
    comment: String,
}

impl SshKeyManager<ProcessCommandRunner> {
    /// Manager using the system `ssh-keygen`.
    #[must_use]
    pub fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner, DEFAULT_SSH_KEYGEN_BIN)
    }
}

impl<R: CommandRunner> SshKeyManager<R> {
    /// Creates a manager over `runner`.
    #[must_use]
    pub fn new(runner: R, keygen_bin: impl Into<String>) -> Self {
        Self {
            runner,
            keygen_bin: keygen_bin.into(),
            comment: String::from(DEFAULT_KEY_COMMENT),
        }
    }

    /// Overrides the comment embedded in generated keys.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Ensures a keypair exists at `key_path` and returns its identity.
    ///
    /// A missing private key is generated without a passphrase. A missing
    /// public key is derived from the private key.
    ///
    /// # Errors
    ///
    /// Returns [`SshKeyError`] when key files cannot be created or read, or
    /// when `ssh-keygen` fails.
    pub fn ensure(&self, key_path: &Utf8Path) -> Result<SshIdentity, SshKeyError> {
        let public_key_path = Utf8PathBuf::from(format!("{key_path}.pub"));
        let (dir, private_name) = open_key_dir(key_path)?;
        let public_name = format!("{private_name}.pub");

        if exists(&dir, private_name, key_path)? {
            debug!(path = %key_path, "reusing existing SSH key");
        } else {
            info!(path = %key_path, "generating SSH key");
            self.generate(key_path)?;
        }

        if !exists(&dir, &public_name, &public_key_path)? {
            info!(path = %public_key_path, "deriving missing public key");
            let output = self
                .runner
                .run_checked(
                    &self.keygen_bin,
                    &[
                        OsString::from("-y"),
                        OsString::from("-f"),
                        OsString::from(key_path.as_str()),
                    ],
                )
                .map_err(|err| generate_error(key_path, &err))?;
            dir.write(&public_name, output.stdout.as_bytes())
                .map_err(|err| SshKeyError::filesystem(&public_key_path, &err))?;
        }

        let public_key = dir
            .read_to_string(&public_name)
            .map_err(|err| SshKeyError::filesystem(&public_key_path, &err))?
            .trim()
            .to_owned();
        let fingerprint = self.fingerprint(&public_key_path)?;

        Ok(SshIdentity {
            private_key: key_path.to_path_buf(),
            public_key_path,
            public_key,
            fingerprint,
        })
    }

    /// Computes the MD5 fingerprint of the public key at `public_key_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SshKeyError::Fingerprint`] when `ssh-keygen` fails or
    /// prints an unexpected line.
    pub fn fingerprint(&self, public_key_path: &Utf8Path) -> Result<Fingerprint, SshKeyError> {
        let output = self
            .runner
            .run_checked(
                &self.keygen_bin,
                &[
                    OsString::from("-l"),
                    OsString::from("-E"),
                    OsString::from("md5"),
                    OsString::from("-f"),
                    OsString::from(public_key_path.as_str()),
                ],
            )
            .map_err(|err| SshKeyError::Fingerprint {
                path: public_key_path.to_path_buf(),
                message: err.to_string(),
            })?;
        parse_fingerprint(&output.stdout).ok_or_else(|| SshKeyError::Fingerprint {
            path: public_key_path.to_path_buf(),
            message: format!("unexpected ssh-keygen output: {}", output.stdout.trim()),
        })
    }

    fn generate(&self, key_path: &Utf8Path) -> Result<(), SshKeyError> {
        let args = [
            OsString::from("-t"),
            OsString::from("ed25519"),
            OsString::from("-f"),
            OsString::from(key_path.as_str()),
            OsString::from("-N"),
            OsString::new(),
            OsString::from("-q"),
            OsString::from("-C"),
            OsString::from(self.comment.as_str()),
        ];
        self.runner
            .run_checked(&self.keygen_bin, &args)
            .map(|_| ())
            .map_err(|err| generate_error(key_path, &err))
    }
}

/// Registers `identity` unless the provider already knows its fingerprint.
///
/// Duplicate responses from the provider count as success.
///
/// # Errors
///
/// Returns [`SshKeyError::Registration`] when the lookup fails or the
/// provider rejects the key for another reason.
pub async fn ensure_registered<K>(
    registrar: &K,
    identity: &SshIdentity,
) -> Result<Registration, SshKeyError>
where
    K: KeyRegistrar + ?Sized,
{
    if registrar.is_registered(&identity.fingerprint).await? {
        debug!(fingerprint = %identity.fingerprint, "SSH key already registered");
        return Ok(Registration::AlreadyRegistered);
    }

    match registrar.register(identity).await {
        Ok(()) => {
            info!(fingerprint = %identity.fingerprint, "registered SSH key");
            Ok(Registration::Registered)
        }
        Err(err) if err.is_duplicate() => {
            info!(fingerprint = %identity.fingerprint, "SSH key registered concurrently");
            Ok(Registration::AlreadyPresent)
        }
        Err(err) => Err(SshKeyError::Registration { source: err }),
    }
}

fn parse_fingerprint(stdout: &str) -> Option<Fingerprint> {
    stdout
        .split_whitespace()
        .nth(1)
        .filter(|token| token.contains(':'))
        .map(Fingerprint::new)
}

fn generate_error(key_path: &Utf8Path, err: &CommandError) -> SshKeyError {
    SshKeyError::Generate {
        path: key_path.to_path_buf(),
        message: err.to_string(),
        remediation: String::from(FILESYSTEM_REMEDIATION),
    }
}

fn open_key_dir(key_path: &Utf8Path) -> Result<(Dir, &str), SshKeyError> {
    let parent = key_path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = key_path
        .file_name()
        .ok_or_else(|| SshKeyError::Filesystem {
            path: key_path.to_path_buf(),
            message: String::from("key path is missing a filename"),
            remediation: String::from("Point the key path at a file, not a directory."),
        })?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| SshKeyError::filesystem(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| SshKeyError::filesystem(parent, &err))?;
    Ok((dir, file_name))
}

fn exists(dir: &Dir, name: &str, path: &Utf8Path) -> Result<bool, SshKeyError> {
    dir.try_exists(name)
        .map_err(|err| SshKeyError::filesystem(path, &err))
}
