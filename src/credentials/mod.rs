//! Credential resolution for provider adapters.
//!
//! Every declared credential is looked up in three places, first hit wins:
//! the credential environment, the provider's JSON config file, and finally
//! an interactive prompt. Prompted values are written back to the config
//! file once the provider has accepted them. When a validator rejects the
//! resolved set, the values are unset from the environment so a stale
//! secret never leaks into a later attempt.

mod env;
mod prompt;
mod store;

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::AdapterFuture;
use crate::error::ErrorKind;

pub use env::CredentialEnv;
pub use prompt::{LineReader, NonInteractive, PromptError, TerminalLineReader};
pub use store::{CREDENTIAL_FILE_MODE, CredentialStore, JsonCredentialStore, StoreError};

/// One named secret: where it lives in the environment and in the config
/// file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CredentialSpec {
    /// Environment variable checked first.
    pub env_var: String,
    /// Field name inside the provider's JSON config file.
    pub config_field: String,
    /// Prompt shown when neither source has a value.
    pub prompt: String,
}

impl CredentialSpec {
    /// Declares a credential with a default prompt.
    #[must_use]
    pub fn new(env_var: impl Into<String>, config_field: impl Into<String>) -> Self {
        let name: String = env_var.into();
        let prompt = format!("Enter {name}: ");
        Self {
            env_var: name,
            config_field: config_field.into(),
            prompt,
        }
    }

    /// Replaces the interactive prompt text.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// Credential declaration for one provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderCredentials {
    /// Provider name, also the config file stem.
    pub provider: String,
    /// Credentials the provider needs, in prompt order.
    pub specs: Vec<CredentialSpec>,
    /// Guidance shown when the provider rejects the credentials.
    pub remediation: String,
}

impl ProviderCredentials {
    /// Declares the credentials for `provider`.
    #[must_use]
    pub fn new(provider: impl Into<String>, specs: Vec<CredentialSpec>) -> Self {
        let name: String = provider.into();
        let remediation =
            format!("Check that the {name} credentials are current and have not been revoked.");
        Self {
            provider: name,
            specs,
            remediation,
        }
    }

    /// Replaces the remediation text.
    #[must_use]
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = remediation.into();
        self
    }
}

/// Where a resolved credential came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialSource {
    /// Read from the credential environment.
    Environment,
    /// Read from the provider config file.
    ConfigFile,
    /// Entered at the interactive prompt.
    Prompt,
}

#[derive(Clone, Eq, PartialEq)]
struct ResolvedCredential {
    env_var: String,
    config_field: String,
    value: String,
    source: CredentialSource,
}

/// Resolved credential values for one provider.
///
/// The `Debug` output never includes secret values.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    provider: String,
    entries: Vec<ResolvedCredential>,
}

impl Credentials {
    /// Provider the values belong to.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Value resolved for `env_var`.
    #[must_use]
    pub fn get(&self, env_var: &str) -> Option<&str> {
        self.entry(env_var).map(|entry| entry.value.as_str())
    }

    /// Source the value for `env_var` came from.
    #[must_use]
    pub fn source(&self, env_var: &str) -> Option<CredentialSource> {
        self.entry(env_var).map(|entry| entry.source)
    }

    /// `(env_var, value)` pairs in declaration order.
    #[must_use]
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.env_var.as_str(), entry.value.as_str()))
    }

    fn entry(&self, env_var: &str) -> Option<&ResolvedCredential> {
        self.entries.iter().find(|entry| entry.env_var == env_var)
    }

    fn prompted_fields(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|entry| entry.source == CredentialSource::Prompt)
            .map(|entry| (entry.config_field.clone(), entry.value.clone()))
            .collect()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for entry in &self.entries {
            list.entry(&entry.env_var, &entry.source);
        }
        list.finish()
    }
}

/// Reason a provider rejected a credential set.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ValidationFailure {
    /// Provider supplied explanation.
    pub message: String,
}

impl ValidationFailure {
    /// Wraps a provider message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Checks a credential set against the provider.
pub trait CredentialValidator {
    /// Accepts or rejects `credentials`.
    fn validate<'a>(&'a self, credentials: &'a Credentials)
    -> AdapterFuture<'a, (), ValidationFailure>;
}

/// Errors raised while resolving credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Raised when no source produced a value.
    #[error(
        "missing {env_var} for {provider}: export {env_var}, add it to {config_path}, or run \
         from an interactive terminal"
    )]
    Missing {
        /// Provider being resolved.
        provider: String,
        /// Variable that could not be resolved.
        env_var: String,
        /// Config file that was consulted.
        config_path: Utf8PathBuf,
    },
    /// Raised when the provider rejects the resolved credentials.
    #[error("{provider} rejected the credentials: {message}. {remediation}")]
    Validation {
        /// Provider being resolved.
        provider: String,
        /// Provider supplied explanation.
        message: String,
        /// Guidance for the user.
        remediation: String,
    },
    /// Raised when prompted values cannot be saved.
    #[error(
        "failed to save credentials to {path}: {message}. Check free disk space and that the \
         directory is writable."
    )]
    Persist {
        /// Config file that could not be written.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
    },
}

impl CredentialError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Missing { .. } => ErrorKind::Configuration,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Persist { .. } => ErrorKind::Filesystem,
        }
    }
}

/// Resolves provider credentials from environment, config file and prompt.
#[derive(Clone, Debug)]
pub struct CredentialResolver<S, R> {
    store: S,
    reader: R,
}

impl<S: CredentialStore, R: LineReader> CredentialResolver<S, R> {
    /// Builds a resolver over `store` and `reader`.
    #[must_use]
    pub const fn new(store: S, reader: R) -> Self {
        Self { store, reader }
    }

    /// Backing credential store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Resolves every credential `provider` declares and exports the values
    /// into `env`.
    ///
    /// Prompted values are persisted before returning.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`] when a credential has no source,
    /// or [`CredentialError::Persist`] when prompted values cannot be saved.
    pub fn resolve(
        &self,
        env: &mut CredentialEnv,
        provider: &ProviderCredentials,
    ) -> Result<Credentials, CredentialError> {
        let credentials = self.collect(env, provider)?;
        self.persist_prompted(&credentials)?;
        Ok(credentials)
    }

    /// Resolves credentials and checks them with `validator`.
    ///
    /// Prompted values are only persisted after the validator accepts them.
    /// On rejection every declared variable is unset from `env`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Validation`] when the validator rejects the
    /// set, plus the errors of [`CredentialResolver::resolve`].
    pub async fn resolve_validated<V>(
        &self,
        env: &mut CredentialEnv,
        provider: &ProviderCredentials,
        validator: &V,
    ) -> Result<Credentials, CredentialError>
    where
        V: CredentialValidator + ?Sized,
    {
        let credentials = self.collect(env, provider)?;
        if let Err(failure) = validator.validate(&credentials).await {
            for spec in &provider.specs {
                env.unset(spec.env_var.as_str());
            }
            warn!(
                provider = %provider.provider,
                "credentials rejected; cleared from environment"
            );
            return Err(CredentialError::Validation {
                provider: provider.provider.clone(),
                message: failure.message,
                remediation: provider.remediation.clone(),
            });
        }
        self.persist_prompted(&credentials)?;
        Ok(credentials)
    }

    fn collect(
        &self,
        env: &mut CredentialEnv,
        provider: &ProviderCredentials,
    ) -> Result<Credentials, CredentialError> {
        let name = provider.provider.as_str();
        let mut entries = Vec::with_capacity(provider.specs.len());

        if provider.specs.iter().all(|spec| env.is_set(&spec.env_var)) {
            for spec in &provider.specs {
                info!(provider = name, env_var = %spec.env_var, "using environment");
                let value = env.get(&spec.env_var).unwrap_or_default();
                entries.push(resolved(spec, value, CredentialSource::Environment));
            }
            return Ok(Credentials {
                provider: provider.provider.clone(),
                entries,
            });
        }

        for spec in &provider.specs {
            let (value, source) = self.resolve_one(env, name, spec)?;
            env.set(spec.env_var.as_str(), value.as_str());
            entries.push(resolved(spec, value, source));
        }
        Ok(Credentials {
            provider: provider.provider.clone(),
            entries,
        })
    }

    fn resolve_one(
        &self,
        env: &CredentialEnv,
        provider: &str,
        spec: &CredentialSpec,
    ) -> Result<(String, CredentialSource), CredentialError> {
        if let Some(value) = env.get(&spec.env_var) {
            info!(provider, env_var = %spec.env_var, "using environment");
            return Ok((value, CredentialSource::Environment));
        }

        match self.store.read_field(provider, &spec.config_field) {
            Ok(Some(value)) => {
                info!(provider, env_var = %spec.env_var, "using config file");
                return Ok((value, CredentialSource::ConfigFile));
            }
            Ok(None) => {}
            Err(err) => warn!(provider, error = %err, "ignoring unreadable credential file"),
        }

        match self.reader.read_line(&spec.prompt) {
            Ok(value) if !value.is_empty() => {
                info!(provider, env_var = %spec.env_var, "using prompted value");
                Ok((value, CredentialSource::Prompt))
            }
            Ok(_) => Err(self.missing(provider, spec)),
            Err(err) => {
                debug!(provider, error = %err, "prompt unavailable");
                Err(self.missing(provider, spec))
            }
        }
    }

    fn missing(&self, provider: &str, spec: &CredentialSpec) -> CredentialError {
        CredentialError::Missing {
            provider: provider.to_owned(),
            env_var: spec.env_var.clone(),
            config_path: self.store.path_for(provider),
        }
    }

    fn persist_prompted(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let fields = credentials.prompted_fields();
        if fields.is_empty() {
            return Ok(());
        }
        let path = self
            .store
            .persist(&credentials.provider, &fields)
            .map_err(|err| CredentialError::Persist {
                path: self.store.path_for(&credentials.provider),
                message: err.to_string(),
            })?;
        info!(provider = %credentials.provider, path = %path, "saved credentials");
        Ok(())
    }
}

fn resolved(spec: &CredentialSpec, value: String, source: CredentialSource) -> ResolvedCredential {
    ResolvedCredential {
        env_var: spec.env_var.clone(),
        config_field: spec.config_field.clone(),
        value,
        source,
    }
}
