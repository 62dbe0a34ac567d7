//! Top-level provisioning flow.
//!
//! [`Provisioner`] drives one provider adapter through credential
//! resolution, SSH key registration, instance creation, readiness polling
//! and environment injection. Per-attempt state (the credential environment
//! and the temporary file tracker) lives in a [`ProvisioningContext`] owned
//! by the caller, so nothing is written to the process environment.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterFuture, InstanceHandle, ProviderAdapter};
use crate::backoff::{RetryPolicy, retry};
use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::SpawnConfig;
use crate::credentials::{
    CredentialEnv, CredentialResolver, CredentialStore, JsonCredentialStore, LineReader,
    TerminalLineReader,
};
use crate::error::ProvisionError;
use crate::inject::EnvInjector;
use crate::poller::{PollTarget, ProbeError, StatusProbe, poll_until_ready};
use crate::ssh_key::{SshKeyManager, ensure_registered};
use crate::temp_tracker::{TempTracker, TempTrackerError, install_signal_trap};

/// State scoped to one provisioning attempt.
#[derive(Debug)]
pub struct ProvisioningContext<R: CommandRunner = ProcessCommandRunner> {
    env: CredentialEnv,
    tracker: Arc<TempTracker<R>>,
}

impl ProvisioningContext {
    /// Context over the process environment, shredding with `shred_bin`.
    #[must_use]
    pub fn for_process(shred_bin: &str) -> Self {
        Self::new(
            CredentialEnv::process(),
            Arc::new(TempTracker::new(ProcessCommandRunner, shred_bin)),
        )
    }
}

impl<R: CommandRunner> ProvisioningContext<R> {
    /// Builds a context from its parts.
    #[must_use]
    pub const fn new(env: CredentialEnv, tracker: Arc<TempTracker<R>>) -> Self {
        Self { env, tracker }
    }

    /// Credential environment for this attempt.
    #[must_use]
    pub const fn env(&self) -> &CredentialEnv {
        &self.env
    }

    /// Mutable credential environment for this attempt.
    pub const fn env_mut(&mut self) -> &mut CredentialEnv {
        &mut self.env
    }

    /// Temporary file tracker for this attempt.
    #[must_use]
    pub fn tracker(&self) -> &TempTracker<R> {
        &self.tracker
    }
}

impl<R> ProvisioningContext<R>
where
    R: CommandRunner + Send + Sync + 'static,
{
    /// Installs the interrupt and terminate trap for this context's tracker.
    ///
    /// # Errors
    ///
    /// Returns [`TempTrackerError`] when no runtime is active or the signal
    /// handlers cannot be registered.
    pub fn install_signal_trap(&self) -> Result<bool, TempTrackerError> {
        install_signal_trap(Arc::clone(&self.tracker))
    }
}

/// A ready instance with its environment injected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Provisioned {
    /// Instance handle returned by the adapter.
    pub handle: InstanceHandle,
    /// Address the instance reported once ready.
    pub ip: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct PollCadence {
    delay: Duration,
    max_attempts: u32,
}

/// Runs the provisioning flow for any [`ProviderAdapter`].
#[derive(Clone, Debug)]
pub struct Provisioner<S, L, K: CommandRunner = ProcessCommandRunner> {
    resolver: CredentialResolver<S, L>,
    keys: SshKeyManager<K>,
    key_path: Utf8PathBuf,
    injector: EnvInjector,
    retry: RetryPolicy,
    cadence: Option<PollCadence>,
}

impl Provisioner<JsonCredentialStore, TerminalLineReader> {
    /// Provisioner wired to the real file system, terminal and binaries.
    #[must_use]
    pub fn from_config(config: &SpawnConfig) -> Self {
        Self::new(
            CredentialResolver::new(config.credential_store(), TerminalLineReader),
            SshKeyManager::new(ProcessCommandRunner, config.ssh_keygen_bin.as_str()),
            config.ssh_key_file(),
            config.env_injector(),
        )
        .with_retry_policy(config.retry_policy())
        .with_poll_cadence(config.poll_delay(), config.max_poll_attempts)
    }
}

impl<S, L, K> Provisioner<S, L, K>
where
    S: CredentialStore,
    L: LineReader,
    K: CommandRunner,
{
    /// Assembles a provisioner from its collaborators.
    #[must_use]
    pub fn new(
        resolver: CredentialResolver<S, L>,
        keys: SshKeyManager<K>,
        key_path: impl Into<Utf8PathBuf>,
        injector: EnvInjector,
    ) -> Self {
        Self {
            resolver,
            keys,
            key_path: key_path.into(),
            injector,
            retry: RetryPolicy::default(),
            cadence: None,
        }
    }

    /// Overrides the retry policy for create calls.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the adapter's poll delay and attempt budget.
    #[must_use]
    pub const fn with_poll_cadence(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.cadence = Some(PollCadence {
            delay,
            max_attempts,
        });
        self
    }

    /// Provisions an instance and injects `payload` into it.
    ///
    /// The ready address is exported into the context's credential
    /// environment when the adapter names a variable for it. Failures after
    /// the instance exists destroy it before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] describing the first failing step.
    pub async fn provision<A, R>(
        &self,
        adapter: &A,
        ctx: &mut ProvisioningContext<R>,
        payload: &[(String, String)],
    ) -> Result<Provisioned, ProvisionError<A::Error>>
    where
        A: ProviderAdapter + Sync,
        R: CommandRunner,
    {
        let provider = adapter.credentials().provider.clone();
        let credentials = self
            .resolver
            .resolve_validated(&mut ctx.env, adapter.credentials(), adapter)
            .await?;

        let identity = if adapter.uses_ssh_keys() {
            let key = self.keys.ensure(&self.key_path)?;
            let registration = ensure_registered(adapter, &key).await?;
            debug!(provider = %provider, ?registration, "SSH key ready");
            Some(key)
        } else {
            None
        };

        let handle = retry(
            &self.retry,
            |err: &A::Error| adapter.is_retryable(err),
            |attempt| {
                debug!(provider = %provider, attempt, "creating instance");
                adapter.create(&credentials, identity.as_ref())
            },
        )
        .await
        .map_err(|source| ProvisionError::Create {
            provider: provider.clone(),
            source,
        })?;
        info!(provider = %provider, instance = %handle.label, "instance created");

        match self.finish(adapter, ctx, &handle, payload).await {
            Ok(ip) => Ok(Provisioned { handle, ip }),
            Err(err) => Err(teardown(adapter, &handle, err).await),
        }
    }

    /// Runs [`Provisioner::provision`], erases tracked files and returns the
    /// process exit code.
    #[must_use]
    pub async fn run_to_exit_code<A, R>(
        &self,
        adapter: &A,
        ctx: &mut ProvisioningContext<R>,
        payload: &[(String, String)],
    ) -> i32
    where
        A: ProviderAdapter + Sync,
        R: CommandRunner,
    {
        let code = match self.provision(adapter, ctx, payload).await {
            Ok(provisioned) => {
                info!(
                    instance = %provisioned.handle.label,
                    ip = %provisioned.ip,
                    "instance provisioned"
                );
                0
            }
            Err(err) => {
                error!(kind = %err.kind(), error = %err, "provisioning failed");
                err.exit_code()
            }
        };
        ctx.tracker.cleanup(code)
    }

    async fn finish<A, R>(
        &self,
        adapter: &A,
        ctx: &mut ProvisioningContext<R>,
        handle: &InstanceHandle,
        payload: &[(String, String)],
    ) -> Result<String, ProvisionError<A::Error>>
    where
        A: ProviderAdapter + Sync,
        R: CommandRunner,
    {
        let target = self.poll_target(adapter, handle);
        let probe = HandleProbe { adapter, handle };
        let ready = poll_until_ready(&target, &probe).await?;

        if let Some(name) = adapter.ip_env_var() {
            ctx.env.set(name, ready.ip.as_str());
        }

        let transport = adapter.transport(handle, &ready.ip);
        self.injector
            .inject(ctx.tracker(), &transport, payload)
            .await?;
        Ok(ready.ip)
    }

    fn poll_target<A: ProviderAdapter>(&self, adapter: &A, handle: &InstanceHandle) -> PollTarget {
        let mut target = adapter.poll_target(handle);
        if let Some(cadence) = self.cadence {
            target = target
                .with_poll_delay(cadence.delay)
                .with_max_attempts(cadence.max_attempts);
        }
        target
    }
}

async fn teardown<A>(
    adapter: &A,
    handle: &InstanceHandle,
    err: ProvisionError<A::Error>,
) -> ProvisionError<A::Error>
where
    A: ProviderAdapter,
{
    warn!(instance = %handle.label, error = %err, "destroying instance after failure");
    match adapter.destroy(handle).await {
        Ok(()) => err,
        Err(teardown_err) => ProvisionError::Teardown {
            source: Box::new(err),
            teardown: teardown_err.to_string(),
        },
    }
}

struct HandleProbe<'a, A> {
    adapter: &'a A,
    handle: &'a InstanceHandle,
}

impl<A: ProviderAdapter> StatusProbe for HandleProbe<'_, A> {
    fn fetch(&self) -> AdapterFuture<'_, String, ProbeError> {
        self.adapter.fetch_status(self.handle)
    }
}
