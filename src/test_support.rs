//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use thiserror::Error;

use crate::adapter::{AdapterFuture, InstanceHandle, ProviderAdapter};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::credentials::{
    CredentialStore, CredentialValidator, Credentials, LineReader, PromptError,
    ProviderCredentials, StoreError, ValidationFailure,
};
use crate::inject::{PayloadTransport, TransportError};
use crate::poller::{PollTarget, ProbeError, StatusProbe};
use crate::ssh_key::{Fingerprint, KeyRegistrar, RegistrarError, SshIdentity};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Line reader that replays queued answers and records the prompts shown.
///
/// Once the queue is empty it behaves like a detached terminal.
#[derive(Clone, Debug, Default)]
pub struct ScriptedReader {
    answers: Arc<Mutex<VecDeque<Result<String, PromptError>>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedReader {
    /// Creates a reader with `answers` queued in order.
    #[must_use]
    pub fn with_answers<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reader = Self::default();
        for answer in answers {
            reader.push_answer(answer);
        }
        reader
    }

    /// Queues a typed answer.
    pub fn push_answer(&self, answer: impl Into<String>) {
        lock(&self.answers).push_back(Ok(answer.into()));
    }

    /// Queues a prompt failure.
    pub fn push_error(&self, err: PromptError) {
        lock(&self.answers).push_back(Err(err));
    }

    /// Prompts shown so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl LineReader for ScriptedReader {
    fn read_line(&self, prompt: &str) -> Result<String, PromptError> {
        lock(&self.prompts).push(prompt.to_owned());
        lock(&self.answers)
            .pop_front()
            .unwrap_or(Err(PromptError::NotInteractive))
    }
}

/// In-memory credential store recording reads and writes.
#[derive(Clone, Debug, Default)]
pub struct MemoryCredentialStore {
    files: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
    reads: Arc<Mutex<Vec<(String, String)>>>,
    persisted: Arc<Mutex<Vec<(String, BTreeMap<String, String>)>>>,
    unreadable: Arc<Mutex<bool>>,
}

impl MemoryCredentialStore {
    /// Seeds `field` for `provider`.
    pub fn insert(&self, provider: &str, field: &str, value: &str) {
        lock(&self.files)
            .entry(provider.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
    }

    /// Makes every read fail as if the file were corrupt.
    pub fn make_unreadable(&self) {
        *lock(&self.unreadable) = true;
    }

    /// `(provider, field)` pairs read so far.
    #[must_use]
    pub fn reads(&self) -> Vec<(String, String)> {
        lock(&self.reads).clone()
    }

    /// Batches written so far.
    #[must_use]
    pub fn persisted(&self) -> Vec<(String, BTreeMap<String, String>)> {
        lock(&self.persisted).clone()
    }

    /// Current stored value of `field` for `provider`.
    #[must_use]
    pub fn stored(&self, provider: &str, field: &str) -> Option<String> {
        lock(&self.files)
            .get(provider)
            .and_then(|fields| fields.get(field))
            .cloned()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn path_for(&self, provider: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/memory/{provider}.json"))
    }

    fn read_field(&self, provider: &str, field: &str) -> Result<Option<String>, StoreError> {
        lock(&self.reads).push((provider.to_owned(), field.to_owned()));
        if *lock(&self.unreadable) {
            return Err(StoreError::Parse {
                path: self.path_for(provider),
                message: String::from("expected value at line 1 column 1"),
            });
        }
        Ok(self.stored(provider, field).filter(|value| !value.is_empty()))
    }

    fn persist(
        &self,
        provider: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<Utf8PathBuf, StoreError> {
        lock(&self.persisted).push((provider.to_owned(), values.clone()));
        lock(&self.files)
            .entry(provider.to_owned())
            .or_default()
            .extend(values.clone());
        Ok(self.path_for(provider))
    }
}

/// Validator that accepts everything until told to reject.
#[derive(Clone, Debug, Default)]
pub struct StaticValidator {
    rejection: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<usize>>,
}

impl StaticValidator {
    /// Validator that rejects every credential set with `message`.
    #[must_use]
    pub fn rejecting(message: impl Into<String>) -> Self {
        let validator = Self::default();
        validator.reject(message);
        validator
    }

    /// Starts rejecting with `message`.
    pub fn reject(&self, message: impl Into<String>) {
        *lock(&self.rejection) = Some(message.into());
    }

    /// Number of validations performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

impl CredentialValidator for StaticValidator {
    fn validate<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> AdapterFuture<'a, (), ValidationFailure> {
        Box::pin(async move {
            *lock(&self.calls) += 1;
            lock(&self.rejection)
                .clone()
                .map_or(Ok(()), |message| Err(ValidationFailure::new(message)))
        })
    }
}

/// Status probe replaying scripted responses.
///
/// The final response repeats once the script is exhausted.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    responses: Arc<Mutex<VecDeque<Result<String, ProbeError>>>>,
    last: Arc<Mutex<Option<Result<String, ProbeError>>>>,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedProbe {
    /// Creates a probe returning `responses` in order.
    #[must_use]
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ProbeError>>,
    {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            ..Self::default()
        }
    }

    /// Number of fetches performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }

    fn next_response(&self) -> Result<String, ProbeError> {
        *lock(&self.calls) += 1;
        let mut last = lock(&self.last);
        if let Some(response) = lock(&self.responses).pop_front() {
            *last = Some(response);
        }
        last.clone()
            .unwrap_or_else(|| Err(ProbeError::new("no scripted status available")))
    }
}

impl StatusProbe for ScriptedProbe {
    fn fetch(&self) -> AdapterFuture<'_, String, ProbeError> {
        Box::pin(async move { self.next_response() })
    }
}

/// Renders a flat `{"status": .., "ip": ..}` status document.
#[must_use]
pub fn status_document(status: &str, ip: &str) -> String {
    json!({ "status": status, "ip": ip }).to_string()
}

/// Key registrar keeping registered fingerprints in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistrar {
    registered: Arc<Mutex<BTreeSet<String>>>,
    register_calls: Arc<Mutex<usize>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MemoryRegistrar {
    /// Registrar that already knows `fingerprints`.
    #[must_use]
    pub fn with_registered<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registrar = Self::default();
        lock(&registrar.registered).extend(
            fingerprints
                .into_iter()
                .map(|value| Fingerprint::new(value).as_str().to_owned()),
        );
        registrar
    }

    /// Makes every registration fail with `message`.
    pub fn fail_registration(&self, message: impl Into<String>) {
        *lock(&self.failure) = Some(message.into());
    }

    /// Number of registration attempts.
    #[must_use]
    pub fn register_calls(&self) -> usize {
        *lock(&self.register_calls)
    }

    /// Fingerprints currently registered.
    #[must_use]
    pub fn registered(&self) -> Vec<String> {
        lock(&self.registered).iter().cloned().collect()
    }
}

impl KeyRegistrar for MemoryRegistrar {
    fn is_registered<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> AdapterFuture<'a, bool, RegistrarError> {
        Box::pin(async move { Ok(lock(&self.registered).contains(fingerprint.as_str())) })
    }

    fn register<'a>(&'a self, identity: &'a SshIdentity) -> AdapterFuture<'a, (), RegistrarError> {
        Box::pin(async move {
            *lock(&self.register_calls) += 1;
            if let Some(message) = lock(&self.failure).clone() {
                return Err(RegistrarError::new(message));
            }
            lock(&self.registered).insert(identity.fingerprint.as_str().to_owned());
            Ok(())
        })
    }
}

/// Payload captured by [`RecordingTransport`] at upload time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadRecord {
    /// Local payload path.
    pub local: Utf8PathBuf,
    /// Remote destination.
    pub remote: String,
    /// File contents when uploaded.
    pub contents: String,
    /// Unix mode bits when uploaded.
    pub mode: u32,
}

/// Transport that records uploads and commands instead of sending them.
#[derive(Clone, Debug, Default)]
pub struct RecordingTransport {
    uploads: Arc<Mutex<Vec<UploadRecord>>>,
    commands: Arc<Mutex<Vec<String>>>,
    upload_failure: Arc<Mutex<Option<String>>>,
    run_failure: Arc<Mutex<Option<String>>>,
}

impl RecordingTransport {
    /// Makes every upload fail with `message`.
    pub fn fail_uploads(&self, message: impl Into<String>) {
        *lock(&self.upload_failure) = Some(message.into());
    }

    /// Makes every command fail with `message`.
    pub fn fail_runs(&self, message: impl Into<String>) {
        *lock(&self.run_failure) = Some(message.into());
    }

    /// Uploads recorded so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadRecord> {
        lock(&self.uploads).clone()
    }

    /// Commands recorded so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    fn capture(local: &Utf8Path, remote: &str) -> Result<UploadRecord, TransportError> {
        let contents = std::fs::read_to_string(local)
            .map_err(|err| TransportError::new(format!("read {local}: {err}")))?;
        let mode = std::fs::metadata(local)
            .map_err(|err| TransportError::new(format!("stat {local}: {err}")))?
            .permissions()
            .mode();
        Ok(UploadRecord {
            local: local.to_path_buf(),
            remote: remote.to_owned(),
            contents,
            mode,
        })
    }
}

impl PayloadTransport for RecordingTransport {
    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> AdapterFuture<'a, (), TransportError> {
        Box::pin(async move {
            if let Some(message) = lock(&self.upload_failure).clone() {
                return Err(TransportError::new(message));
            }
            let record = Self::capture(local, remote)?;
            lock(&self.uploads).push(record);
            Ok(())
        })
    }

    fn run<'a>(&'a self, command: &'a str) -> AdapterFuture<'a, (), TransportError> {
        Box::pin(async move {
            if let Some(message) = lock(&self.run_failure).clone() {
                return Err(TransportError::new(message));
            }
            lock(&self.commands).push(command.to_owned());
            Ok(())
        })
    }
}

/// Error returned by [`FakeAdapter`] create and destroy calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct FakeProviderError {
    /// Failure description.
    pub message: String,
    /// Whether the engine may retry the call.
    pub retryable: bool,
}

impl FakeProviderError {
    /// Error the engine should retry, such as rate limiting.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Error the engine should surface immediately.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// In-memory provider adapter for exercising the provisioning flow.
///
/// Status documents use the flat layout of [`status_document`] with a
/// target status of `running`.
#[derive(Clone, Debug)]
pub struct FakeAdapter {
    credentials: ProviderCredentials,
    validator: StaticValidator,
    registrar: MemoryRegistrar,
    probe: ScriptedProbe,
    transport: RecordingTransport,
    uses_ssh_keys: bool,
    ip_env_var: Option<String>,
    max_poll_attempts: u32,
    create_failures: Arc<Mutex<VecDeque<FakeProviderError>>>,
    create_calls: Arc<Mutex<usize>>,
    destroy_failure: Arc<Mutex<Option<String>>>,
    destroyed: Arc<Mutex<Vec<String>>>,
}

impl FakeAdapter {
    /// Adapter declaring `credentials` whose instance is ready on the first
    /// poll at `192.0.2.10`.
    #[must_use]
    pub fn new(credentials: ProviderCredentials) -> Self {
        Self {
            credentials,
            validator: StaticValidator::default(),
            registrar: MemoryRegistrar::default(),
            probe: ScriptedProbe::new([Ok(status_document("running", "192.0.2.10"))]),
            transport: RecordingTransport::default(),
            uses_ssh_keys: true,
            ip_env_var: None,
            max_poll_attempts: 5,
            create_failures: Arc::default(),
            create_calls: Arc::default(),
            destroy_failure: Arc::default(),
            destroyed: Arc::default(),
        }
    }

    /// Replaces the scripted status responses.
    #[must_use]
    pub fn with_statuses<I>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ProbeError>>,
    {
        self.probe = ScriptedProbe::new(responses);
        self
    }

    /// Marks the provider as not using SSH keys (sandbox style).
    #[must_use]
    pub const fn without_ssh_keys(mut self) -> Self {
        self.uses_ssh_keys = false;
        self
    }

    /// Exports the ready address under `name`.
    #[must_use]
    pub fn with_ip_env_var(mut self, name: impl Into<String>) -> Self {
        self.ip_env_var = Some(name.into());
        self
    }

    /// Overrides the poll attempt budget.
    #[must_use]
    pub const fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Queues a failure for the next create call.
    pub fn fail_create(&self, err: FakeProviderError) {
        lock(&self.create_failures).push_back(err);
    }

    /// Makes destroy calls fail with `message`.
    pub fn fail_destroy(&self, message: impl Into<String>) {
        *lock(&self.destroy_failure) = Some(message.into());
    }

    /// Validator consulted by the adapter.
    #[must_use]
    pub const fn validator(&self) -> &StaticValidator {
        &self.validator
    }

    /// Registrar consulted by the adapter.
    #[must_use]
    pub const fn registrar(&self) -> &MemoryRegistrar {
        &self.registrar
    }

    /// Transport handed out for ready instances.
    #[must_use]
    pub const fn recorded_transport(&self) -> &RecordingTransport {
        &self.transport
    }

    /// Number of status fetches.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.probe.calls()
    }

    /// Number of create calls, including failed ones.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        *lock(&self.create_calls)
    }

    /// Instance ids passed to destroy.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }
}

impl CredentialValidator for FakeAdapter {
    fn validate<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> AdapterFuture<'a, (), ValidationFailure> {
        self.validator.validate(credentials)
    }
}

impl KeyRegistrar for FakeAdapter {
    fn is_registered<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> AdapterFuture<'a, bool, RegistrarError> {
        self.registrar.is_registered(fingerprint)
    }

    fn register<'a>(&'a self, identity: &'a SshIdentity) -> AdapterFuture<'a, (), RegistrarError> {
        self.registrar.register(identity)
    }
}

impl ProviderAdapter for FakeAdapter {
    type Error = FakeProviderError;
    type Transport = RecordingTransport;

    fn credentials(&self) -> &ProviderCredentials {
        &self.credentials
    }

    fn uses_ssh_keys(&self) -> bool {
        self.uses_ssh_keys
    }

    fn ip_env_var(&self) -> Option<&str> {
        self.ip_env_var.as_deref()
    }

    fn is_retryable(&self, error: &Self::Error) -> bool {
        error.retryable
    }

    fn create<'a>(
        &'a self,
        _credentials: &'a Credentials,
        _identity: Option<&'a SshIdentity>,
    ) -> AdapterFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            let attempt = {
                let mut calls = lock(&self.create_calls);
                *calls += 1;
                *calls
            };
            if let Some(err) = lock(&self.create_failures).pop_front() {
                return Err(err);
            }
            Ok(InstanceHandle::new(
                format!("fake-{attempt}"),
                format!("spawn-fake-{attempt}"),
            ))
        })
    }

    fn poll_target(&self, handle: &InstanceHandle) -> PollTarget {
        PollTarget::new(format!("server {}", handle.label), "running", "status", "ip")
            .with_poll_delay(Duration::from_secs(5))
            .with_max_attempts(self.max_poll_attempts)
    }

    fn fetch_status<'a>(
        &'a self,
        _handle: &'a InstanceHandle,
    ) -> AdapterFuture<'a, String, ProbeError> {
        self.probe.fetch()
    }

    fn transport(&self, _handle: &InstanceHandle, _ip: &str) -> Self::Transport {
        self.transport.clone()
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> AdapterFuture<'a, (), Self::Error> {
        Box::pin(async move {
            lock(&self.destroyed).push(handle.id.clone());
            lock(&self.destroy_failure)
                .clone()
                .map_or(Ok(()), |message| Err(FakeProviderError::fatal(message)))
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
