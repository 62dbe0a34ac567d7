//! Fixtures and the provisioning harness for lifecycle scenarios.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::ScenarioState;
use spawn::backoff::RetryPolicy;
use spawn::credentials::{
    CredentialEnv, CredentialResolver, CredentialSpec, ProviderCredentials,
};
use spawn::inject::EnvInjector;
use spawn::ssh_key::SshKeyManager;
use spawn::test_support::{FakeAdapter, MemoryCredentialStore, ScriptedReader, ScriptedRunner};
use spawn::{ErrorKind, Provisioner, ProvisioningContext, TempTracker};
use tempfile::TempDir;
use tokio::runtime::Builder;

const FINGERPRINT_LINE: &str = "256 MD5:3b:9f:aa:01 spawn (ED25519)\n";

/// Observable result of one provisioning run.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub ip: Option<String>,
    pub message: Option<String>,
    pub kind: Option<ErrorKind>,
    pub exit_code: i32,
    pub staged_files: usize,
}

#[derive(Default, ScenarioState)]
pub struct ProvisioningState {
    pub adapter: Slot<FakeAdapter>,
    pub outcome: Slot<Outcome>,
}

impl ProvisioningState {
    /// Applies `update` to the configured adapter.
    pub fn rebuild_adapter(&self, update: impl FnOnce(FakeAdapter) -> FakeAdapter) {
        let adapter = self
            .adapter
            .take()
            .unwrap_or_else(|| panic!("adapter should be configured first"));
        self.adapter.set(update(adapter));
    }

    /// Runs `check` against the configured adapter.
    pub fn with_adapter<R>(&self, check: impl FnOnce(&FakeAdapter) -> R) -> R {
        self.adapter
            .with_ref(check)
            .unwrap_or_else(|| panic!("adapter should be configured first"))
    }

    /// Outcome recorded by the provisioning step.
    pub fn outcome(&self) -> Outcome {
        self.outcome
            .get()
            .unwrap_or_else(|| panic!("provisioning should have run"))
    }
}

#[fixture]
pub fn provisioning_state() -> ProvisioningState {
    ProvisioningState::default()
}

pub fn hetzner_adapter() -> FakeAdapter {
    FakeAdapter::new(ProviderCredentials::new(
        "hetzner",
        vec![CredentialSpec::new("HCLOUD_TOKEN", "api_token")],
    ))
    .with_ip_env_var("HETZNER_SERVER_IP")
}

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("create temp dir: {err}"));
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
        for sub in ["keys", "staging"] {
            fs::create_dir_all(root.join(sub))
                .unwrap_or_else(|err| panic!("create {sub} dir: {err}"));
        }
        fs::write(root.join("keys/id_ed25519"), "private")
            .unwrap_or_else(|err| panic!("write private key: {err}"));
        fs::write(root.join("keys/id_ed25519.pub"), "ssh-ed25519 AAAA spawn\n")
            .unwrap_or_else(|err| panic!("write public key: {err}"));
        Self { _dir: dir, root }
    }

    fn staged_files(&self) -> usize {
        fs::read_dir(self.root.join("staging"))
            .unwrap_or_else(|err| panic!("read staging dir: {err}"))
            .count()
    }
}

/// Provisions through `adapter` on a paused clock and records the outcome.
pub fn run_provisioning(adapter: &FakeAdapter) -> Outcome {
    let workspace = Workspace::new();
    let keygen = ScriptedRunner::new();
    keygen.push_output(Some(0), FINGERPRINT_LINE, "");
    let provisioner = Provisioner::new(
        CredentialResolver::new(MemoryCredentialStore::default(), ScriptedReader::default()),
        SshKeyManager::new(keygen, "ssh-keygen"),
        workspace.root.join("keys/id_ed25519"),
        EnvInjector::new(workspace.root.join("staging")),
    )
    .with_retry_policy(RetryPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(4),
        3,
    ));
    let mut ctx = ProvisioningContext::new(
        CredentialEnv::from_pairs([("HCLOUD_TOKEN", "tok-123")]),
        Arc::new(TempTracker::new(ScriptedRunner::new(), "shred")),
    );
    let payload = vec![(String::from("OPENROUTER_API_KEY"), String::from("sk-or-1"))];

    let runtime = Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap_or_else(|err| panic!("build runtime: {err}"));
    let result = runtime.block_on(provisioner.provision(adapter, &mut ctx, &payload));

    let (ip, message, kind, code) = match result {
        Ok(provisioned) => (Some(provisioned.ip), None, None, 0),
        Err(err) => (
            None,
            Some(err.to_string()),
            Some(err.kind()),
            err.exit_code(),
        ),
    };
    let exit_code = ctx.tracker().cleanup(code);
    Outcome {
        ip,
        message,
        kind,
        exit_code,
        staged_files: workspace.staged_files(),
    }
}
