//! Binary entry point for the Spawn CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::info;

use spawn::command::ProcessCommandRunner;
use spawn::credentials::{
    CredentialEnv, CredentialError, CredentialResolver, CredentialSpec, ProviderCredentials,
    TerminalLineReader,
};
use spawn::identifier::{Manifest, ManifestError};
use spawn::inject::{InjectError, LocalTransport};
use spawn::ssh_key::{SshKeyError, SshKeyManager};
use spawn::temp_tracker::{TempTracker, TempTrackerError, install_signal_trap};
use spawn::{ConfigError, ErrorKind, SpawnConfig, logging};

mod cli;

use cli::{Cli, InstallEnvCommand, Namespace, ResolveCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    SshKey(#[from] SshKeyError),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error(transparent)]
    TempTracker(#[from] TempTrackerError),
}

impl CliError {
    const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(err) => err.kind(),
            Self::Manifest(err) => err.kind(),
            Self::Credentials(err) => err.kind(),
            Self::SshKey(err) => err.kind(),
            Self::Inject(err) => err.kind(),
            Self::TempTracker(err) => err.kind(),
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init_logging().ok();
    let cli = Cli::parse();
    let exit_code = match dispatch(&cli).await {
        Ok(line) => {
            writeln!(io::stdout(), "{line}").ok();
            0
        }
        Err(err) => {
            report_error(&err);
            err.kind().exit_code()
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: &Cli) -> Result<String, CliError> {
    match cli {
        Cli::Resolve(command) => resolve_identifier(command),
        Cli::Key => ensure_key(),
        Cli::InstallEnv(command) => install_env(command).await,
    }
}

fn resolve_identifier(command: &ResolveCommand) -> Result<String, CliError> {
    let manifest = Manifest::load(&command.manifest)?;
    let key = match command.namespace {
        Namespace::Agent => manifest.lookup_agent(&command.input)?,
        Namespace::Cloud => manifest.lookup_cloud(&command.input)?,
    };
    Ok(key.to_owned())
}

fn load_config() -> Result<SpawnConfig, CliError> {
    let config = SpawnConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn ensure_key() -> Result<String, CliError> {
    let config = load_config()?;
    let manager = SshKeyManager::new(ProcessCommandRunner, config.ssh_keygen_bin.as_str());
    let identity = manager.ensure(&config.ssh_key_file())?;
    Ok(format!(
        "{} {}",
        identity.fingerprint, identity.public_key_path
    ))
}

async fn install_env(command: &InstallEnvCommand) -> Result<String, CliError> {
    let config = load_config()?;
    let manifest = Manifest::load(&command.manifest)?;
    let agent = manifest.lookup_agent(&command.agent)?;

    let tracker = Arc::new(TempTracker::new(
        ProcessCommandRunner,
        config.shred_bin.as_str(),
    ));
    install_signal_trap(Arc::clone(&tracker))?;
    let _cleanup = tracker.guard();

    let mut env = CredentialEnv::process();
    CredentialResolver::new(config.credential_store(), TerminalLineReader)
        .resolve(&mut env, &agent_credentials(&manifest, agent))?;
    let pairs = manifest.agent_env(agent, &env)?;
    config
        .env_injector()
        .inject(
            tracker.as_ref(),
            &LocalTransport::new(ProcessCommandRunner),
            &pairs,
        )
        .await?;

    info!(agent, count = pairs.len(), "agent environment installed");
    Ok(format!(
        "installed {} variable(s) for {agent} into {}",
        pairs.len(),
        config.shell_profile
    ))
}

/// Credentials referenced by `agent`'s env template, stored under the
/// agent's key with lower-cased field names.
fn agent_credentials(manifest: &Manifest, agent: &str) -> ProviderCredentials {
    let specs = manifest
        .required_env(agent)
        .into_iter()
        .map(|name| {
            let field = name.to_ascii_lowercase();
            CredentialSpec::new(name, field)
        })
        .collect();
    ProviderCredentials::new(agent, specs)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    const MANIFEST: &str = r#"{
        "agents": {
            "claude": {
                "name": "Claude Code",
                "env": {
                    "ANTHROPIC_BASE_URL": "https://openrouter.ai/api",
                    "ANTHROPIC_AUTH_TOKEN": "${OPENROUTER_API_KEY}"
                }
            },
            "aider": { "name": "Aider", "env": {} }
        },
        "clouds": {
            "hetzner": { "name": "Hetzner Cloud" },
            "sprite": { "name": "Sprite" }
        },
        "matrix": { "hetzner/claude": "implemented" }
    }"#;

    struct ManifestFile {
        _dir: TempDir,
        path: Utf8PathBuf,
    }

    #[fixture]
    fn manifest_file() -> ManifestFile {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("manifest.json"))
            .expect("utf-8 temp path");
        fs::write(&path, MANIFEST).expect("write manifest");
        ManifestFile { _dir: dir, path }
    }

    fn resolve_command(file: &ManifestFile, namespace: Namespace, input: &str) -> ResolveCommand {
        ResolveCommand {
            namespace,
            input: input.to_owned(),
            manifest: file.path.clone(),
        }
    }

    #[rstest]
    #[case::exact_agent(Namespace::Agent, "claude", "claude")]
    #[case::display_name(Namespace::Agent, "claude code", "claude")]
    #[case::cloud_case(Namespace::Cloud, "HETZNER", "hetzner")]
    fn resolve_prints_canonical_key(
        manifest_file: ManifestFile,
        #[case] namespace: Namespace,
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        let key = resolve_identifier(&resolve_command(&manifest_file, namespace, input))
            .expect("identifier resolves");

        assert_eq!(key, expected);
    }

    #[rstest]
    fn resolve_reports_suggestion(manifest_file: ManifestFile) {
        let err = resolve_identifier(&resolve_command(&manifest_file, Namespace::Agent, "claud"))
            .expect_err("no exact match");

        assert_eq!(err.to_string(), "unknown agent 'claud'; did you mean 'claude'?");
        assert_eq!(err.kind().exit_code(), 2);
    }

    #[rstest]
    fn resolve_does_not_cross_namespaces(manifest_file: ManifestFile) {
        let err = resolve_identifier(&resolve_command(&manifest_file, Namespace::Cloud, "claude"))
            .expect_err("agent key is not a cloud");

        assert!(
            matches!(err, CliError::Manifest(ManifestError::UnknownCloud { .. })),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn missing_manifest_is_a_filesystem_failure() {
        let command = ResolveCommand {
            namespace: Namespace::Agent,
            input: String::from("claude"),
            manifest: Utf8PathBuf::from("/nonexistent/spawn/manifest.json"),
        };

        let err = resolve_identifier(&command).expect_err("manifest is absent");

        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert_eq!(err.kind().exit_code(), 1);
    }

    #[rstest]
    fn agent_credentials_follow_env_template(manifest_file: ManifestFile) {
        let manifest = Manifest::load(&manifest_file.path).expect("manifest loads");

        let credentials = agent_credentials(&manifest, "claude");

        assert_eq!(credentials.provider, "claude");
        let names: Vec<_> = credentials
            .specs
            .iter()
            .map(|spec| (spec.env_var.as_str(), spec.config_field.as_str()))
            .collect();
        assert_eq!(names, vec![("OPENROUTER_API_KEY", "openrouter_api_key")]);
    }

    #[test]
    fn cli_parses_resolve_arguments() {
        let cli = Cli::try_parse_from([
            "spawn",
            "resolve",
            "cloud",
            "Hetzner Cloud",
            "--manifest",
            "/srv/manifest.json",
        ])
        .expect("arguments parse");

        let Cli::Resolve(command) = cli else {
            panic!("expected resolve subcommand");
        };
        assert_eq!(command.namespace, Namespace::Cloud);
        assert_eq!(command.input, "Hetzner Cloud");
        assert_eq!(command.manifest, Utf8PathBuf::from("/srv/manifest.json"));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buffer = Vec::new();
        let err = CliError::Config(ConfigError::Invalid(String::from("poll delay must be positive")));

        write_error(&mut buffer, &err);

        assert_eq!(
            String::from_utf8(buffer).expect("utf-8 output"),
            "invalid configuration: poll delay must be positive\n"
        );
    }
}
