//! Engine configuration loading via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::RetryPolicy;
use crate::credentials::JsonCredentialStore;
use crate::error::ErrorKind;
use crate::inject::{EnvInjector, SshOptions};

/// Settings shared by every provider adapter, merged from defaults,
/// `spawn.toml`, and `SPAWN_*` environment variables.
#[derive(Clone, Debug, Deserialize, Serialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SPAWN",
    discovery(
        app_name = "spawn",
        env_var = "SPAWN_CONFIG_PATH",
        config_file_name = "spawn.toml",
        dotfile_name = ".spawn.toml",
        project_file_name = "spawn.toml"
    )
)]
pub struct SpawnConfig {
    /// Directory holding per-provider credential files.
    #[ortho_config(default = "~/.config/spawn".to_owned())]
    pub config_dir: String,
    /// Private key used for instance access.
    #[ortho_config(default = "~/.ssh/id_ed25519".to_owned())]
    pub ssh_key_path: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Path to the `shred` executable.
    #[ortho_config(default = "shred".to_owned())]
    pub shred_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Seconds between readiness checks.
    #[ortho_config(default = 5)]
    pub poll_delay_secs: u64,
    /// Readiness checks before giving up.
    #[ortho_config(default = 60)]
    pub max_poll_attempts: u32,
    /// Initial pause before retrying a rate-limited call.
    #[ortho_config(default = 2)]
    pub retry_base_secs: u64,
    /// Ceiling for the escalating retry pause.
    #[ortho_config(default = 30)]
    pub retry_max_secs: u64,
    /// Attempts for retryable provider calls, including the first.
    #[ortho_config(default = 5)]
    pub retry_max_attempts: u32,
    /// Shell profile receiving injected variables.
    #[ortho_config(default = "~/.zshrc".to_owned())]
    pub shell_profile: String,
    /// Remote staging path for the environment payload.
    #[ortho_config(default = "/tmp/env_config".to_owned())]
    pub remote_env_path: String,
    /// Local directory for temporary payload files. Uses the system
    /// temporary directory when unset.
    pub temp_dir: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl SpawnConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to spawn.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: set {} or {} in spawn.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("spawn")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is blank or a count is
    /// zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.config_dir,
                FieldMetadata::new("credential directory", "SPAWN_CONFIG_DIR", "config_dir"),
            ),
            (
                &self.ssh_key_path,
                FieldMetadata::new("SSH key path", "SPAWN_SSH_KEY_PATH", "ssh_key_path"),
            ),
            (
                &self.ssh_keygen_bin,
                FieldMetadata::new("ssh-keygen binary", "SPAWN_SSH_KEYGEN_BIN", "ssh_keygen_bin"),
            ),
            (
                &self.shred_bin,
                FieldMetadata::new("shred binary", "SPAWN_SHRED_BIN", "shred_bin"),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh binary", "SPAWN_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.scp_bin,
                FieldMetadata::new("scp binary", "SPAWN_SCP_BIN", "scp_bin"),
            ),
            (
                &self.ssh_user,
                FieldMetadata::new("SSH user", "SPAWN_SSH_USER", "ssh_user"),
            ),
            (
                &self.shell_profile,
                FieldMetadata::new("shell profile", "SPAWN_SHELL_PROFILE", "shell_profile"),
            ),
            (
                &self.remote_env_path,
                FieldMetadata::new(
                    "remote env staging path",
                    "SPAWN_REMOTE_ENV_PATH",
                    "remote_env_path",
                ),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }
        if let Some(dir) = &self.temp_dir {
            Self::require_field(
                dir,
                &FieldMetadata::new("temporary directory", "SPAWN_TEMP_DIR", "temp_dir"),
            )?;
        }

        let positive = [
            (
                self.poll_delay_secs,
                FieldMetadata::new("poll delay", "SPAWN_POLL_DELAY_SECS", "poll_delay_secs"),
            ),
            (
                u64::from(self.max_poll_attempts),
                FieldMetadata::new(
                    "poll attempt count",
                    "SPAWN_MAX_POLL_ATTEMPTS",
                    "max_poll_attempts",
                ),
            ),
            (
                u64::from(self.retry_max_attempts),
                FieldMetadata::new(
                    "retry attempt count",
                    "SPAWN_RETRY_MAX_ATTEMPTS",
                    "retry_max_attempts",
                ),
            ),
        ];
        for (value, metadata) in &positive {
            Self::require_positive(*value, metadata)?;
        }
        Ok(())
    }

    /// Credential directory with `~` expanded.
    #[must_use]
    pub fn config_dir_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_home(&self.config_dir))
    }

    /// SSH private key path with `~` expanded.
    #[must_use]
    pub fn ssh_key_file(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_home(&self.ssh_key_path))
    }

    /// Local staging directory for payload files.
    #[must_use]
    pub fn temp_dir_path(&self) -> Utf8PathBuf {
        self.temp_dir.as_deref().map_or_else(
            || {
                Utf8PathBuf::from_path_buf(std::env::temp_dir())
                    .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
            },
            |dir| Utf8PathBuf::from(expand_home(dir)),
        )
    }

    /// Pause between readiness checks.
    #[must_use]
    pub const fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.poll_delay_secs)
    }

    /// Retry spacing for retryable provider calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_base_secs),
            Duration::from_secs(self.retry_max_secs),
            self.retry_max_attempts,
        )
    }

    /// Credential store rooted at the configured directory.
    #[must_use]
    pub fn credential_store(&self) -> JsonCredentialStore {
        JsonCredentialStore::new(self.config_dir_path())
    }

    /// Injector staging payloads in the configured directories.
    #[must_use]
    pub fn env_injector(&self) -> EnvInjector {
        EnvInjector::new(self.temp_dir_path())
            .with_remote_path(self.remote_env_path.as_str())
            .with_shell_profile(self.shell_profile.as_str())
    }

    /// SSH settings authenticating with the configured key.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            user: self.ssh_user.clone(),
            identity_file: Some(self.ssh_key_file()),
            ..SshOptions::default()
        }
    }
}

/// Expands a leading `~/` to the user's home directory.
///
/// The input is returned unchanged when no home directory is known.
#[must_use]
pub fn expand_home(path: &str) -> String {
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home.to_string_lossy().into_owned();
    }
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::credentials::CredentialStore;

    #[fixture]
    fn config() -> SpawnConfig {
        SpawnConfig {
            config_dir: String::from("/etc/spawn"),
            ssh_key_path: String::from("/keys/id_ed25519"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            shred_bin: String::from("shred"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            ssh_user: String::from("root"),
            poll_delay_secs: 5,
            max_poll_attempts: 60,
            retry_base_secs: 2,
            retry_max_secs: 30,
            retry_max_attempts: 5,
            shell_profile: String::from("~/.zshrc"),
            remote_env_path: String::from("/tmp/env_config"),
            temp_dir: Some(String::from("/var/tmp")),
        }
    }

    #[rstest]
    fn valid_config_passes(config: SpawnConfig) {
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    #[case::ssh_user(|cfg: &mut SpawnConfig| cfg.ssh_user = String::from(" "), "SPAWN_SSH_USER", "ssh_user")]
    #[case::config_dir(|cfg: &mut SpawnConfig| cfg.config_dir = String::new(), "SPAWN_CONFIG_DIR", "config_dir")]
    #[case::temp_dir(|cfg: &mut SpawnConfig| cfg.temp_dir = Some(String::new()), "SPAWN_TEMP_DIR", "temp_dir")]
    #[case::poll(|cfg: &mut SpawnConfig| cfg.max_poll_attempts = 0, "SPAWN_MAX_POLL_ATTEMPTS", "max_poll_attempts")]
    #[case::delay(|cfg: &mut SpawnConfig| cfg.poll_delay_secs = 0, "SPAWN_POLL_DELAY_SECS", "poll_delay_secs")]
    fn validation_names_env_var_and_key(
        mut config: SpawnConfig,
        #[case] mutate: fn(&mut SpawnConfig),
        #[case] env_var: &str,
        #[case] toml_key: &str,
    ) {
        mutate(&mut config);
        let message = config.validate().expect_err("invalid config").to_string();
        assert!(message.contains(env_var), "{message}");
        assert!(message.contains(toml_key), "{message}");
        assert!(message.contains("spawn.toml"), "{message}");
    }

    #[rstest]
    fn derived_settings_follow_fields(config: SpawnConfig) {
        assert_eq!(config.poll_delay(), Duration::from_secs(5));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(30), 5)
        );
        assert_eq!(config.temp_dir_path(), Utf8PathBuf::from("/var/tmp"));
        assert_eq!(
            config.credential_store().path_for("hetzner"),
            Utf8PathBuf::from("/etc/spawn/hetzner.json")
        );
        let ssh = config.ssh_options();
        assert_eq!(ssh.identity_file, Some(Utf8PathBuf::from("/keys/id_ed25519")));
        assert_eq!(ssh.port, 22);
    }

    #[test]
    fn expand_home_only_touches_tilde_prefix() {
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        assert_eq!(expand_home("relative/~"), "relative/~");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/.ssh/id_ed25519"),
                format!("{}/.ssh/id_ed25519", home.to_string_lossy())
            );
        }
    }
}
