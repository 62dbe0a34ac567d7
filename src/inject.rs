//! Environment injection into a ready instance.
//!
//! The payload is a shell-sourceable file with one `export NAME='value'`
//! line per variable. It is written to an owner-only temporary file that is
//! registered with the [`TempTracker`] before any transport call runs, then
//! uploaded and appended to the target's shell profile.

use std::ffi::OsString;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{
    ambient_authority,
    fs_utf8::{Dir, OpenOptions, OpenOptionsExt},
};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::AdapterFuture;
use crate::command::CommandRunner;
use crate::error::ErrorKind;
use crate::temp_tracker::TempTracker;

/// Default remote staging path for the payload.
pub const DEFAULT_REMOTE_ENV_PATH: &str = "/tmp/env_config";

/// Default shell profile receiving the payload.
pub const DEFAULT_SHELL_PROFILE: &str = "~/.zshrc";

const PAYLOAD_FILE_MODE: u32 = 0o600;

/// Error reported by a payload transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    /// Failure description.
    pub message: String,
}

impl TransportError {
    /// Wraps a failure description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Moves the payload to its target and runs commands there.
pub trait PayloadTransport {
    /// Copies `local` to `remote` on the target.
    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> AdapterFuture<'a, (), TransportError>;

    /// Runs `command` through a shell on the target.
    fn run<'a>(&'a self, command: &'a str) -> AdapterFuture<'a, (), TransportError>;
}

/// Errors raised while injecting environment variables.
#[derive(Debug, Error)]
pub enum InjectError {
    /// Raised when a variable name is not a valid shell identifier.
    #[error("invalid environment variable name '{name}'")]
    InvalidName {
        /// Offending name.
        name: String,
    },
    /// Raised when the local payload file cannot be written.
    #[error(
        "failed to write {path}: {message}. Check free disk space and that the temporary \
         directory is writable."
    )]
    TempFile {
        /// Payload path.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
    },
    /// Raised when the upload fails.
    #[error("failed to upload environment to {remote}: {source}")]
    Upload {
        /// Remote staging path.
        remote: String,
        /// Transport failure.
        source: TransportError,
    },
    /// Raised when appending the payload to the shell profile fails.
    #[error("failed to activate environment: {source}")]
    Activate {
        /// Transport failure.
        source: TransportError,
    },
}

impl InjectError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. } => ErrorKind::Configuration,
            Self::TempFile { .. } => ErrorKind::Filesystem,
            Self::Upload { .. } | Self::Activate { .. } => ErrorKind::Provider,
        }
    }
}

/// Renders `pairs` as `export NAME='value'` lines.
///
/// Single quotes inside values are written as `'\''` so the value survives
/// sourcing unchanged.
///
/// # Errors
///
/// Returns [`InjectError::InvalidName`] when a name is not a shell
/// identifier.
pub fn build_env_payload<K, V>(pairs: &[(K, V)]) -> Result<String, InjectError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut payload = String::new();
    for (key, value) in pairs {
        let name = key.as_ref();
        if !is_identifier(name) {
            return Err(InjectError::InvalidName {
                name: name.to_owned(),
            });
        }
        let quoted = value.as_ref().replace('\'', r"'\''");
        payload.push_str(&format!("export {name}='{quoted}'\n"));
    }
    Ok(payload)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|rest| rest == '_' || rest.is_ascii_alphanumeric())
}

/// Writes, uploads and activates environment payloads.
#[derive(Clone, Debug)]
pub struct EnvInjector {
    temp_dir: Utf8PathBuf,
    remote_path: String,
    shell_profile: String,
}

impl EnvInjector {
    /// Creates an injector staging payloads in `temp_dir`.
    #[must_use]
    pub fn new(temp_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            remote_path: String::from(DEFAULT_REMOTE_ENV_PATH),
            shell_profile: String::from(DEFAULT_SHELL_PROFILE),
        }
    }

    /// Overrides the remote staging path.
    #[must_use]
    pub fn with_remote_path(mut self, remote_path: impl Into<String>) -> Self {
        self.remote_path = remote_path.into();
        self
    }

    /// Overrides the shell profile receiving the payload.
    #[must_use]
    pub fn with_shell_profile(mut self, shell_profile: impl Into<String>) -> Self {
        self.shell_profile = shell_profile.into();
        self
    }

    /// Command appending the staged payload to the profile.
    ///
    /// The staged copy is removed even when the append fails, and the
    /// append's status is the command's exit status.
    #[must_use]
    pub fn activation_command(&self) -> String {
        let remote = escape(self.remote_path.as_str().into());
        format!(
            "cat {remote} >> {profile}; rc=$?; rm -f {remote}; exit $rc",
            profile = self.shell_profile
        )
    }

    /// Injects `pairs` through `transport`.
    ///
    /// The local payload is erased before returning, whether or not the
    /// transport calls succeed.
    ///
    /// # Errors
    ///
    /// Returns [`InjectError`] when the payload cannot be built or written,
    /// or when a transport call fails.
    pub async fn inject<T, R, K, V>(
        &self,
        tracker: &TempTracker<R>,
        transport: &T,
        pairs: &[(K, V)],
    ) -> Result<(), InjectError>
    where
        T: PayloadTransport + ?Sized,
        R: CommandRunner,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let payload = build_env_payload(pairs)?;
        let local = self.write_payload(tracker, &payload)?;

        let outcome = self.deliver(transport, &local).await;
        if let Err(err) = tracker.release(&local) {
            warn!(path = %local, error = %err, "payload erase deferred to exit cleanup");
        }
        if outcome.is_ok() {
            info!(count = pairs.len(), "environment injected");
        }
        outcome
    }

    async fn deliver<T>(&self, transport: &T, local: &Utf8Path) -> Result<(), InjectError>
    where
        T: PayloadTransport + ?Sized,
    {
        transport
            .upload(local, &self.remote_path)
            .await
            .map_err(|source| InjectError::Upload {
                remote: self.remote_path.clone(),
                source,
            })?;
        let command = self.activation_command();
        transport
            .run(&command)
            .await
            .map_err(|source| InjectError::Activate { source })
    }

    fn write_payload<R: CommandRunner>(
        &self,
        tracker: &TempTracker<R>,
        payload: &str,
    ) -> Result<Utf8PathBuf, InjectError> {
        let file_name = format!("spawn-env-{}", Uuid::new_v4());
        let path = self.temp_dir.join(&file_name);
        let temp_error = |message: String| InjectError::TempFile {
            path: path.clone(),
            message,
        };

        let dir = Dir::open_ambient_dir(&self.temp_dir, ambient_authority())
            .map_err(|err| temp_error(err.to_string()))?;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true).mode(PAYLOAD_FILE_MODE);
        let mut file = dir
            .open_with(&file_name, &options)
            .map_err(|err| temp_error(err.to_string()))?;
        tracker.track(path.clone());
        debug!(path = %path, "staging environment payload");

        file.write_all(payload.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| temp_error(err.to_string()))?;
        Ok(path)
    }
}

/// SSH connection settings for [`SshTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Remote user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key passed with `-i`.
    pub identity_file: Option<Utf8PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            user: String::from("root"),
            port: 22,
            identity_file: None,
        }
    }
}

/// Remote transport over `scp` and `ssh`.
#[derive(Clone, Debug)]
pub struct SshTransport<R> {
    runner: R,
    options: SshOptions,
    host: String,
}

impl<R: CommandRunner> SshTransport<R> {
    /// Creates a transport targeting `host`.
    #[must_use]
    pub fn new(runner: R, options: SshOptions, host: impl Into<String>) -> Self {
        Self {
            runner,
            options,
            host: host.into(),
        }
    }

    fn common_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(self.options.port.to_string()),
        ];
        if let Some(identity_file) = &self.options.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file.as_str()));
        }
        for option in [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.options.user, self.host)
    }

    /// Arguments passed to `scp` for an upload.
    #[must_use]
    pub fn upload_args(&self, local: &Utf8Path, remote: &str) -> Vec<OsString> {
        let mut args = self.common_options("-P");
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!("{}:{remote}", self.destination())));
        args
    }

    /// Arguments passed to `ssh` for a command.
    #[must_use]
    pub fn run_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.common_options("-p");
        args.push(OsString::from(self.destination()));
        args.push(OsString::from(command));
        args
    }
}

impl<R: CommandRunner + Send + Sync> PayloadTransport for SshTransport<R> {
    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> AdapterFuture<'a, (), TransportError> {
        Box::pin(async move {
            let args = self.upload_args(local, remote);
            run_transport(&self.runner, &self.options.scp_bin, &args)
        })
    }

    fn run<'a>(&'a self, command: &'a str) -> AdapterFuture<'a, (), TransportError> {
        Box::pin(async move {
            let args = self.run_args(command);
            run_transport(&self.runner, &self.options.ssh_bin, &args)
        })
    }
}

/// Local transport for sandboxes that share the host filesystem.
#[derive(Clone, Debug)]
pub struct LocalTransport<R> {
    runner: R,
    shell: String,
}

impl<R: CommandRunner> LocalTransport<R> {
    /// Creates a transport running commands through `sh`.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            shell: String::from("sh"),
        }
    }
}

impl<R: CommandRunner + Send + Sync> PayloadTransport for LocalTransport<R> {
    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> AdapterFuture<'a, (), TransportError> {
        Box::pin(async move {
            let args = [OsString::from(local.as_str()), OsString::from(remote)];
            run_transport(&self.runner, "cp", &args)
        })
    }

    fn run<'a>(&'a self, command: &'a str) -> AdapterFuture<'a, (), TransportError> {
        Box::pin(async move {
            let args = [OsString::from("-c"), OsString::from(command)];
            run_transport(&self.runner, &self.shell, &args)
        })
    }
}

fn run_transport<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[OsString],
) -> Result<(), TransportError> {
    runner
        .run_checked(program, args)
        .map(|_| ())
        .map_err(|err| TransportError::new(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::process::Command;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{RecordingTransport, ScriptedRunner};

    struct Staging {
        _dir: TempDir,
        root: Utf8PathBuf,
    }

    #[fixture]
    fn staging() -> Staging {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
        Staging { _dir: dir, root }
    }

    fn tracker() -> TempTracker<ScriptedRunner> {
        TempTracker::new(ScriptedRunner::new(), "shred")
    }

    #[test]
    fn payload_exports_each_pair() {
        let payload = build_env_payload(&[("OPENROUTER_API_KEY", "sk-1"), ("MODEL_ID", "x/y")])
            .expect("valid names");
        assert_eq!(
            payload,
            "export OPENROUTER_API_KEY='sk-1'\nexport MODEL_ID='x/y'\n"
        );
    }

    #[test]
    fn payload_escapes_single_quotes() {
        let payload = build_env_payload(&[("GREETING", "it's")]).expect("valid name");
        assert_eq!(payload, "export GREETING='it'\\''s'\n");
    }

    #[test]
    fn payload_values_round_trip_through_shell() {
        let value = "a'b \"c\" $HOME `id` \\n";
        let payload = build_env_payload(&[("TRICKY", value)]).expect("valid name");
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{payload}printf %s \"$TRICKY\""))
            .output()
            .expect("sh should run");
        assert_eq!(String::from_utf8_lossy(&output.stdout), value);
    }

    #[rstest]
    #[case("1ABC")]
    #[case("WITH-DASH")]
    #[case("")]
    #[case("SPACE NAME")]
    fn payload_rejects_invalid_names(#[case] name: &str) {
        let err = build_env_payload(&[(name, "v")]).expect_err("invalid name");
        assert!(matches!(err, InjectError::InvalidName { .. }));
    }

    #[test]
    fn activation_appends_then_removes() {
        let injector = EnvInjector::new("/tmp");
        assert_eq!(
            injector.activation_command(),
            "cat /tmp/env_config >> ~/.zshrc; rc=$?; rm -f /tmp/env_config; exit $rc"
        );
    }

    #[rstest]
    fn activation_removes_staged_copy_when_append_fails(staging: Staging) {
        let remote = staging.root.join("env_config");
        fs::write(&remote, "export TOKEN='abc'\n").expect("staged copy");
        let profile = staging.root.join("profile.d");
        fs::create_dir(&profile).expect("profile dir");
        let injector = EnvInjector::new(staging.root.clone())
            .with_remote_path(remote.as_str())
            .with_shell_profile(profile.as_str());

        let status = Command::new("sh")
            .arg("-c")
            .arg(injector.activation_command())
            .status()
            .expect("sh should run");

        assert!(!status.success(), "appending to a directory must fail");
        assert!(!remote.exists(), "staged copy must be removed");
    }

    #[rstest]
    #[tokio::test]
    async fn inject_uploads_private_payload_then_erases_it(staging: Staging) {
        let tracker = tracker();
        let transport = RecordingTransport::default();
        let injector = EnvInjector::new(staging.root.clone());

        injector
            .inject(&tracker, &transport, &[("TOKEN", "abc")])
            .await
            .expect("injection should succeed");

        let uploads = transport.uploads();
        let upload = uploads.first().expect("one upload");
        assert_eq!(upload.remote, DEFAULT_REMOTE_ENV_PATH);
        assert_eq!(upload.contents, "export TOKEN='abc'\n");
        assert_eq!(upload.mode & 0o777, 0o600);
        assert_eq!(
            transport.commands(),
            vec![injector.activation_command()]
        );
        assert!(!upload.local.exists());
        assert!(tracker.tracked().is_empty());
    }

    struct TrackingCheck<'t> {
        tracker: &'t TempTracker<ScriptedRunner>,
    }

    impl PayloadTransport for TrackingCheck<'_> {
        fn upload<'a>(
            &'a self,
            local: &'a Utf8Path,
            _remote: &'a str,
        ) -> AdapterFuture<'a, (), TransportError> {
            Box::pin(async move {
                if self.tracker.tracked().iter().any(|path| path == local) {
                    Err(TransportError::new("tracked"))
                } else {
                    Err(TransportError::new("untracked"))
                }
            })
        }

        fn run<'a>(&'a self, _command: &'a str) -> AdapterFuture<'a, (), TransportError> {
            Box::pin(async { Ok(()) })
        }
    }

    #[rstest]
    #[tokio::test]
    async fn payload_is_tracked_before_upload(staging: Staging) {
        let tracker = tracker();
        let transport = TrackingCheck { tracker: &tracker };
        let injector = EnvInjector::new(staging.root.clone());

        let err = injector
            .inject(&tracker, &transport, &[("TOKEN", "abc")])
            .await
            .expect_err("check transport always fails");

        assert!(
            matches!(&err, InjectError::Upload { source, .. } if source.message == "tracked"),
            "got {err:?}"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn failed_upload_still_erases_payload(staging: Staging) {
        let tracker = tracker();
        let transport = RecordingTransport::default();
        transport.fail_uploads("connection refused");
        let injector = EnvInjector::new(staging.root.clone());

        let err = injector
            .inject(&tracker, &transport, &[("TOKEN", "abc")])
            .await
            .expect_err("upload fails");

        assert!(matches!(err, InjectError::Upload { .. }), "got {err:?}");
        assert!(transport.commands().is_empty());
        let leftovers = fs::read_dir(&staging.root).expect("read dir").count();
        assert_eq!(leftovers, 0);
        assert!(tracker.tracked().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn failed_activation_still_erases_payload(staging: Staging) {
        let tracker = tracker();
        let transport = RecordingTransport::default();
        transport.fail_runs("permission denied");
        let injector = EnvInjector::new(staging.root.clone());

        let err = injector
            .inject(&tracker, &transport, &[("TOKEN", "abc")])
            .await
            .expect_err("activation fails");

        assert!(
            matches!(&err, InjectError::Activate { source } if source.message == "permission denied"),
            "got {err:?}"
        );
        assert_eq!(transport.uploads().len(), 1);
        let leftovers = fs::read_dir(&staging.root).expect("read dir").count();
        assert_eq!(leftovers, 0);
        assert!(tracker.tracked().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_temp_dir_reports_filesystem_error(staging: Staging) {
        let tracker = tracker();
        let transport = RecordingTransport::default();
        let injector = EnvInjector::new(staging.root.join("absent"));

        let err = injector
            .inject(&tracker, &transport, &[("TOKEN", "abc")])
            .await
            .expect_err("temp dir missing");

        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert!(transport.uploads().is_empty());
    }

    #[test]
    fn ssh_transport_builds_scp_and_ssh_arguments() {
        let options = SshOptions {
            identity_file: Some(Utf8PathBuf::from("/home/me/.ssh/id_ed25519")),
            port: 2222,
            ..SshOptions::default()
        };
        let transport = SshTransport::new(ScriptedRunner::new(), options, "203.0.113.5");

        let upload = transport.upload_args(Utf8Path::new("/tmp/local"), "/tmp/env_config");
        let run = transport.run_args("echo hi");

        let render = |args: &[OsString]| {
            args.iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let common = "-i /home/me/.ssh/id_ed25519 -o BatchMode=yes -o StrictHostKeyChecking=no \
                      -o UserKnownHostsFile=/dev/null";
        assert_eq!(
            render(&upload),
            format!("-P 2222 {common} /tmp/local root@203.0.113.5:/tmp/env_config")
        );
        assert_eq!(
            render(&run),
            format!("-p 2222 {common} root@203.0.113.5 echo hi")
        );
    }

    #[tokio::test]
    async fn ssh_transport_maps_failures() {
        let runner = ScriptedRunner::new();
        runner.push_failure(255);
        let transport = SshTransport::new(runner.clone(), SshOptions::default(), "host");

        let err = transport.run("true").await.expect_err("ssh fails");

        assert!(err.message.contains("255"), "{err}");
        assert_eq!(
            runner.invocations().first().map(|call| call.program.clone()),
            Some(String::from("ssh"))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn local_transport_appends_to_profile(staging: Staging) {
        let profile = staging.root.join("profile");
        let remote = staging.root.join("env_config");
        let tracker = tracker();
        let transport = LocalTransport::new(crate::command::ProcessCommandRunner);
        let injector = EnvInjector::new(staging.root.clone())
            .with_remote_path(remote.as_str())
            .with_shell_profile(profile.as_str());

        injector
            .inject(&tracker, &transport, &[("LOCAL_TOKEN", "v'1")])
            .await
            .expect("local injection succeeds");

        let contents = fs::read_to_string(&profile).expect("profile written");
        assert_eq!(contents, "export LOCAL_TOKEN='v'\\''1'\n");
        assert!(!remote.exists(), "staging copy removed");
    }
}
