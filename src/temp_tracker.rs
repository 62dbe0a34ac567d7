//! Secure tracking and erasure of short-lived credential files.
//!
//! Every temporary file that holds secret material is registered with a
//! [`TempTracker`] as soon as it exists. [`TempTracker::cleanup`] drains the
//! list, overwriting each file with `shred` when the binary is available and
//! falling back to a plain delete otherwise. Cleanup runs from a
//! [`CleanupGuard`] at the top-level scope and, for interrupt and terminate
//! signals, from the trap installed by [`install_signal_trap`].

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::error::ErrorKind;

/// Default secure-deletion binary.
pub const DEFAULT_SHRED_BIN: &str = "shred";

/// Exit code used when the process is interrupted (SIGINT).
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Exit code used when the process is terminated (SIGTERM).
pub const TERMINATE_EXIT_CODE: i32 = 143;

static TRAP_INSTALLED: AtomicBool = AtomicBool::new(false);

/// How a tracked path was disposed of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Erasure {
    /// Contents were overwritten before the file was unlinked.
    Shredded,
    /// The file was unlinked without overwriting.
    Deleted,
    /// The path no longer existed.
    Missing,
}

/// Errors raised while erasing tracked paths or installing the trap.
#[derive(Debug, Error)]
pub enum TempTrackerError {
    /// Raised when a tracked path cannot be removed.
    #[error("failed to remove {path}: {message}")]
    Remove {
        /// Path that could not be removed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a tracked path has no file name component.
    #[error("tracked path {path} is not a file path")]
    NotAFile {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when the signal trap is requested outside a tokio runtime.
    #[error("signal trap requires a running tokio runtime")]
    NoRuntime,
    /// Raised when signal handlers cannot be registered.
    #[error("failed to register signal handler: {message}")]
    Signal {
        /// Operating system error string.
        message: String,
    },
}

impl TempTrackerError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Remove { .. } | Self::NotAFile { .. } => ErrorKind::Filesystem,
            Self::NoRuntime | Self::Signal { .. } => ErrorKind::Configuration,
        }
    }
}

/// Process-wide list of paths that must be destroyed before exit.
#[derive(Debug)]
pub struct TempTracker<R: CommandRunner = ProcessCommandRunner> {
    paths: Mutex<Vec<Utf8PathBuf>>,
    runner: R,
    shred_bin: String,
}

impl TempTracker<ProcessCommandRunner> {
    /// Builds a tracker that shells out to the system `shred`.
    #[must_use]
    pub fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner, DEFAULT_SHRED_BIN)
    }
}

impl Default for TempTracker<ProcessCommandRunner> {
    fn default() -> Self {
        Self::with_process_runner()
    }
}

impl<R: CommandRunner> TempTracker<R> {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(runner: R, shred_bin: impl Into<String>) -> Self {
        Self {
            paths: Mutex::new(Vec::new()),
            runner,
            shred_bin: shred_bin.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Utf8PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `path` for destruction.
    pub fn track(&self, path: impl Into<Utf8PathBuf>) {
        let tracked = path.into();
        debug!(path = %tracked, "tracking temporary file");
        self.lock().push(tracked);
    }

    /// Returns a snapshot of the tracked paths.
    #[must_use]
    pub fn tracked(&self) -> Vec<Utf8PathBuf> {
        self.lock().clone()
    }

    /// Erases `path` immediately and stops tracking it.
    ///
    /// When erasure fails the path stays tracked so exit cleanup retries it.
    ///
    /// # Errors
    ///
    /// Returns [`TempTrackerError`] when the file cannot be removed.
    pub fn release(&self, path: &Utf8Path) -> Result<Erasure, TempTrackerError> {
        self.lock().retain(|tracked| tracked != path);
        erase(&self.runner, &self.shred_bin, path).inspect_err(|_| {
            self.lock().push(path.to_path_buf());
        })
    }

    /// Erases every tracked path and returns `exit_code` unchanged.
    ///
    /// The list is drained, so a second call is a no-op. Paths that no longer
    /// exist are skipped silently; other failures are logged.
    pub fn cleanup(&self, exit_code: i32) -> i32 {
        let drained = mem::take(&mut *self.lock());
        for path in drained {
            match erase(&self.runner, &self.shred_bin, &path) {
                Ok(erasure) => debug!(path = %path, ?erasure, "erased temporary file"),
                Err(err) => warn!(path = %path, error = %err, "failed to erase temporary file"),
            }
        }
        exit_code
    }

    /// Returns a guard that runs [`TempTracker::cleanup`] when dropped.
    #[must_use]
    pub const fn guard(&self) -> CleanupGuard<'_, R> {
        CleanupGuard { tracker: self }
    }
}

/// Runs tracker cleanup when the enclosing scope ends, on both success and
/// error paths.
#[derive(Debug)]
pub struct CleanupGuard<'a, R: CommandRunner> {
    tracker: &'a TempTracker<R>,
}

impl<R: CommandRunner> Drop for CleanupGuard<'_, R> {
    fn drop(&mut self) {
        self.tracker.cleanup(0);
    }
}

/// Installs interrupt and terminate handlers that run `tracker` cleanup and
/// exit with the conventional signal exit code.
///
/// Only the first call per process installs handlers; later calls return
/// `Ok(false)`.
///
/// # Errors
///
/// Returns [`TempTrackerError::NoRuntime`] outside a tokio runtime, or
/// [`TempTrackerError::Signal`] when registration fails.
pub fn install_signal_trap<R>(tracker: Arc<TempTracker<R>>) -> Result<bool, TempTrackerError>
where
    R: CommandRunner + Send + Sync + 'static,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|_| TempTrackerError::NoRuntime)?;
    if TRAP_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let streams = {
        let _entered = handle.enter();
        signal(SignalKind::interrupt()).and_then(|interrupt| {
            signal(SignalKind::terminate()).map(|terminate| (interrupt, terminate))
        })
    };
    let (mut interrupt, mut terminate) = streams.map_err(|err| {
        TRAP_INSTALLED.store(false, Ordering::SeqCst);
        TempTrackerError::Signal {
            message: err.to_string(),
        }
    })?;

    handle.spawn(async move {
        let code = tokio::select! {
            _ = interrupt.recv() => INTERRUPT_EXIT_CODE,
            _ = terminate.recv() => TERMINATE_EXIT_CODE,
        };
        warn!(code, "received termination signal; erasing temporary files");
        let exit_code = tracker.cleanup(code);
        std::process::exit(exit_code);
    });
    Ok(true)
}

fn erase<R: CommandRunner>(
    runner: &R,
    shred_bin: &str,
    path: &Utf8Path,
) -> Result<Erasure, TempTrackerError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| TempTrackerError::NotAFile {
        path: path.to_path_buf(),
    })?;

    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Erasure::Missing),
        Err(err) => {
            return Err(TempTrackerError::Remove {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    if !dir.try_exists(file_name).unwrap_or(false) {
        return Ok(Erasure::Missing);
    }

    let shred_args = [
        std::ffi::OsString::from("-u"),
        std::ffi::OsString::from("-z"),
        std::ffi::OsString::from("--"),
        std::ffi::OsString::from(path.as_str()),
    ];
    match runner.run(shred_bin, &shred_args) {
        Ok(output) if output.is_success() && !dir.try_exists(file_name).unwrap_or(true) => {
            return Ok(Erasure::Shredded);
        }
        Ok(output) => debug!(
            path = %path,
            status = %output.status_text(),
            "shred did not remove file; falling back to delete"
        ),
        Err(err) => debug!(path = %path, error = %err, "shred unavailable; falling back to delete"),
    }

    match dir.remove_file(file_name) {
        Ok(()) => Ok(Erasure::Deleted),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Erasure::Missing),
        Err(err) => Err(TempTrackerError::Remove {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}
