//! Command-line interface definitions for the `spawn` binary.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};

/// Default manifest location, relative to the working directory.
pub(crate) const DEFAULT_MANIFEST: &str = "manifest.json";

/// Top-level CLI for the `spawn` binary.
#[derive(Debug, Parser)]
#[command(
    name = "spawn",
    about = "Provision cloud instances for coding agents and inject their environment",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Resolve a user-typed agent or cloud name to its manifest key.
    #[command(
        name = "resolve",
        about = "Resolve an agent or cloud name to its manifest key"
    )]
    Resolve(ResolveCommand),
    /// Ensure the local SSH keypair exists and print its fingerprint.
    #[command(name = "key", about = "Ensure the local SSH keypair exists")]
    Key,
    /// Resolve an agent's credentials and append its environment to the
    /// local shell profile.
    #[command(
        name = "install-env",
        about = "Install an agent's environment into the local shell profile"
    )]
    InstallEnv(InstallEnvCommand),
}

/// Manifest namespace searched by `spawn resolve`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum Namespace {
    /// Agent keys.
    Agent,
    /// Cloud keys.
    Cloud,
}

/// Arguments for the `spawn resolve` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ResolveCommand {
    /// Namespace to search.
    #[arg(value_enum)]
    pub(crate) namespace: Namespace,
    /// Identifier as typed: a key or a display name, in any case.
    pub(crate) input: String,
    /// Manifest describing agents, clouds and their combinations.
    #[arg(long, env = "SPAWN_MANIFEST", value_name = "PATH", default_value = DEFAULT_MANIFEST)]
    pub(crate) manifest: Utf8PathBuf,
}

/// Arguments for the `spawn install-env` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct InstallEnvCommand {
    /// Agent whose environment template is installed.
    pub(crate) agent: String,
    /// Manifest describing agents, clouds and their combinations.
    #[arg(long, env = "SPAWN_MANIFEST", value_name = "PATH", default_value = DEFAULT_MANIFEST)]
    pub(crate) manifest: Utf8PathBuf,
}
