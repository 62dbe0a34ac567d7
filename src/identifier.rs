//! Agent and cloud identifier resolution.
//!
//! User input is matched against manifest keys in three ordered stages:
//! exact key, case-insensitive key, then case-insensitive display name.
//! Input is never trimmed. When nothing matches, [`suggest`] offers the
//! closest key within an edit distance of three.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use thiserror::Error;

use crate::credentials::CredentialEnv;
use crate::error::ErrorKind;

/// Largest edit distance [`suggest`] accepts.
pub const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Resolves `input` to one of `keys`.
///
/// `display_name` maps a key to its human readable name.
#[must_use]
pub fn resolve<'a, F>(input: &str, keys: &[&'a str], display_name: F) -> Option<&'a str>
where
    F: Fn(&str) -> Option<&'a str>,
{
    if let Some(key) = keys.iter().find(|key| **key == input) {
        return Some(*key);
    }
    let lowered = input.to_lowercase();
    if let Some(key) = keys.iter().find(|key| key.to_lowercase() == lowered) {
        return Some(*key);
    }
    keys.iter()
        .find(|key| display_name(key).is_some_and(|name| name.to_lowercase() == lowered))
        .copied()
}

/// Closest key to `input` by edit distance over keys and display names,
/// compared case-insensitively.
///
/// Returns `None` when the best distance exceeds
/// [`MAX_SUGGESTION_DISTANCE`]. Ties keep the earlier key.
#[must_use]
pub fn suggest<'a, F>(input: &str, keys: &[&'a str], display_name: F) -> Option<&'a str>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let lowered = input.to_lowercase();
    let mut best: Option<(usize, &'a str)> = None;
    for &key in keys {
        let key_distance = levenshtein(&lowered, &key.to_lowercase());
        let name_distance = display_name(key)
            .map_or(usize::MAX, |name| levenshtein(&lowered, &name.to_lowercase()));
        let distance = key_distance.min(name_distance);
        if best.is_none_or(|(current, _)| distance < current) {
            best = Some((distance, key));
        }
    }
    best.filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
        .map(|(_, key)| key)
}

fn levenshtein(left: &str, right: &str) -> usize {
    let right_chars: Vec<char> = right.chars().collect();
    let mut previous: Vec<usize> = (0..=right_chars.len()).collect();
    for (row, left_char) in left.chars().enumerate() {
        let mut current = Vec::with_capacity(previous.len());
        current.push(row + 1);
        for (right_char, pair) in right_chars.iter().zip(previous.windows(2)) {
            let [diagonal, above] = pair else {
                continue;
            };
            let beside = current.last().copied().unwrap_or_default();
            let substitution = diagonal + usize::from(left_char != *right_char);
            current.push(substitution.min(above + 1).min(beside + 1));
        }
        previous = current;
    }
    previous.last().copied().unwrap_or_default()
}

/// Agent entry in the manifest.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct AgentEntry {
    /// Display name.
    pub name: String,
    /// Environment template injected into the instance. Values may
    /// reference credential variables as `$VAR` or `${VAR}`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Cloud entry in the manifest.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct CloudEntry {
    /// Display name.
    pub name: String,
}

/// Implementation state of one cloud/agent combination.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MatrixStatus {
    /// The combination works.
    Implemented,
    /// The combination is not available yet.
    Missing,
}

/// Errors raised while loading or querying the manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Raised when the manifest file cannot be read.
    #[error("failed to read manifest {path}: {message}")]
    Io {
        /// Manifest path.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
    },
    /// Raised when the manifest is not valid JSON.
    #[error("failed to parse manifest: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },
    /// Raised when an agent identifier does not resolve.
    #[error("unknown agent '{input}'{}", suggestion_note(.suggestion.as_deref()))]
    UnknownAgent {
        /// Identifier as typed.
        input: String,
        /// Closest known key.
        suggestion: Option<String>,
    },
    /// Raised when a cloud identifier does not resolve.
    #[error("unknown cloud '{input}'{}", suggestion_note(.suggestion.as_deref()))]
    UnknownCloud {
        /// Identifier as typed.
        input: String,
        /// Closest known key.
        suggestion: Option<String>,
    },
    /// Raised when an agent env template references an unset variable.
    #[error("agent '{agent}' needs {variable}, which is not set")]
    MissingVariable {
        /// Agent key.
        agent: String,
        /// Referenced variable.
        variable: String,
    },
}

impl ManifestError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Filesystem,
            Self::Parse { .. }
            | Self::UnknownAgent { .. }
            | Self::UnknownCloud { .. }
            | Self::MissingVariable { .. } => ErrorKind::Configuration,
        }
    }
}

fn suggestion_note(suggestion: Option<&str>) -> String {
    suggestion
        .map(|key| format!("; did you mean '{key}'?"))
        .unwrap_or_default()
}

/// Read-only catalogue of agents, clouds and supported combinations.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Manifest {
    /// Agents keyed by canonical key.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    /// Clouds keyed by canonical key.
    #[serde(default)]
    pub clouds: BTreeMap<String, CloudEntry>,
    /// `cloud/agent` combinations and their state.
    #[serde(default)]
    pub matrix: BTreeMap<String, MatrixStatus>,
}

impl Manifest {
    /// Parses a manifest document.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Parse`] when the document is malformed.
    pub fn from_json(contents: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(contents).map_err(|err| ManifestError::Parse {
            message: err.to_string(),
        })
    }

    /// Reads and parses the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] when the file cannot be read or parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, ManifestError> {
        let io_error = |err: &io::Error| ManifestError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        };
        let parent = path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path.file_name().ok_or_else(|| ManifestError::Io {
            path: path.to_path_buf(),
            message: String::from("manifest path is missing a filename"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(&err))?;
        let contents = dir.read_to_string(file_name).map_err(|err| io_error(&err))?;
        Self::from_json(&contents)
    }

    fn agent_keys(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    fn cloud_keys(&self) -> Vec<&str> {
        self.clouds.keys().map(String::as_str).collect()
    }

    /// Resolves `input` among agent keys only.
    #[must_use]
    pub fn resolve_agent(&self, input: &str) -> Option<&str> {
        resolve(input, &self.agent_keys(), |key| {
            self.agents.get(key).map(|entry| entry.name.as_str())
        })
    }

    /// Resolves `input` among cloud keys only.
    #[must_use]
    pub fn resolve_cloud(&self, input: &str) -> Option<&str> {
        resolve(input, &self.cloud_keys(), |key| {
            self.clouds.get(key).map(|entry| entry.name.as_str())
        })
    }

    /// Closest agent key to `input`.
    #[must_use]
    pub fn suggest_agent(&self, input: &str) -> Option<&str> {
        suggest(input, &self.agent_keys(), |key| {
            self.agents.get(key).map(|entry| entry.name.as_str())
        })
    }

    /// Closest cloud key to `input`.
    #[must_use]
    pub fn suggest_cloud(&self, input: &str) -> Option<&str> {
        suggest(input, &self.cloud_keys(), |key| {
            self.clouds.get(key).map(|entry| entry.name.as_str())
        })
    }

    /// Resolves an agent or reports it unknown with a suggestion.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnknownAgent`] on a miss.
    pub fn lookup_agent(&self, input: &str) -> Result<&str, ManifestError> {
        self.resolve_agent(input)
            .ok_or_else(|| ManifestError::UnknownAgent {
                input: input.to_owned(),
                suggestion: self.suggest_agent(input).map(str::to_owned),
            })
    }

    /// Resolves a cloud or reports it unknown with a suggestion.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnknownCloud`] on a miss.
    pub fn lookup_cloud(&self, input: &str) -> Result<&str, ManifestError> {
        self.resolve_cloud(input)
            .ok_or_else(|| ManifestError::UnknownCloud {
                input: input.to_owned(),
                suggestion: self.suggest_cloud(input).map(str::to_owned),
            })
    }

    /// Whether `agent` is available on `cloud`.
    #[must_use]
    pub fn is_implemented(&self, cloud: &str, agent: &str) -> bool {
        self.matrix.get(&format!("{cloud}/{agent}")) == Some(&MatrixStatus::Implemented)
    }

    /// Variables referenced by `agent`'s env template.
    #[must_use]
    pub fn required_env(&self, agent: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .get(agent)
            .into_iter()
            .flat_map(|entry| entry.env.values())
            .map(String::as_str)
            .flat_map(references)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Expands `agent`'s env template against `env`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnknownAgent`] for an unknown key, or
    /// [`ManifestError::MissingVariable`] when a referenced variable is
    /// unset.
    pub fn agent_env(
        &self,
        agent: &str,
        env: &CredentialEnv,
    ) -> Result<Vec<(String, String)>, ManifestError> {
        let entry = self
            .agents
            .get(agent)
            .ok_or_else(|| ManifestError::UnknownAgent {
                input: agent.to_owned(),
                suggestion: self.suggest_agent(agent).map(str::to_owned),
            })?;
        entry
            .env
            .iter()
            .map(|(name, template)| {
                expand(template, |variable| env.get(variable))
                    .map(|value| (name.clone(), value))
                    .map_err(|variable| ManifestError::MissingVariable {
                        agent: agent.to_owned(),
                        variable,
                    })
            })
            .collect()
    }
}

enum Piece {
    Literal(char),
    Variable(String),
}

fn tokenize(template: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(current) = chars.next() {
        if current != '$' {
            pieces.push(Piece::Literal(current));
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();
        let mut name = String::new();
        if let Some(first) = chars.next_if(|c| *c == '_' || c.is_ascii_alphabetic()) {
            name.push(first);
            while let Some(next) = chars.next_if(|c| *c == '_' || c.is_ascii_alphanumeric()) {
                name.push(next);
            }
        }
        let closed = !braced || chars.next_if_eq(&'}').is_some();
        if name.is_empty() || !closed {
            pieces.push(Piece::Literal('$'));
            if braced {
                pieces.push(Piece::Literal('{'));
            }
            pieces.extend(name.chars().map(Piece::Literal));
        } else {
            pieces.push(Piece::Variable(name));
        }
    }
    pieces
}

fn references(template: &str) -> Vec<String> {
    tokenize(template)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Variable(name) => Some(name),
            Piece::Literal(_) => None,
        })
        .collect()
}

fn expand<F>(template: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut expanded = String::new();
    for piece in tokenize(template) {
        match piece {
            Piece::Literal(c) => expanded.push(c),
            Piece::Variable(name) => match lookup(&name) {
                Some(value) => expanded.push_str(&value),
                None => return Err(name),
            },
        }
    }
    Ok(expanded)
}
