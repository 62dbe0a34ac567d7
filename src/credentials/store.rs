//! Per-provider JSON credential files.
//!
//! Each provider owns `<config_dir>/<provider>.json`, a flat JSON object
//! holding only the credential fields that provider declares. Writes merge
//! into the existing object and leave the file readable by its owner only.

use std::collections::BTreeMap;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{
    ambient_authority,
    fs_utf8::{Dir, OpenOptions, OpenOptionsExt, Permissions, PermissionsExt},
};
use serde_json::{Map, Value};
use thiserror::Error;

/// Mode applied to credential files.
pub const CREDENTIAL_FILE_MODE: u32 = 0o600;

/// Errors raised while reading or writing credential files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when an existing file is not a JSON object.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Abstraction over credential persistence for dependency injection.
pub trait CredentialStore {
    /// Location of the credential file for `provider`.
    fn path_for(&self, provider: &str) -> Utf8PathBuf;

    /// Reads the string stored under `field` for `provider`.
    ///
    /// Missing files, missing fields, empty strings and non-string values
    /// all read as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file exists but cannot be read or
    /// parsed.
    fn read_field(&self, provider: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Merges `values` into the credential file for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the directory or file cannot be written.
    fn persist(
        &self,
        provider: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<Utf8PathBuf, StoreError>;
}

/// Stores credentials as JSON files under a fixed directory.
#[derive(Clone, Debug)]
pub struct JsonCredentialStore {
    dir: Utf8PathBuf,
}

impl JsonCredentialStore {
    /// Builds a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the credential files.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn load(&self, path: &Utf8Path) -> Result<Option<Map<String, Value>>, StoreError> {
        let dir = match Dir::open_ambient_dir(&self.dir, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.dir, &err)),
        };
        let file_name = file_name(path)?;
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(Some(Map::new()));
        }
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(StoreError::Parse {
                path: path.to_path_buf(),
                message: String::from("credential file root is not a JSON object"),
            }),
            Err(err) => Err(StoreError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }
}

impl CredentialStore for JsonCredentialStore {
    fn path_for(&self, provider: &str) -> Utf8PathBuf {
        self.dir.join(format!("{provider}.json"))
    }

    fn read_field(&self, provider: &str, field: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(provider);
        let Some(map) = self.load(&path)? else {
            return Ok(None);
        };
        Ok(map
            .get(field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_owned))
    }

    fn persist(
        &self,
        provider: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<Utf8PathBuf, StoreError> {
        let path = self.path_for(provider);
        let mut map = self.load(&path)?.unwrap_or_default();
        for (field, value) in values {
            map.insert(field.clone(), Value::String(value.clone()));
        }
        let rendered =
            serde_json::to_string_pretty(&Value::Object(map)).map_err(|err| StoreError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?;
        write_private(&self.dir, &path, rendered.as_bytes())?;
        Ok(path)
    }
}

fn write_private(dir_path: &Utf8Path, path: &Utf8Path, contents: &[u8]) -> Result<(), StoreError> {
    Dir::create_ambient_dir_all(dir_path, ambient_authority())
        .map_err(|err| io_error(dir_path, &err))?;
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|err| io_error(dir_path, &err))?;
    let file_name = file_name(path)?;

    let mut options = OpenOptions::new();
    options
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CREDENTIAL_FILE_MODE);
    let mut file = dir
        .open_with(file_name, &options)
        .map_err(|err| io_error(path, &err))?;
    // An existing file keeps its old mode on open, so tighten it explicitly.
    dir.set_permissions(file_name, Permissions::from_mode(CREDENTIAL_FILE_MODE))
        .map_err(|err| io_error(path, &err))?;
    file.write_all(contents)
        .and_then(|()| file.flush())
        .map_err(|err| io_error(path, &err))
}

fn file_name(path: &Utf8Path) -> Result<&str, StoreError> {
    path.file_name().ok_or_else(|| StoreError::Io {
        path: path.to_path_buf(),
        message: String::from("credential file path is missing a filename"),
    })
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
