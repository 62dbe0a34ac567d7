//! Credential environment scoped to a single provisioning attempt.

use std::collections::BTreeMap;
use std::env;

/// Source consulted when the overlay holds no entry for a name.
#[derive(Clone, Debug, Default)]
enum BaseEnv {
    #[default]
    Process,
    Fixed(BTreeMap<String, String>),
}

/// Environment view used for credential lookups and exports.
///
/// Reads fall through to the process environment (or a fixed map) unless
/// the name has been set or unset on this value. Writes never touch the
/// process environment; callers hand [`CredentialEnv::exported`] to child
/// processes instead.
#[derive(Clone, Debug, Default)]
pub struct CredentialEnv {
    base: BaseEnv,
    overlay: BTreeMap<String, Option<String>>,
}

impl CredentialEnv {
    /// View over the current process environment.
    #[must_use]
    pub fn process() -> Self {
        Self::default()
    }

    /// View over a fixed set of variables, ignoring the process environment.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            base: BaseEnv::Fixed(
                pairs
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
            overlay: BTreeMap::new(),
        }
    }

    /// Returns the value for `name`, treating empty strings as unset.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let value = self.overlay.get(name).map_or_else(
            || match &self.base {
                BaseEnv::Process => env::var(name).ok(),
                BaseEnv::Fixed(vars) => vars.get(name).cloned(),
            },
            Clone::clone,
        );
        value.filter(|candidate| !candidate.is_empty())
    }

    /// Reports whether `name` holds a non-empty value.
    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Records `value` for `name`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.overlay.insert(name.into(), Some(value.into()));
    }

    /// Masks `name` so later reads see it as unset.
    pub fn unset(&mut self, name: impl Into<String>) {
        self.overlay.insert(name.into(), None);
    }

    /// Variables set on this view, in name order.
    #[must_use]
    pub fn exported(&self) -> Vec<(String, String)> {
        self.overlay
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Names masked by [`CredentialEnv::unset`].
    #[must_use]
    pub fn removed(&self) -> Vec<String> {
        self.overlay
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.clone())
            .collect()
    }
}
