//! Shared state for identifier resolution scenarios.

use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::ScenarioState;
use spawn::Manifest;

pub const MANIFEST: &str = r#"{
    "agents": {
        "claude": { "name": "Claude Code" },
        "aider": { "name": "Aider" },
        "goose": { "name": "Goose" }
    },
    "clouds": {
        "hetzner": { "name": "Hetzner Cloud" },
        "sprite": { "name": "Sprite" }
    },
    "matrix": {
        "hetzner/claude": "implemented",
        "sprite/claude": "missing"
    }
}"#;

/// Which manifest namespace a lookup targets.
#[derive(Clone, Copy, Debug)]
pub enum Namespace {
    Agent,
    Cloud,
}

#[derive(Default, ScenarioState)]
pub struct IdentifierState {
    pub manifest: Slot<Manifest>,
    pub resolved: Slot<Option<String>>,
    pub suggestion: Slot<Option<String>>,
}

impl IdentifierState {
    /// Resolves `input` and records both the match and the suggestion.
    pub fn lookup(&self, namespace: Namespace, input: &str) {
        let (resolved, suggestion) = self
            .manifest
            .with_ref(|manifest| match namespace {
                Namespace::Agent => (
                    manifest.resolve_agent(input).map(str::to_owned),
                    manifest.suggest_agent(input).map(str::to_owned),
                ),
                Namespace::Cloud => (
                    manifest.resolve_cloud(input).map(str::to_owned),
                    manifest.suggest_cloud(input).map(str::to_owned),
                ),
            })
            .unwrap_or_else(|| panic!("manifest should be loaded before resolving"));
        self.resolved.set(resolved);
        self.suggestion.set(suggestion);
    }
}

#[fixture]
pub fn identifier_state() -> IdentifierState {
    IdentifierState::default()
}
