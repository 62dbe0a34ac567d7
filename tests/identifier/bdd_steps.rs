//! BDD step definitions for identifier resolution.

use rstest_bdd_macros::{given, then, when};
use spawn::Manifest;

use super::test_helpers::{IdentifierState, MANIFEST, Namespace};

#[given("a manifest with agents and clouds")]
fn manifest_loaded(identifier_state: &IdentifierState) {
    let manifest =
        Manifest::from_json(MANIFEST).unwrap_or_else(|err| panic!("manifest parses: {err}"));
    identifier_state.manifest.set(manifest);
}

#[when("I resolve the agent \"{input}\"")]
fn resolve_agent(identifier_state: &IdentifierState, input: String) {
    identifier_state.lookup(Namespace::Agent, &input);
}

#[when("I resolve the cloud \"{input}\"")]
fn resolve_cloud(identifier_state: &IdentifierState, input: String) {
    identifier_state.lookup(Namespace::Cloud, &input);
}

#[then("the resolved key is \"{key}\"")]
fn resolved_key_is(identifier_state: &IdentifierState, key: String) {
    assert_eq!(identifier_state.resolved.get(), Some(Some(key)));
}

#[then("nothing resolves")]
fn nothing_resolves(identifier_state: &IdentifierState) {
    assert_eq!(identifier_state.resolved.get(), Some(None));
}

#[then("the suggestion is \"{key}\"")]
fn suggestion_is(identifier_state: &IdentifierState, key: String) {
    assert_eq!(identifier_state.suggestion.get(), Some(Some(key)));
}

#[then("there is no suggestion")]
fn no_suggestion(identifier_state: &IdentifierState) {
    assert_eq!(identifier_state.suggestion.get(), Some(None));
}
