//! BDD scenarios for identifier resolution.

use rstest_bdd_macros::scenario;

use super::test_helpers::{IdentifierState, identifier_state};

#[scenario(
    path = "tests/features/identifier.feature",
    name = "Exact keys resolve to themselves"
)]
fn scenario_exact_key(#[from(identifier_state)] _identifier_state: IdentifierState) {}

#[scenario(
    path = "tests/features/identifier.feature",
    name = "Keys match regardless of case"
)]
fn scenario_case_insensitive_key(#[from(identifier_state)] _identifier_state: IdentifierState) {}

#[scenario(
    path = "tests/features/identifier.feature",
    name = "Display names resolve to their key"
)]
fn scenario_display_name(#[from(identifier_state)] _identifier_state: IdentifierState) {}

#[scenario(
    path = "tests/features/identifier.feature",
    name = "Near misses suggest the closest key"
)]
fn scenario_suggestion(#[from(identifier_state)] _identifier_state: IdentifierState) {}

#[scenario(
    path = "tests/features/identifier.feature",
    name = "Agent keys never resolve as clouds"
)]
fn scenario_namespaces_do_not_mix(#[from(identifier_state)] _identifier_state: IdentifierState) {}

#[scenario(
    path = "tests/features/identifier.feature",
    name = "Distant input has no suggestion"
)]
fn scenario_no_suggestion(#[from(identifier_state)] _identifier_state: IdentifierState) {}
