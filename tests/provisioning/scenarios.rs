//! BDD scenarios for the provisioning lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisioningState, provisioning_state};

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Instance becomes ready after a few polls"
)]
fn scenario_ready_after_polls(#[from(provisioning_state)] _provisioning_state: ProvisioningState) {}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Readiness timeout destroys the instance"
)]
fn scenario_readiness_timeout(#[from(provisioning_state)] _provisioning_state: ProvisioningState) {}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Rejected credentials stop before creation"
)]
fn scenario_rejected_credentials(
    #[from(provisioning_state)] _provisioning_state: ProvisioningState,
) {
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Teardown failures are reported with the primary error"
)]
fn scenario_teardown_failure(#[from(provisioning_state)] _provisioning_state: ProvisioningState) {}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Rate-limited creation is retried"
)]
fn scenario_rate_limited_create(#[from(provisioning_state)] _provisioning_state: ProvisioningState) {}
