//! BDD step definitions for the provisioning lifecycle.

use rstest_bdd_macros::{given, then, when};
use spawn::test_support::{FakeProviderError, status_document};

use super::test_helpers::{ProvisioningState, hetzner_adapter, run_provisioning};

#[given("a hetzner adapter with a valid token")]
fn hetzner_with_token(provisioning_state: &ProvisioningState) {
    provisioning_state.adapter.set(hetzner_adapter());
}

#[given("the instance stays pending for {polls:usize} polls")]
fn instance_stays_pending(provisioning_state: &ProvisioningState, polls: usize) {
    let mut statuses: Vec<_> = (0..polls)
        .map(|_| Ok(status_document("running", "")))
        .collect();
    statuses.push(Ok(status_document("running", "192.0.2.10")));
    provisioning_state.rebuild_adapter(|adapter| adapter.with_statuses(statuses));
}

#[given("the poll budget is {attempts:u32} attempts")]
fn poll_budget(provisioning_state: &ProvisioningState, attempts: u32) {
    provisioning_state.rebuild_adapter(|adapter| adapter.with_max_poll_attempts(attempts));
}

#[given("the provider rejects the credentials with \"{message}\"")]
fn provider_rejects(provisioning_state: &ProvisioningState, message: String) {
    provisioning_state.with_adapter(|adapter| adapter.validator().reject(message));
}

#[given("the payload upload fails with \"{message}\"")]
fn upload_fails(provisioning_state: &ProvisioningState, message: String) {
    provisioning_state.with_adapter(|adapter| adapter.recorded_transport().fail_uploads(message));
}

#[given("teardown fails with \"{message}\"")]
fn teardown_fails(provisioning_state: &ProvisioningState, message: String) {
    provisioning_state.with_adapter(|adapter| adapter.fail_destroy(message));
}

#[given("creation is rate limited {times:usize} times")]
fn creation_rate_limited(provisioning_state: &ProvisioningState, times: usize) {
    provisioning_state.with_adapter(|adapter| {
        for _ in 0..times {
            adapter.fail_create(FakeProviderError::retryable("429 rate limited"));
        }
    });
}

#[when("I provision the instance")]
fn provision_instance(provisioning_state: &ProvisioningState) {
    let outcome = provisioning_state.with_adapter(run_provisioning);
    provisioning_state.outcome.set(outcome);
}

#[then("provisioning succeeds with address \"{ip}\"")]
fn provisioning_succeeds(provisioning_state: &ProvisioningState, ip: String) {
    let outcome = provisioning_state.outcome();
    assert_eq!(outcome.message, None, "unexpected failure");
    assert_eq!(outcome.ip, Some(ip));
    assert_eq!(outcome.exit_code, 0);
}

#[then("provisioning fails mentioning \"{text}\"")]
fn provisioning_fails(provisioning_state: &ProvisioningState, text: String) {
    let outcome = provisioning_state.outcome();
    let message = outcome
        .message
        .unwrap_or_else(|| panic!("provisioning should have failed"));
    assert!(message.contains(&text), "unexpected error: {message}");
    assert!(outcome.kind.is_some());
}

#[then("the instance was polled {polls:usize} times")]
fn instance_polled(provisioning_state: &ProvisioningState, polls: usize) {
    assert_eq!(provisioning_state.with_adapter(|adapter| adapter.status_calls()), polls);
}

#[then("the environment payload was delivered")]
fn payload_delivered(provisioning_state: &ProvisioningState) {
    let (uploads, commands) = provisioning_state.with_adapter(|adapter| {
        let transport = adapter.recorded_transport();
        (transport.uploads(), transport.commands())
    });
    let upload = uploads
        .first()
        .unwrap_or_else(|| panic!("payload should be uploaded"));
    assert_eq!(upload.remote, "/tmp/env_config");
    assert_eq!(upload.contents, "export OPENROUTER_API_KEY='sk-or-1'\n");
    assert_eq!(
        commands,
        vec![String::from(
            "cat /tmp/env_config >> ~/.zshrc; rc=$?; rm -f /tmp/env_config; exit $rc"
        )]
    );
}

#[then("no staged payload remains")]
fn no_staged_payload(provisioning_state: &ProvisioningState) {
    assert_eq!(provisioning_state.outcome().staged_files, 0);
}

#[then("the instance was destroyed")]
fn instance_destroyed(provisioning_state: &ProvisioningState) {
    assert_eq!(
        provisioning_state.with_adapter(|adapter| adapter.destroyed()),
        vec![String::from("fake-1")]
    );
}

#[then("no instance was created")]
fn no_instance_created(provisioning_state: &ProvisioningState) {
    assert_eq!(provisioning_state.with_adapter(|adapter| adapter.create_calls()), 0);
}

#[then("creation was attempted {times:usize} times")]
fn creation_attempted(provisioning_state: &ProvisioningState, times: usize) {
    assert_eq!(provisioning_state.with_adapter(|adapter| adapter.create_calls()), times);
}

#[then("the exit code is {code:i32}")]
fn exit_code_is(provisioning_state: &ProvisioningState, code: i32) {
    assert_eq!(provisioning_state.outcome().exit_code, code);
}
