//! Instance readiness polling.
//!
//! A freshly created instance is polled at a fixed cadence until its status
//! document reports the target status together with a usable IP address.
//! Each attempt is classified by [`step`] into one of three states:
//!
//! - [`PollState::Ready`]: status matches and an IP is present. Polling
//!   stops.
//! - [`PollState::Pending`]: status matches but the IP is still empty.
//! - [`PollState::Mismatch`]: any other status. Probe failures and
//!   unparsable documents land here too, so a network blip never aborts
//!   provisioning.
//!
//! Elapsed time is reported as `attempts × poll_delay` rather than wall
//! clock time.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapter::AdapterFuture;
use crate::backoff::backoff;
use crate::error::ErrorKind;

/// Default pause between attempts.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

const TIMEOUT_REMEDIATION: &str =
    "Retry the command, check the provider dashboard, or try a different region.";

/// Dotted path into a JSON document, such as `server.public_net.ipv4.ip` or
/// `networks.v4.0.ip_address`. Numeric segments index arrays.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a dotted path. Empty segments are ignored.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Extracts the value at this path as text.
    ///
    /// Strings are returned as-is and numbers or booleans are rendered.
    /// Missing fields, nulls, containers and empty strings yield `None`.
    #[must_use]
    pub fn extract(&self, document: &Value) -> Option<String> {
        let mut current = document;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        let text = match current {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        };
        Some(text).filter(|value| !value.is_empty())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// What to poll for and how long to keep trying.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PollTarget {
    /// Label used in log lines and error messages.
    pub entity: String,
    /// Status value that signals readiness.
    pub target_status: String,
    /// Location of the status field.
    pub status_path: FieldPath,
    /// Location of the IP address field.
    pub ip_path: FieldPath,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub poll_delay: Duration,
}

impl PollTarget {
    /// Builds a target with the default cadence.
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        target_status: impl Into<String>,
        status_path: &str,
        ip_path: &str,
    ) -> Self {
        Self {
            entity: entity.into(),
            target_status: target_status.into(),
            status_path: FieldPath::parse(status_path),
            ip_path: FieldPath::parse(ip_path),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_delay: DEFAULT_POLL_DELAY,
        }
    }

    /// Overrides the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Overrides the pause between attempts.
    #[must_use]
    pub const fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Reported elapsed time after `attempts` attempts.
    #[must_use]
    pub const fn elapsed_after(&self, attempts: u32) -> Duration {
        self.poll_delay.saturating_mul(attempts)
    }
}

/// Error returned by a status probe.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ProbeError {
    /// Failure description.
    pub message: String,
}

impl ProbeError {
    /// Wraps a failure description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Probe failures are absorbed by the poller and never surface.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Fetches the raw status document for one instance.
pub trait StatusProbe {
    /// Returns the provider's JSON status document.
    fn fetch(&self) -> AdapterFuture<'_, String, ProbeError>;
}

/// Outcome of one poll attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollState {
    /// Target status reached with an IP address.
    Ready {
        /// Extracted address.
        ip: String,
    },
    /// Target status reached but no IP yet.
    Pending,
    /// Status differs from the target, or could not be read.
    Mismatch {
        /// Status reported, when one could be extracted.
        status: Option<String>,
    },
}

/// Classifies a status document against `target`.
#[must_use]
pub fn step(target: &PollTarget, document: &str) -> PollState {
    let Ok(parsed) = serde_json::from_str::<Value>(document) else {
        return PollState::Mismatch { status: None };
    };
    let status = target.status_path.extract(&parsed);
    if status.as_deref() != Some(target.target_status.as_str()) {
        return PollState::Mismatch { status };
    }
    target
        .ip_path
        .extract(&parsed)
        .map_or(PollState::Pending, |ip| PollState::Ready { ip })
}

/// Instance details once readiness is reached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadyInstance {
    /// Address extracted from the status document.
    pub ip: String,
    /// Attempt on which readiness was observed.
    pub attempts: u32,
    /// `attempts × poll_delay`.
    pub elapsed: Duration,
}

/// Errors raised by [`poll_until_ready`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PollError {
    /// Raised when the attempt budget runs out.
    #[error(
        "{entity} did not reach status '{target_status}' after {attempts} attempts \
         ({elapsed_secs}s elapsed{}). {remediation}",
        last_status_note(.last_status.as_deref())
    )]
    Timeout {
        /// Entity label.
        entity: String,
        /// Status that was awaited.
        target_status: String,
        /// Attempts made.
        attempts: u32,
        /// `attempts × poll_delay` in seconds.
        elapsed_secs: u64,
        /// Last status observed, if any.
        last_status: Option<String>,
        /// Suggested next steps.
        remediation: String,
    },
}

impl PollError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

fn last_status_note(last_status: Option<&str>) -> String {
    last_status
        .map(|status| format!(", last status '{status}'"))
        .unwrap_or_default()
}

/// Polls `probe` until `target` is ready or the attempt budget runs out.
///
/// Attempts are separated by a jittered `poll_delay`; no sleep follows the
/// final attempt.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] after `max_attempts` attempts without
/// reaching [`PollState::Ready`].
pub async fn poll_until_ready<P>(target: &PollTarget, probe: &P) -> Result<ReadyInstance, PollError>
where
    P: StatusProbe + ?Sized,
{
    let entity = target.entity.as_str();
    let mut last_status = None;

    for attempt in 1..=target.max_attempts {
        let state = match probe.fetch().await {
            Ok(document) => step(target, &document),
            Err(err) => {
                warn!(
                    entity,
                    attempt,
                    kind = %err.kind(),
                    error = %err,
                    "status check failed; will retry"
                );
                PollState::Mismatch { status: None }
            }
        };

        match state {
            PollState::Ready { ip } => {
                info!(entity, attempt, "instance ready");
                return Ok(ReadyInstance {
                    ip,
                    attempts: attempt,
                    elapsed: target.elapsed_after(attempt),
                });
            }
            PollState::Pending => {
                debug!(entity, attempt, "status reached; waiting for address");
            }
            PollState::Mismatch { status } => {
                info!(
                    entity,
                    attempt,
                    status = status.as_deref().unwrap_or("unknown"),
                    target = %target.target_status,
                    "waiting for instance"
                );
                if status.is_some() {
                    last_status = status;
                }
            }
        }

        if attempt < target.max_attempts {
            sleep(backoff(target.poll_delay, target.poll_delay)).await;
        }
    }

    Err(PollError::Timeout {
        entity: target.entity.clone(),
        target_status: target.target_status.clone(),
        attempts: target.max_attempts,
        elapsed_secs: target.elapsed_after(target.max_attempts).as_secs(),
        last_status,
        remediation: String::from(TIMEOUT_REMEDIATION),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::test_support::ScriptedProbe;

    fn droplet() -> PollTarget {
        PollTarget::new("droplet", "active", "droplet.status", "droplet.networks.v4.0.ip_address")
            .with_poll_delay(Duration::from_secs(5))
            .with_max_attempts(5)
    }

    fn document(status: &str, ip: &str) -> String {
        json!({ "droplet": { "status": status, "networks": { "v4": [{ "ip_address": ip }] } } })
            .to_string()
    }

    #[rstest]
    #[case("a.b", json!({"a": {"b": "x"}}), Some("x"))]
    #[case("a.0.b", json!({"a": [{"b": 7}]}), Some("7"))]
    #[case("a.1", json!({"a": ["x"]}), None)]
    #[case("a.b", json!({"a": {"b": null}}), None)]
    #[case("a.b", json!({"a": {"b": ""}}), None)]
    #[case("a", json!({"a": {"b": "x"}}), None)]
    #[case("a.b", json!({"a": "scalar"}), None)]
    fn field_path_extracts_scalars(
        #[case] path: &str,
        #[case] doc: Value,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(FieldPath::parse(path).extract(&doc).as_deref(), expected);
    }

    #[test]
    fn field_path_displays_dotted_form() {
        assert_eq!(FieldPath::parse("a..b.0").to_string(), "a.b.0");
    }

    #[rstest]
    #[case(document("active", "10.0.0.1"), PollState::Ready { ip: String::from("10.0.0.1") })]
    #[case(document("active", ""), PollState::Pending)]
    #[case(document("new", "10.0.0.1"), PollState::Mismatch { status: Some(String::from("new")) })]
    #[case(String::from("<html>bad gateway</html>"), PollState::Mismatch { status: None })]
    #[case(String::from("{}"), PollState::Mismatch { status: None })]
    fn step_classifies_documents(#[case] doc: String, #[case] expected: PollState) {
        assert_eq!(step(&droplet(), &doc), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_attempt_reports_fifteen_seconds() {
        let probe = ScriptedProbe::new([
            Ok(document("new", "")),
            Ok(document("new", "")),
            Ok(document("active", "203.0.113.9")),
        ]);

        let ready = poll_until_ready(&droplet(), &probe)
            .await
            .expect("third attempt should be ready");

        assert_eq!(ready.ip, "203.0.113.9");
        assert_eq!(ready.attempts, 3);
        assert_eq!(ready.elapsed, Duration::from_secs(15));
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_elapsed_and_remediation() {
        let probe = ScriptedProbe::new([Ok(document("pending", ""))]);
        let target = droplet().with_max_attempts(2);

        let err = poll_until_ready(&target, &probe)
            .await
            .expect_err("status never matches");

        let message = err.to_string();
        assert!(message.contains("10s elapsed"), "{message}");
        assert!(message.contains("droplet"), "{message}");
        assert!(message.contains("'active'"), "{message}");
        assert!(message.contains("last status 'pending'"), "{message}");
        assert!(message.contains("different region"), "{message}");
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_keep_polling() {
        let probe = ScriptedProbe::new([
            Err(ProbeError::new("connection reset")),
            Ok(String::from("not json")),
            Ok(document("active", "198.51.100.4")),
        ]);

        let ready = poll_until_ready(&droplet(), &probe)
            .await
            .expect("transient failures are absorbed");

        assert_eq!(ready.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_until_address_assigned() {
        let probe = ScriptedProbe::new([
            Ok(document("active", "")),
            Ok(document("active", "192.0.2.1")),
        ]);

        let ready = poll_until_ready(&droplet(), &probe).await.expect("ready");

        assert_eq!(ready.attempts, 2);
        assert_eq!(ready.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_times_out_without_probing() {
        let probe = ScriptedProbe::new([Ok(document("active", "192.0.2.1"))]);
        let target = droplet().with_max_attempts(0);

        let err = poll_until_ready(&target, &probe).await.expect_err("no attempts");

        assert!(matches!(
            err,
            PollError::Timeout {
                attempts: 0,
                elapsed_secs: 0,
                ..
            }
        ));
        assert_eq!(probe.calls(), 0);
    }
}
