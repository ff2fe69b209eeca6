//! Eligibility gates over stored metrics.
//!
//! Both gates are pure functions of the metrics row, the gate thresholds and
//! the current time. They never touch the database, so the same inputs always
//! give the same verdict.

use crate::core::config::GateConfig;
use crate::plugins::metrics::AgentMetrics;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reasons: Vec<String>,
}

impl Eligibility {
    fn from_failures(failures: Vec<String>, ok_reason: String) -> Self {
        if failures.is_empty() {
            Self {
                eligible: true,
                reasons: vec![ok_reason],
            }
        } else {
            Self {
                eligible: false,
                reasons: failures,
            }
        }
    }
}

/// Pass rate over the most recent `window` results, or `None` when fewer
/// than `window` results exist.
pub fn recent_pass_rate(recent_results: &[bool], window: usize) -> Option<f64> {
    if window == 0 || recent_results.len() < window {
        return None;
    }
    let passed = recent_results[..window].iter().filter(|p| **p).count();
    Some(passed as f64 / window as f64)
}

/// Level-up: a full window of recent results, a high enough pass rate over
/// that window, and not too many consecutive failures.
pub fn level_up(metrics: &AgentMetrics, gate: &GateConfig, _now_secs: i64) -> Eligibility {
    let mut failures = Vec::new();
    let window = gate.level_up_window;

    let rate = recent_pass_rate(&metrics.recent_results, window);
    match rate {
        None => failures.push(format!(
            "Only {} of {} required recent tests recorded",
            metrics.recent_results.len().min(window),
            window
        )),
        Some(r) if r < gate.level_up_min_pass_rate => failures.push(format!(
            "Recent pass rate {:.0}% is below {:.0}%",
            r * 100.0,
            gate.level_up_min_pass_rate * 100.0
        )),
        Some(_) => {}
    }

    if metrics.consecutive_failures > gate.level_up_max_consecutive_failures {
        failures.push(format!(
            "{} consecutive failures exceed the limit of {}",
            metrics.consecutive_failures, gate.level_up_max_consecutive_failures
        ));
    }

    Eligibility::from_failures(
        failures,
        format!(
            "Recent pass rate {:.0}% over the last {} tests",
            rate.unwrap_or(0.0) * 100.0,
            window
        ),
    )
}

/// Proposal generation: at least one passed test, not revoked by a run of
/// consecutive failures, and a test taken recently enough.
pub fn proposal_generation(metrics: &AgentMetrics, gate: &GateConfig, now_secs: i64) -> Eligibility {
    let mut failures = Vec::new();

    if metrics.total_tests_passed < gate.proposal_min_passed_tests {
        failures.push(format!(
            "{} passed tests, {} required",
            metrics.total_tests_passed, gate.proposal_min_passed_tests
        ));
    }

    if metrics.consecutive_failures >= gate.proposal_revoke_after_failures {
        failures.push(format!(
            "Revoked after {} consecutive failures",
            metrics.consecutive_failures
        ));
    }

    match metrics.last_test_date {
        None => failures.push("No custody test on record".to_string()),
        Some(ts) if now_secs - ts > gate.proposal_recency_secs => failures.push(format!(
            "Last custody test was {}s ago (limit {}s)",
            now_secs - ts,
            gate.proposal_recency_secs
        )),
        Some(_) => {}
    }

    Eligibility::from_failures(
        failures,
        format!(
            "{} passed tests, last test within {}s",
            metrics.total_tests_passed, gate.proposal_recency_secs
        ),
    )
}
