use custodes::core::config::GateConfig;
use custodes::plugins::eligibility::{level_up, proposal_generation, recent_pass_rate};
use custodes::plugins::metrics::AgentMetrics;
use custodes::plugins::persona::Persona;

const NOW: i64 = 1_771_000_000;

fn metrics_with(results: &[bool], now: i64) -> AgentMetrics {
    let mut m = AgentMetrics::new(Persona::Guardian, now - 10_000);
    // `apply_result` prepends, so feed oldest first.
    for (i, passed) in results.iter().enumerate() {
        m.apply_result(*passed, now - (results.len() - i) as i64, 50);
    }
    m
}

#[test]
fn recent_pass_rate_needs_full_window() {
    assert_eq!(recent_pass_rate(&[true, true], 5), None);
    assert_eq!(recent_pass_rate(&[true, false, true, true, true, false], 5), Some(0.8));
    assert_eq!(recent_pass_rate(&[true], 0), None);
}

#[test]
fn five_passes_make_level_up_eligible() {
    let gate = GateConfig::default();
    let m = metrics_with(&[true; 5], NOW);
    let verdict = level_up(&m, &gate, NOW);
    assert!(verdict.eligible, "{:?}", verdict.reasons);
    assert_eq!(verdict.reasons.len(), 1);
}

#[test]
fn short_history_blocks_level_up() {
    let gate = GateConfig::default();
    let m = metrics_with(&[true; 4], NOW);
    let verdict = level_up(&m, &gate, NOW);
    assert!(!verdict.eligible);
    assert!(verdict.reasons[0].contains("4 of 5"));
}

#[test]
fn low_recent_rate_blocks_level_up() {
    let gate = GateConfig::default();
    // Newest five: three passes, two failures.
    let m = metrics_with(&[true, true, true, false, true, false], NOW);
    let verdict = level_up(&m, &gate, NOW);
    assert!(!verdict.eligible);
    assert!(verdict.reasons.iter().any(|r| r.contains("below")));
}

#[test]
fn consecutive_failures_block_level_up() {
    let gate = GateConfig {
        level_up_min_pass_rate: 0.0,
        ..GateConfig::default()
    };
    let m = metrics_with(&[true, true, false, false, false], NOW);
    let verdict = level_up(&m, &gate, NOW);
    assert!(!verdict.eligible);
    assert!(verdict.reasons.iter().any(|r| r.contains("consecutive failures")));
}

#[test]
fn one_recent_pass_grants_proposal_generation() {
    let gate = GateConfig::default();
    let m = metrics_with(&[true], NOW);
    assert!(proposal_generation(&m, &gate, NOW).eligible);
}

#[test]
fn three_consecutive_failures_revoke_proposals() {
    let gate = GateConfig::default();
    let m = metrics_with(&[true, false, false], NOW);
    assert!(proposal_generation(&m, &gate, NOW).eligible);

    let m = metrics_with(&[true, false, false, false], NOW);
    let verdict = proposal_generation(&m, &gate, NOW);
    assert!(!verdict.eligible);
    assert!(verdict.reasons.iter().any(|r| r.contains("Revoked after 3")));

    let m = metrics_with(&[true, false, false, false, true], NOW);
    assert!(proposal_generation(&m, &gate, NOW).eligible);
}

#[test]
fn stale_or_missing_tests_block_proposals() {
    let gate = GateConfig::default();
    let never = AgentMetrics::new(Persona::Sandbox, NOW);
    let verdict = proposal_generation(&never, &gate, NOW);
    assert!(!verdict.eligible);
    assert!(verdict.reasons.iter().any(|r| r == "No custody test on record"));

    let m = metrics_with(&[true], NOW);
    let later = NOW + gate.proposal_recency_secs + 10;
    let verdict = proposal_generation(&m, &gate, later);
    assert!(!verdict.eligible);
    assert!(verdict.reasons.iter().any(|r| r.contains("ago")));
}

#[test]
fn gates_are_pure() {
    let gate = GateConfig::default();
    let m = metrics_with(&[true, true, false, true, true], NOW);
    let before = m.clone();
    let a = (level_up(&m, &gate, NOW), proposal_generation(&m, &gate, NOW));
    let b = (level_up(&m, &gate, NOW), proposal_generation(&m, &gate, NOW));
    assert_eq!(a, b);
    assert_eq!(m, before);
}
