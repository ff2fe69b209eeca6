use custodes::core::config::GateConfig;
use custodes::core::db;
use custodes::core::store::{Store, StoreKind};
use custodes::plugins::generators::{TestCategory, TestDifficulty};
use custodes::plugins::metrics::{self, TestOutcome, level_for_xp};
use custodes::plugins::persona::Persona;
use custodes::subsystems;
use tempfile::tempdir;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::new(StoreKind::User, dir.path().to_path_buf());
    subsystems::initialize_all_dbs(&store.root).expect("init dbs");
    (dir, store)
}

fn outcome(passed: bool) -> TestOutcome {
    TestOutcome {
        category: TestCategory::CodeQuality,
        difficulty: TestDifficulty::Basic,
        score: if passed { 90.0 } else { 20.0 },
        passed,
        generator: "rubric".to_string(),
        feedback: "ok".to_string(),
    }
}

fn history_count(store: &Store, persona: Persona) -> i64 {
    let conn = db::db_connect(&db::custodes_db_path(&store.root).to_string_lossy()).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM custody_tests WHERE persona = ?1",
        [persona.as_str()],
        |r| r.get(0),
    )
    .unwrap()
}

#[test]
fn get_or_create_starts_at_level_one() {
    let (_dir, store) = temp_store();
    let m = metrics::get_or_create(&store, Persona::Imperium).unwrap();
    assert_eq!(m.level, 1);
    assert_eq!(m.xp, 0);
    assert_eq!(m.total_tests_given, 0);
    assert!(m.last_test_date.is_none());
    assert_eq!(metrics::list_all(&store).unwrap().len(), 4);
}

#[test]
fn record_test_updates_counters_once() {
    let (_dir, store) = temp_store();
    let gate = GateConfig::default();

    let r = metrics::record_test(&store, Persona::Guardian, &outcome(true), &gate, 50, 1_000).unwrap();
    assert_eq!(r.xp_awarded, 10);
    assert_eq!(r.metrics.total_tests_given, 1);
    assert_eq!(r.metrics.total_tests_passed, 1);
    assert_eq!(r.metrics.consecutive_successes, 1);
    assert_eq!(r.metrics.last_test_date, Some(1_000));

    let r = metrics::record_test(&store, Persona::Guardian, &outcome(false), &gate, 50, 2_000).unwrap();
    assert_eq!(r.xp_awarded, 0);
    assert_eq!(r.metrics.total_tests_given, 2);
    assert_eq!(r.metrics.total_tests_failed, 1);
    assert_eq!(r.metrics.consecutive_successes, 0);
    assert_eq!(r.metrics.consecutive_failures, 1);
    assert_eq!(r.metrics.recent_results, vec![false, true]);

    let stored = metrics::get_or_create(&store, Persona::Guardian).unwrap();
    assert_eq!(stored.total_tests_given, 2);
    assert_eq!(stored.xp, 10);
    assert_eq!(history_count(&store, Persona::Guardian), 2);
}

#[test]
fn record_test_is_atomic_when_metrics_write_fails() {
    let (_dir, store) = temp_store();
    let gate = GateConfig::default();
    metrics::get_or_create(&store, Persona::Sandbox).unwrap();

    let conn = db::db_connect(&db::custodes_db_path(&store.root).to_string_lossy()).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER block_metrics BEFORE UPDATE ON agent_metrics
         BEGIN SELECT RAISE(ABORT, 'metrics locked'); END;",
    )
    .unwrap();
    drop(conn);

    let err = metrics::record_test(&store, Persona::Sandbox, &outcome(true), &gate, 50, 1_000);
    assert!(err.is_err());
    assert_eq!(history_count(&store, Persona::Sandbox), 0, "history row must roll back");
    let m = metrics::get_or_create(&store, Persona::Sandbox).unwrap();
    assert_eq!(m.total_tests_given, 0);
    assert_eq!(m.xp, 0);
}

#[test]
fn history_is_pruned_to_limit() {
    let (_dir, store) = temp_store();
    let gate = GateConfig::default();
    for i in 0..8 {
        metrics::record_test(&store, Persona::Conquest, &outcome(i % 2 == 0), &gate, 5, 100 + i)
            .unwrap();
    }
    assert_eq!(history_count(&store, Persona::Conquest), 5);
    let m = metrics::get_or_create(&store, Persona::Conquest).unwrap();
    assert_eq!(m.total_tests_given, 8);
    assert_eq!(m.recent_results.len(), 5);

    let rows = metrics::test_history(&store, Persona::Conquest, 3).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].created_at > rows[1].created_at);
}

#[test]
fn level_rises_only_while_gate_holds() {
    let (_dir, store) = temp_store();
    let gate = GateConfig::default();

    // Enough XP for level 2, but no test window yet.
    let m = metrics::award_xp(&store, Persona::Imperium, 150, "seed", &gate, 10).unwrap();
    assert_eq!(m.level, 1);

    let mut last = None;
    for i in 0..5 {
        last = Some(
            metrics::record_test(&store, Persona::Imperium, &outcome(true), &gate, 50, 20 + i)
                .unwrap(),
        );
    }
    let last = last.unwrap();
    assert!(last.leveled_up);
    assert_eq!(last.metrics.level, level_for_xp(last.metrics.xp));
}

#[test]
fn award_xp_rejects_non_positive_amounts() {
    let (_dir, store) = temp_store();
    let gate = GateConfig::default();
    assert!(metrics::award_xp(&store, Persona::Guardian, 0, "none", &gate, 1).is_err());
    assert!(metrics::award_xp(&store, Persona::Guardian, -5, "none", &gate, 1).is_err());
    let m = metrics::award_xp(&store, Persona::Guardian, 50, "olympic_winner", &gate, 1).unwrap();
    assert_eq!(m.xp, 50);
}

#[test]
fn reset_clears_history_but_keeps_row() {
    let (_dir, store) = temp_store();
    let gate = GateConfig::default();
    let created = metrics::get_or_create_at(&store, Persona::Guardian, 5).unwrap().created_at;
    metrics::record_test(&store, Persona::Guardian, &outcome(true), &gate, 50, 10).unwrap();

    let fresh = metrics::reset(&store, Persona::Guardian).unwrap();
    assert_eq!(fresh.total_tests_given, 0);
    assert_eq!(fresh.xp, 0);
    assert_eq!(fresh.created_at, created);
    assert_eq!(history_count(&store, Persona::Guardian), 0);
}

#[test]
fn xp_thresholds() {
    assert_eq!(level_for_xp(0), 1);
    assert_eq!(level_for_xp(99), 1);
    assert_eq!(level_for_xp(100), 2);
    assert_eq!(level_for_xp(4499), 9);
    assert_eq!(level_for_xp(4500), 10);
    assert_eq!(level_for_xp(1_000_000), 10);
}
