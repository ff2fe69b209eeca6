use custodes::core::config::GateConfig;
use custodes::core::store::{Store, StoreKind};
use custodes::plugins::learning::{self, EVENT_HISTORY, KIND_INSIGHT, KIND_REMEDIATION};
use custodes::plugins::persona::Persona;
use custodes::subsystems;
use tempfile::tempdir;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::new(StoreKind::User, dir.path().to_path_buf());
    subsystems::initialize_all_dbs(&store.root).expect("init dbs");
    (dir, store)
}

#[test]
fn learned_terms_survive_many_learning_cycles() {
    let (_dir, store) = temp_store();
    learning::record_event(
        &store,
        Persona::Guardian,
        KIND_REMEDIATION,
        "performance_optimization",
        &serde_json::json!({ "terms": ["profiling"] }),
    )
    .unwrap();

    let gate = GateConfig::default();
    for _ in 0..(EVENT_HISTORY + 20) {
        learning::learning_cycle(&store, &gate).unwrap();
    }

    let profile = learning::profile(&store, Persona::Guardian).unwrap();
    assert!(profile.knows("profiling"));

    let insights = learning::events_of_kind(&store, Persona::Guardian, Some(KIND_INSIGHT), -1).unwrap();
    assert_eq!(insights.len() as i64, EVENT_HISTORY);
    let remediation =
        learning::events_of_kind(&store, Persona::Guardian, Some(KIND_REMEDIATION), -1).unwrap();
    assert_eq!(remediation.len(), 1);
}

#[test]
fn insight_pruning_is_per_persona() {
    let (_dir, store) = temp_store();
    for i in 0..(EVENT_HISTORY + 5) {
        learning::record_event(
            &store,
            Persona::Imperium,
            KIND_INSIGHT,
            "learning_cycle",
            &serde_json::json!({ "n": i }),
        )
        .unwrap();
    }
    learning::record_event(
        &store,
        Persona::Sandbox,
        KIND_INSIGHT,
        "learning_cycle",
        &serde_json::json!({ "n": 0 }),
    )
    .unwrap();

    let imperium = learning::recent_events(&store, Persona::Imperium, -1).unwrap();
    assert_eq!(imperium.len() as i64, EVENT_HISTORY);
    // Newest survives.
    assert_eq!(imperium[0].detail["n"], serde_json::json!(EVENT_HISTORY + 4));
    assert_eq!(learning::recent_events(&store, Persona::Sandbox, -1).unwrap().len(), 1);
}
