use custodes::core::broker::{self, DbBroker};
use custodes::core::config::{Config, LoopKind};
use custodes::core::db;
use custodes::core::error::CustodesError;
use custodes::core::store::{Store, StoreKind};
use custodes::subsystems;
use rusqlite::params;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::new(StoreKind::User, dir.path().join("store"));
    subsystems::initialize_all_dbs(&store.root).expect("init dbs");
    (dir, store)
}

#[test]
fn initialize_all_dbs_is_idempotent_and_creates_tables() {
    let (_dir, store) = temp_store();
    subsystems::initialize_all_dbs(&store.root).expect("second init");

    let conn = db::db_connect(&db::custodes_db_path(&store.root).to_string_lossy()).unwrap();
    for table in [
        "agent_metrics",
        "custody_tests",
        "xp_awards",
        "proposals",
        "learning_events",
    ] {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "missing table {}", table);
    }
    let names: Vec<&str> = subsystems::SUBSYSTEMS.iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["metrics", "proposals", "learning"]);
}

#[test]
fn with_tx_rolls_back_on_error_and_audits_both_outcomes() {
    let (_dir, store) = temp_store();
    let broker = DbBroker::new(&store.root);
    let db_path = db::custodes_db_path(&store.root);

    let result: Result<(), CustodesError> =
        broker.with_tx(&db_path, "test", None, "tx.fail", |tx| {
            tx.execute(
                "INSERT INTO agent_metrics(persona, level, xp, created_at, updated_at)
                 VALUES('guardian', 1, 0, 1, 1)",
                [],
            )?;
            Err(CustodesError::ValidationError("boom".to_string()))
        });
    assert!(result.is_err());

    let count: i64 = broker
        .with_conn(&db_path, "test", None, "count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM agent_metrics", [], |r| r.get(0))?)
        })
        .unwrap();
    assert_eq!(count, 0, "failed transaction must leave no rows");

    broker
        .with_tx(&db_path, "test", None, "tx.ok", |tx| {
            tx.execute(
                "INSERT INTO agent_metrics(persona, level, xp, created_at, updated_at)
                 VALUES('guardian', 1, 0, 1, 1)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

    let events = broker::read_audit_log(&store.root).unwrap();
    let failed = events.iter().find(|e| e.op == "tx.fail").unwrap();
    assert_eq!(failed.status, "rolled_back");
    let ok = events.iter().find(|e| e.op == "tx.ok").unwrap();
    assert_eq!(ok.status, "success");
    assert_eq!(ok.db_id, "custodes.db");
}

#[test]
fn audit_log_is_empty_for_fresh_root() {
    let dir = tempdir().unwrap();
    assert!(broker::read_audit_log(dir.path()).unwrap().is_empty());
}

#[test]
fn store_resolution_prefers_explicit_then_repo_dir() {
    let dir = tempdir().unwrap();
    let explicit = dir.path().join("elsewhere");
    let s = Store::resolve(Some(&explicit), dir.path());
    assert_eq!(s.root, explicit);

    fs::create_dir_all(dir.path().join(".custodes")).unwrap();
    let s = Store::resolve(None, dir.path());
    assert_eq!(s.kind, StoreKind::Repo);
    assert_eq!(s.root, dir.path().join(".custodes"));
    assert_eq!(s.config_path(), dir.path().join(".custodes").join("custodes.toml"));
}

#[test]
fn config_load_missing_file_gives_defaults() {
    let dir = tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.scheduler.interval(LoopKind::Olympic), Duration::from_secs(2700));
    assert_eq!(config.gate.proposal_revoke_after_failures, 3);
    assert_eq!(config.apply_workspace(), config.repo.local_path);
}

#[test]
fn config_round_trips_through_default_toml() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("custodes.toml");
    fs::write(&path, Config::default_toml().unwrap()).unwrap();
    let config = Config::load(&path).unwrap();
    assert_eq!(config.custody.history_limit, 50);
    assert_eq!(config.analysis.max_proposals_per_run, 3);
}

#[test]
fn config_rejects_invalid_values() {
    let err = Config::from_toml("[scheduler]\nauto_apply_interval_secs = 0\n").unwrap_err();
    assert!(matches!(err, CustodesError::ConfigError(_)));

    let err = Config::from_toml("[gate]\nlevel_up_min_pass_rate = 1.5\n").unwrap_err();
    assert!(err.to_string().contains("level_up_min_pass_rate"));

    let err = Config::from_toml("[custody]\nhistory_limit = 2\n").unwrap_err();
    assert!(err.to_string().contains("history_limit"));

    assert!(matches!(
        Config::from_toml("[gate\n").unwrap_err(),
        CustodesError::TomlError(_)
    ));
}
