use custodes::core::config::AnalysisConfig;
use custodes::core::store::{Store, StoreKind};
use custodes::plugins::auto_apply::{self, ApplyAction};
use custodes::plugins::persona::Persona;
use custodes::plugins::proposals::{self, NewProposal, ProposalStatus, TestStatus};
use custodes::subsystems;
use std::fs;
use tempfile::tempdir;

const BEFORE: &str = "void main() {\n  print('hi');\n}\n";
const AFTER: &str = "void main() {\n  debugPrint('hi');\n}\n";

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::new(StoreKind::User, dir.path().to_path_buf());
    subsystems::initialize_all_dbs(&store.root).expect("init dbs");
    (dir, store)
}

fn tested_proposal(store: &Store, path: &str, before: &str, after: &str) -> String {
    let (id, _) = proposals::create_proposal(
        store,
        &NewProposal {
            persona: Persona::Imperium,
            file_path: path.to_string(),
            code_before: before.to_string(),
            code_after: after.to_string(),
            description: "Replace print with debugPrint".to_string(),
            improvement_type: "performance".to_string(),
            confidence: 0.8,
        },
        &AnalysisConfig::default(),
    )
    .unwrap();
    proposals::approve(store, &id).unwrap();
    assert!(proposals::test_proposal(store, &id).unwrap().passed);
    id
}

fn backups(dir: &std::path::Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.contains(".backup."))
        .collect()
}

#[test]
fn applies_tested_proposal_with_backup() {
    let (_dir, store) = temp_store();
    let ws = tempdir().unwrap();
    fs::create_dir_all(ws.path().join("lib")).unwrap();
    fs::write(ws.path().join("lib/main.dart"), BEFORE).unwrap();
    let id = tested_proposal(&store, "lib/main.dart", BEFORE, AFTER);

    let report = auto_apply::apply_ready(&store, ws.path(), false).unwrap();
    assert_eq!(report.considered, 1);
    assert_eq!(report.count(ApplyAction::Applied), 1);

    assert_eq!(fs::read_to_string(ws.path().join("lib/main.dart")).unwrap(), AFTER);
    let b = backups(&ws.path().join("lib"));
    assert_eq!(b.len(), 1);
    assert_eq!(
        fs::read_to_string(ws.path().join("lib").join(&b[0])).unwrap(),
        BEFORE
    );
    assert!(!ws.path().join("lib/main.dart.custodes.tmp").exists());

    let p = proposals::get(&store, &id).unwrap();
    assert_eq!(p.status, ProposalStatus::Applied);

    // Nothing left to apply.
    let again = auto_apply::apply_ready(&store, ws.path(), false).unwrap();
    assert_eq!(again.considered, 0);
}

#[test]
fn changed_target_marks_proposal_stale() {
    let (_dir, store) = temp_store();
    let ws = tempdir().unwrap();
    fs::write(ws.path().join("main.dart"), "void main() { print('edited'); }\n").unwrap();
    let id = tested_proposal(&store, "main.dart", BEFORE, AFTER);

    let report = auto_apply::apply_ready(&store, ws.path(), false).unwrap();
    assert_eq!(report.count(ApplyAction::Stale), 1);
    assert_eq!(
        fs::read_to_string(ws.path().join("main.dart")).unwrap(),
        "void main() { print('edited'); }\n"
    );
    assert!(backups(ws.path()).is_empty());

    let p = proposals::get(&store, &id).unwrap();
    assert_eq!(p.status, ProposalStatus::TestFailed);
    assert_eq!(p.test_status, TestStatus::Failed);
}

#[test]
fn missing_target_is_stale_unless_new_file() {
    let (_dir, store) = temp_store();
    let ws = tempdir().unwrap();
    tested_proposal(&store, "gone.dart", BEFORE, AFTER);
    tested_proposal(&store, "lib/fresh.dart", "", "void fresh() {}\n");

    let report = auto_apply::apply_ready(&store, ws.path(), false).unwrap();
    assert_eq!(report.count(ApplyAction::Stale), 1);
    assert_eq!(report.count(ApplyAction::Applied), 1);
    assert_eq!(
        fs::read_to_string(ws.path().join("lib/fresh.dart")).unwrap(),
        "void fresh() {}\n"
    );
    assert!(!ws.path().join("gone.dart").exists());
}

#[test]
fn unsafe_path_is_never_written() {
    let (_dir, store) = temp_store();
    let outer = tempdir().unwrap();
    let ws = outer.path().join("ws");
    fs::create_dir_all(&ws).unwrap();
    fs::write(outer.path().join("victim.dart"), BEFORE).unwrap();
    let id = tested_proposal(&store, "../victim.dart", BEFORE, AFTER);

    let report = auto_apply::apply_ready(&store, &ws, false).unwrap();
    assert_eq!(report.count(ApplyAction::Stale), 1);
    assert_eq!(
        fs::read_to_string(outer.path().join("victim.dart")).unwrap(),
        BEFORE
    );
    assert_eq!(
        proposals::get(&store, &id).unwrap().status,
        ProposalStatus::TestFailed
    );
}

#[test]
fn dry_run_changes_nothing() {
    let (_dir, store) = temp_store();
    let ws = tempdir().unwrap();
    fs::write(ws.path().join("main.dart"), BEFORE).unwrap();
    let id = tested_proposal(&store, "main.dart", BEFORE, AFTER);

    let report = auto_apply::apply_ready(&store, ws.path(), true).unwrap();
    assert_eq!(report.count(ApplyAction::WouldApply), 1);
    assert_eq!(fs::read_to_string(ws.path().join("main.dart")).unwrap(), BEFORE);
    assert!(backups(ws.path()).is_empty());
    assert_eq!(
        proposals::get(&store, &id).unwrap().status,
        ProposalStatus::TestPassed
    );
}

#[test]
fn untested_proposals_are_ignored() {
    let (_dir, store) = temp_store();
    let ws = tempdir().unwrap();
    fs::write(ws.path().join("main.dart"), BEFORE).unwrap();
    let (id, _) = proposals::create_proposal(
        &store,
        &NewProposal {
            persona: Persona::Imperium,
            file_path: "main.dart".to_string(),
            code_before: BEFORE.to_string(),
            code_after: AFTER.to_string(),
            description: "d".to_string(),
            improvement_type: "performance".to_string(),
            confidence: 0.8,
        },
        &AnalysisConfig::default(),
    )
    .unwrap();
    proposals::approve(&store, &id).unwrap();

    let report = auto_apply::apply_ready(&store, ws.path(), false).unwrap();
    assert_eq!(report.considered, 0);
    assert_eq!(fs::read_to_string(ws.path().join("main.dart")).unwrap(), BEFORE);
}
