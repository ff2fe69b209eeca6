use async_trait::async_trait;
use custodes::core::config::Config;
use custodes::core::error::CustodesError;
use custodes::core::store::{Store, StoreKind};
use custodes::plugins::custody::CustodyService;
use custodes::plugins::generators::{
    CustodyTest, FallbackChain, GeneratedResult, TestCategory, TestDifficulty, TestGenerator,
};
use custodes::plugins::learning::LearningProfile;
use custodes::plugins::metrics;
use custodes::plugins::persona::Persona;
use custodes::subsystems;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Failing;

#[async_trait]
impl TestGenerator for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn administer(
        &self,
        _test: &CustodyTest,
        _profile: &LearningProfile,
    ) -> Result<GeneratedResult, CustodesError> {
        Err(CustodesError::GeneratorError("provider unavailable".to_string()))
    }
}

struct Slow;

#[async_trait]
impl TestGenerator for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn administer(
        &self,
        _test: &CustodyTest,
        _profile: &LearningProfile,
    ) -> Result<GeneratedResult, CustodesError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(GeneratedResult {
            response: "late".to_string(),
            score: 100.0,
            feedback: String::new(),
        })
    }
}

/// Scores each persona with a fixed value.
struct Scripted(Vec<(Persona, f64)>);

#[async_trait]
impl TestGenerator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn administer(
        &self,
        test: &CustodyTest,
        _profile: &LearningProfile,
    ) -> Result<GeneratedResult, CustodesError> {
        let score = self
            .0
            .iter()
            .find(|(p, _)| *p == test.persona)
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        Ok(GeneratedResult {
            response: format!("answer for {}", test.title),
            score,
            feedback: "scripted".to_string(),
        })
    }
}

fn uniform(score: f64) -> Scripted {
    Scripted(Persona::ALL.iter().map(|p| (*p, score)).collect())
}

fn service(generators: Vec<Arc<dyn TestGenerator>>) -> (tempfile::TempDir, CustodyService) {
    let dir = tempdir().expect("tempdir");
    let store = Store::new(StoreKind::User, dir.path().to_path_buf());
    subsystems::initialize_all_dbs(&store.root).expect("init dbs");
    let chain = FallbackChain::new(generators, Duration::from_secs(5));
    let svc = CustodyService::new(store, Arc::new(Config::default()), chain);
    (dir, svc)
}

#[tokio::test]
async fn failing_generator_falls_back_to_next() {
    let (_dir, svc) = service(vec![Arc::new(Failing), Arc::new(uniform(92.0))]);
    let report = svc.administer(Persona::Guardian, None).await.unwrap();
    assert_eq!(report.generator, "scripted");
    assert!(report.passed);
    assert_eq!(report.xp_awarded, 10);
    assert!(report.proposal_generation.eligible);

    let m = metrics::get_or_create(svc.store(), Persona::Guardian).unwrap();
    assert_eq!(m.total_tests_given, 1);
    assert_eq!(m.total_tests_passed, 1);
}

#[tokio::test]
async fn all_generators_failing_records_nothing() {
    let (_dir, svc) = service(vec![Arc::new(Failing), Arc::new(Failing)]);
    let err = svc.administer(Persona::Imperium, None).await.unwrap_err();
    assert!(matches!(err, CustodesError::GeneratorError(_)));
    assert!(err.to_string().contains("failing: "));

    let m = metrics::get_or_create(svc.store(), Persona::Imperium).unwrap();
    assert_eq!(m.total_tests_given, 0);
    assert!(metrics::test_history(svc.store(), Persona::Imperium, 10)
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_generator_times_out_and_falls_back() {
    let chain = FallbackChain::new(
        vec![Arc::new(Slow), Arc::new(uniform(75.0))],
        Duration::from_secs(60),
    );
    let profile = LearningProfile::baseline(Persona::Sandbox);
    let test = CustodyTest::build(
        Persona::Sandbox,
        TestCategory::CodeQuality,
        TestDifficulty::Basic,
        &profile,
    );
    let (result, name) = chain.run(&test, &profile).await.unwrap();
    assert_eq!(name, "scripted");
    assert_eq!(result.score, 75.0);
    assert_eq!(chain.generator_names(), vec!["slow", "scripted"]);
}

#[tokio::test]
async fn scores_below_threshold_fail_and_count() {
    let (_dir, svc) = service(vec![Arc::new(uniform(40.0))]);
    let report = svc
        .administer(Persona::Conquest, Some(TestCategory::SecurityAwareness))
        .await
        .unwrap();
    assert!(!report.passed);
    assert_eq!(report.xp_awarded, 0);
    assert_eq!(report.category, TestCategory::SecurityAwareness);
    assert!(!report.proposal_generation.eligible);

    let m = metrics::get_or_create(svc.store(), Persona::Conquest).unwrap();
    assert_eq!(m.consecutive_failures, 1);
}

#[tokio::test]
async fn categories_rotate_within_the_level_band() {
    let (_dir, svc) = service(vec![Arc::new(uniform(90.0))]);
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(svc.administer(Persona::Imperium, None).await.unwrap().category);
    }
    assert_eq!(seen, TestCategory::band(TestDifficulty::Basic).to_vec());
}

#[tokio::test]
async fn administer_all_covers_every_persona() {
    let (_dir, svc) = service(vec![Arc::new(uniform(80.0))]);
    let reports = svc.administer_all().await;
    let personas: Vec<Persona> = reports.iter().map(|r| r.persona).collect();
    assert_eq!(personas, Persona::ALL.to_vec());
}

#[tokio::test]
async fn olympic_winner_is_first_top_passing_score() {
    let (_dir, svc) = service(vec![Arc::new(Scripted(vec![
        (Persona::Imperium, 80.0),
        (Persona::Guardian, 95.0),
        (Persona::Sandbox, 60.0),
        (Persona::Conquest, 95.0),
    ]))]);
    let report = svc.olympic_event().await.unwrap();
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.winner, Some(Persona::Guardian));
    assert_eq!(report.bonus_xp, 50);

    let guardian = metrics::get_or_create(svc.store(), Persona::Guardian).unwrap();
    let conquest = metrics::get_or_create(svc.store(), Persona::Conquest).unwrap();
    assert_eq!(guardian.xp, conquest.xp + 50);
}

#[tokio::test]
async fn olympic_without_passing_score_has_no_winner() {
    let (_dir, svc) = service(vec![Arc::new(uniform(10.0))]);
    let report = svc.olympic_event().await.unwrap();
    assert_eq!(report.winner, None);
    assert_eq!(report.bonus_xp, 0);
}

#[tokio::test]
async fn collaborative_test_records_team_mean_for_everyone() {
    let (_dir, svc) = service(vec![Arc::new(Scripted(vec![
        (Persona::Imperium, 80.0),
        (Persona::Guardian, 60.0),
        (Persona::Sandbox, 70.0),
        (Persona::Conquest, 90.0),
    ]))]);
    let report = svc.collaborative_test().await.unwrap();
    assert_eq!(report.team_score, 75.0);
    assert!(report.passed);
    assert_eq!(report.results.len(), 4);
    for r in &report.results {
        assert_eq!(r.score, 75.0);
        assert!(r.passed);
        assert_eq!(r.category, TestCategory::CrossAiCollaboration);
    }

    let rows = metrics::test_history(svc.store(), Persona::Guardian, 1).unwrap();
    assert_eq!(rows[0].score, 75.0);
    assert!(rows[0].passed);
}

#[tokio::test]
async fn default_service_uses_rubric_generator() {
    let dir = tempdir().unwrap();
    let store = Store::new(StoreKind::User, dir.path().to_path_buf());
    subsystems::initialize_all_dbs(&store.root).unwrap();
    let svc = CustodyService::from_config(store, Arc::new(Config::default())).unwrap();
    let report = svc.administer(Persona::Guardian, None).await.unwrap();
    assert_eq!(report.generator, "rubric");
    assert!((0.0..=100.0).contains(&report.score));
}
