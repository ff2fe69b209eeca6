//! Custody test administration.
//!
//! Each administered test is built from the persona's current level and
//! learning profile, answered through the generator fallback chain, and
//! recorded with exactly one metrics update. If every generator fails, no
//! result is recorded.

use crate::core::broker::run_blocking;
use crate::core::config::Config;
use crate::core::error::CustodesError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::eligibility::{self, Eligibility};
use crate::plugins::generators::{
    CustodyTest, FallbackChain, LlmTestGenerator, RubricTestGenerator, TestCategory,
    TestDifficulty, TestGenerator,
};
use crate::plugins::learning::{self, LearningProfile};
use crate::plugins::llm;
use crate::plugins::metrics::{self, AgentMetrics, TestOutcome};
use crate::plugins::persona::Persona;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyReport {
    pub persona: Persona,
    pub test_id: String,
    pub title: String,
    pub category: TestCategory,
    pub difficulty: TestDifficulty,
    pub generator: String,
    pub score: f64,
    pub passed: bool,
    pub feedback: String,
    pub xp_awarded: i64,
    pub previous_level: i64,
    pub level: i64,
    pub leveled_up: bool,
    pub level_up: Eligibility,
    pub proposal_generation: Eligibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlympicReport {
    pub difficulty: TestDifficulty,
    pub results: Vec<CustodyReport>,
    pub winner: Option<Persona>,
    pub bonus_xp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborativeReport {
    pub difficulty: TestDifficulty,
    pub individual_scores: Vec<(Persona, f64)>,
    pub team_score: f64,
    pub passed: bool,
    pub results: Vec<CustodyReport>,
}

/// A test that has been answered but not yet recorded.
struct Answered {
    test: CustodyTest,
    generator: String,
    score: f64,
    feedback: String,
}

pub struct CustodyService {
    store: Store,
    config: Arc<Config>,
    chain: Arc<FallbackChain>,
}

impl CustodyService {
    pub fn new(store: Store, config: Arc<Config>, chain: FallbackChain) -> Self {
        Self {
            store,
            config,
            chain: Arc::new(chain),
        }
    }

    /// LLM generator first when one is configured, the rubric generator last.
    pub fn from_config(store: Store, config: Arc<Config>) -> Result<Self, CustodesError> {
        let mut generators: Vec<Arc<dyn TestGenerator>> = Vec::new();
        if let Some(provider) = llm::build_provider(&config.llm)? {
            generators.push(Arc::new(LlmTestGenerator::new(
                provider,
                llm::effective_max_tokens(&config.llm),
            )));
        }
        generators.push(Arc::new(RubricTestGenerator));
        let chain = FallbackChain::new(
            generators,
            Duration::from_secs(config.custody.generator_timeout_secs),
        );
        tracing::debug!(generators = ?chain.generator_names(), "custody fallback chain built");
        Ok(Self::new(store, config, chain))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn load_state(&self, persona: Persona) -> Result<(AgentMetrics, LearningProfile), CustodesError> {
        let s = self.store.clone();
        run_blocking(move || {
            let m = metrics::get_or_create(&s, persona)?;
            let p = learning::profile(&s, persona)?;
            Ok((m, p))
        })
        .await
    }

    async fn answer(
        &self,
        persona: Persona,
        category: Option<TestCategory>,
        difficulty: Option<TestDifficulty>,
    ) -> Result<Answered, CustodesError> {
        let (m, profile) = self.load_state(persona).await?;
        let difficulty = difficulty.unwrap_or_else(|| TestDifficulty::from_level(m.level));
        let category =
            category.unwrap_or_else(|| TestCategory::rotate(difficulty, m.total_tests_given));
        let test = CustodyTest::build(persona, category, difficulty, &profile);
        tracing::debug!(persona = %persona, test_id = %test.id, category = %category, difficulty = %difficulty, "administering custody test");

        let (result, generator) = self.chain.run(&test, &profile).await?;
        Ok(Answered {
            test,
            generator,
            score: result.score,
            feedback: result.feedback,
        })
    }

    async fn record(&self, answered: Answered, score: f64) -> Result<CustodyReport, CustodesError> {
        let passed = score >= self.config.custody.pass_score;
        let persona = answered.test.persona;
        let outcome = TestOutcome {
            category: answered.test.category,
            difficulty: answered.test.difficulty,
            score,
            passed,
            generator: answered.generator.clone(),
            feedback: answered.feedback.clone(),
        };
        let now = time::now_secs();
        let s = self.store.clone();
        let gate = self.config.gate.clone();
        let history_limit = self.config.custody.history_limit;
        let recorded = run_blocking(move || {
            metrics::record_test(&s, persona, &outcome, &gate, history_limit, now)
        })
        .await?;

        let report = CustodyReport {
            persona,
            test_id: recorded.test_id,
            title: answered.test.title,
            category: answered.test.category,
            difficulty: answered.test.difficulty,
            generator: answered.generator,
            score,
            passed,
            feedback: answered.feedback,
            xp_awarded: recorded.xp_awarded,
            previous_level: recorded.previous_level,
            level: recorded.metrics.level,
            leveled_up: recorded.leveled_up,
            level_up: eligibility::level_up(&recorded.metrics, &self.config.gate, now),
            proposal_generation: eligibility::proposal_generation(
                &recorded.metrics,
                &self.config.gate,
                now,
            ),
        };
        tracing::info!(
            persona = %persona,
            category = %report.category,
            difficulty = %report.difficulty,
            generator = %report.generator,
            score = report.score,
            passed = report.passed,
            level = report.level,
            "custody test recorded"
        );
        if report.leveled_up {
            tracing::info!(persona = %persona, from = report.previous_level, to = report.level, "persona leveled up");
        }
        Ok(report)
    }

    /// Administer one custody test to one persona.
    pub async fn administer(
        &self,
        persona: Persona,
        category: Option<TestCategory>,
    ) -> Result<CustodyReport, CustodesError> {
        let answered = self.answer(persona, category, None).await?;
        let score = answered.score;
        self.record(answered, score).await
    }

    /// One test per persona. A failure for one persona does not stop the rest.
    pub async fn administer_all(&self) -> Vec<CustodyReport> {
        let mut reports = Vec::new();
        for persona in Persona::ALL {
            match self.administer(persona, None).await {
                Ok(r) => reports.push(r),
                Err(e) => tracing::error!(persona = %persona, error = %e, "custody test failed"),
            }
        }
        reports
    }

    async fn hardest_difficulty(&self) -> Result<TestDifficulty, CustodesError> {
        let s = self.store.clone();
        let all = run_blocking(move || metrics::list_all(&s)).await?;
        Ok(all
            .iter()
            .map(|m| TestDifficulty::from_level(m.level))
            .max()
            .unwrap_or(TestDifficulty::Basic))
    }

    /// Every persona takes a test at the hardest difficulty among them; the
    /// top passing score earns bonus XP.
    pub async fn olympic_event(&self) -> Result<OlympicReport, CustodesError> {
        let difficulty = self.hardest_difficulty().await?;
        let mut results = Vec::new();
        for persona in Persona::ALL {
            let answered = match self.answer(persona, None, Some(difficulty)).await {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!(persona = %persona, error = %e, "olympic test failed");
                    continue;
                }
            };
            let score = answered.score;
            match self.record(answered, score).await {
                Ok(r) => results.push(r),
                Err(e) => tracing::error!(persona = %persona, error = %e, "olympic result not recorded"),
            }
        }

        let winner = results
            .iter()
            .filter(|r| r.passed)
            .fold(None::<&CustodyReport>, |best, r| match best {
                Some(b) if b.score >= r.score => Some(b),
                _ => Some(r),
            })
            .map(|r| r.persona);

        let bonus_xp = self.config.custody.olympic_bonus_xp;
        if let Some(w) = winner {
            let s = self.store.clone();
            let gate = self.config.gate.clone();
            let now = time::now_secs();
            run_blocking(move || metrics::award_xp(&s, w, bonus_xp, "olympic_winner", &gate, now))
                .await?;
            tracing::info!(winner = %w, bonus_xp, "olympic event winner");
        } else {
            tracing::info!("olympic event finished without a passing winner");
        }

        Ok(OlympicReport {
            difficulty,
            results,
            winner,
            bonus_xp: if winner.is_some() { bonus_xp } else { 0 },
        })
    }

    /// All personas answer a shared collaboration test; the mean score is
    /// the team result recorded for every participant.
    pub async fn collaborative_test(&self) -> Result<CollaborativeReport, CustodesError> {
        let difficulty = self.hardest_difficulty().await?;
        let mut answers = Vec::new();
        for persona in Persona::ALL {
            match self
                .answer(persona, Some(TestCategory::CrossAiCollaboration), Some(difficulty))
                .await
            {
                Ok(a) => answers.push(a),
                Err(e) => tracing::error!(persona = %persona, error = %e, "collaborative answer failed"),
            }
        }
        if answers.is_empty() {
            return Err(CustodesError::GeneratorError(
                "no persona could answer the collaborative test".to_string(),
            ));
        }

        let individual_scores: Vec<(Persona, f64)> =
            answers.iter().map(|a| (a.test.persona, a.score)).collect();
        let team_score =
            individual_scores.iter().map(|(_, s)| s).sum::<f64>() / individual_scores.len() as f64;
        let passed = team_score >= self.config.custody.pass_score;

        let mut results = Vec::new();
        for mut answered in answers {
            answered.feedback = format!(
                "team score {:.1} (own {:.1}); {}",
                team_score, answered.score, answered.feedback
            );
            let persona = answered.test.persona;
            match self.record(answered, team_score).await {
                Ok(r) => results.push(r),
                Err(e) => tracing::error!(persona = %persona, error = %e, "collaborative result not recorded"),
            }
        }
        tracing::info!(team_score, passed, participants = results.len(), "collaborative test finished");

        Ok(CollaborativeReport {
            difficulty,
            individual_scores,
            team_score,
            passed,
            results,
        })
    }
}
