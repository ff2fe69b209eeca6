//! Custody test construction and the generator fallback chain.
//!
//! A [`CustodyTest`] is built from a fixed template per category, specialised
//! by the persona's [`LearningProfile`]. Generators answer and score it; the
//! [`FallbackChain`] tries them in order under a timeout each.

use crate::core::error::CustodesError;
use crate::core::output::compact_line;
use crate::core::time;
use crate::plugins::learning::LearningProfile;
use crate::plugins::llm::LlmProvider;
use crate::plugins::persona::Persona;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestDifficulty {
    Basic,
    Intermediate,
    Advanced,
    Expert,
    Master,
    Legendary,
}

impl TestDifficulty {
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=3 => TestDifficulty::Basic,
            4..=6 => TestDifficulty::Intermediate,
            7..=9 => TestDifficulty::Advanced,
            10..=12 => TestDifficulty::Expert,
            13..=15 => TestDifficulty::Master,
            _ => TestDifficulty::Legendary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestDifficulty::Basic => "basic",
            TestDifficulty::Intermediate => "intermediate",
            TestDifficulty::Advanced => "advanced",
            TestDifficulty::Expert => "expert",
            TestDifficulty::Master => "master",
            TestDifficulty::Legendary => "legendary",
        }
    }

    pub fn xp_reward(self) -> i64 {
        match self {
            TestDifficulty::Basic => 10,
            TestDifficulty::Intermediate => 20,
            TestDifficulty::Advanced => 35,
            TestDifficulty::Expert => 50,
            TestDifficulty::Master => 75,
            TestDifficulty::Legendary => 100,
        }
    }

    pub fn time_limit_secs(self) -> u64 {
        match self {
            TestDifficulty::Basic => 300,
            TestDifficulty::Intermediate => 600,
            TestDifficulty::Advanced => 900,
            TestDifficulty::Expert => 1200,
            TestDifficulty::Master => 1800,
            TestDifficulty::Legendary => 3600,
        }
    }
}

impl fmt::Display for TestDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    KnowledgeVerification,
    CodeQuality,
    SecurityAwareness,
    PerformanceOptimization,
    InnovationCapability,
    SelfImprovement,
    CrossAiCollaboration,
    ExperimentalValidation,
}

impl TestCategory {
    pub const ALL: [TestCategory; 8] = [
        TestCategory::KnowledgeVerification,
        TestCategory::CodeQuality,
        TestCategory::SecurityAwareness,
        TestCategory::PerformanceOptimization,
        TestCategory::InnovationCapability,
        TestCategory::SelfImprovement,
        TestCategory::CrossAiCollaboration,
        TestCategory::ExperimentalValidation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestCategory::KnowledgeVerification => "knowledge_verification",
            TestCategory::CodeQuality => "code_quality",
            TestCategory::SecurityAwareness => "security_awareness",
            TestCategory::PerformanceOptimization => "performance_optimization",
            TestCategory::InnovationCapability => "innovation_capability",
            TestCategory::SelfImprovement => "self_improvement",
            TestCategory::CrossAiCollaboration => "cross_ai_collaboration",
            TestCategory::ExperimentalValidation => "experimental_validation",
        }
    }

    /// Categories offered at a difficulty band.
    pub fn band(difficulty: TestDifficulty) -> &'static [TestCategory] {
        match difficulty {
            TestDifficulty::Basic | TestDifficulty::Intermediate => &[
                TestCategory::KnowledgeVerification,
                TestCategory::CodeQuality,
                TestCategory::SecurityAwareness,
            ],
            TestDifficulty::Advanced | TestDifficulty::Expert => &[
                TestCategory::PerformanceOptimization,
                TestCategory::InnovationCapability,
                TestCategory::SelfImprovement,
            ],
            TestDifficulty::Master | TestDifficulty::Legendary => &[
                TestCategory::CrossAiCollaboration,
                TestCategory::ExperimentalValidation,
                TestCategory::InnovationCapability,
            ],
        }
    }

    /// Deterministic pick within the band, rotating on the number of tests taken.
    pub fn rotate(difficulty: TestDifficulty, tests_taken: i64) -> Self {
        let band = Self::band(difficulty);
        band[(tests_taken.unsigned_abs() as usize) % band.len()]
    }

    /// Vocabulary a persona studies after failing this category.
    pub fn study_terms(self) -> &'static [&'static str] {
        match self {
            TestCategory::KnowledgeVerification => {
                &["memoization", "input validation", "feature flags", "lazy loading"]
            }
            TestCategory::CodeQuality => &[
                "readability",
                "maintainability",
                "naming",
                "magic number",
                "duplication",
            ],
            TestCategory::SecurityAwareness => &[
                "injection",
                "xss",
                "authentication",
                "authorization",
                "race",
            ],
            TestCategory::PerformanceOptimization => &[
                "complexity",
                "big o",
                "profiling",
                "bottleneck",
                "efficiency",
            ],
            TestCategory::InnovationCapability
            | TestCategory::SelfImprovement
            | TestCategory::CrossAiCollaboration
            | TestCategory::ExperimentalValidation => {
                &["apply", "implement", "practice", "real-world", "use"]
            }
        }
    }
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestCategory {
    type Err = CustodesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        TestCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| CustodesError::ValidationError(format!("unknown test category '{}'", s)))
    }
}

/// How an answer is scored. All rubrics start at 0.5 and clamp to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rubric {
    Knowledge {
        key_concept: String,
        correct_answer: String,
    },
    CodeQuality {
        expected_issues: Vec<String>,
    },
    Security {
        expected_vulnerability: String,
    },
    Performance,
    General {
        subject: String,
    },
}

const QUALITY_TERMS: [&str; 4] = ["readability", "performance", "security", "maintainability"];
const SECURITY_TERMS: [&str; 6] = [
    "injection",
    "xss",
    "buffer",
    "race",
    "authentication",
    "authorization",
];
const PERFORMANCE_TERMS: [&str; 5] = [
    "complexity",
    "optimization",
    "profiling",
    "bottleneck",
    "efficiency",
];
const GENERAL_TERMS: [&str; 5] = ["apply", "implement", "use", "practice", "real-world"];

impl Rubric {
    /// Every term the rubric rewards.
    pub fn keywords(&self) -> Vec<String> {
        let owned = |terms: &[&str]| terms.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        match self {
            Rubric::Knowledge { key_concept, .. } => vec![key_concept.clone()],
            Rubric::CodeQuality { expected_issues } => {
                let mut k = owned(&QUALITY_TERMS);
                k.extend(expected_issues.iter().cloned());
                k
            }
            Rubric::Security {
                expected_vulnerability,
            } => {
                let mut k = vec![expected_vulnerability.clone()];
                k.extend(owned(&SECURITY_TERMS));
                k.dedup();
                k
            }
            Rubric::Performance => {
                let mut k = owned(&PERFORMANCE_TERMS);
                k.push("big o".to_string());
                k
            }
            Rubric::General { subject } => {
                let mut k = vec![subject.clone()];
                k.extend(owned(&GENERAL_TERMS));
                k
            }
        }
    }

    /// Score a response in [0, 1].
    pub fn score(&self, response: &str) -> f64 {
        let text = response.to_lowercase();
        let count = |terms: &[&str]| terms.iter().filter(|t| text.contains(*t)).count() as f64;
        let raw = match self {
            Rubric::Knowledge {
                key_concept,
                correct_answer,
            } => {
                if !correct_answer.is_empty() && text.contains(&correct_answer.to_lowercase()) {
                    1.0
                } else if text.contains(&key_concept.to_lowercase()) {
                    0.8
                } else {
                    0.6
                }
            }
            Rubric::CodeQuality { expected_issues } => {
                let found = expected_issues
                    .iter()
                    .filter(|i| text.contains(&i.to_lowercase()))
                    .count() as f64;
                0.5 + 0.1 * count(&QUALITY_TERMS) + 0.1 * found
            }
            Rubric::Security {
                expected_vulnerability,
            } => {
                let mut s = 0.5;
                if text.contains(&expected_vulnerability.to_lowercase()) {
                    s += 0.3;
                }
                s + 0.05 * count(&SECURITY_TERMS)
            }
            Rubric::Performance => {
                let mut s = 0.5 + 0.1 * count(&PERFORMANCE_TERMS);
                if text.contains("o(") || text.contains("big o") {
                    s += 0.2;
                }
                s
            }
            Rubric::General { subject } => {
                let mut s = 0.5;
                if text.contains(&subject.to_lowercase()) {
                    s += 0.2;
                }
                s + 0.1 * count(&GENERAL_TERMS)
            }
        };
        raw.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyTest {
    pub id: String,
    pub persona: Persona,
    pub category: TestCategory,
    pub difficulty: TestDifficulty,
    pub title: String,
    pub prompt: String,
    pub rubric: Rubric,
    pub time_limit_secs: u64,
}

fn persona_subject(persona: Persona) -> &'static str {
    match persona {
        Persona::Imperium => "memoization",
        Persona::Guardian => "input validation",
        Persona::Sandbox => "feature flags",
        Persona::Conquest => "lazy loading",
    }
}

const QUALITY_SNIPPET: &str = "int f(List<int> a) {\n  var t = 0;\n  for (var i = 0; i < a.length; i++) { if (a[i] > 86400) t += a[i]; }\n  for (var i = 0; i < a.length; i++) { if (a[i] > 86400) t += a[i]; }\n  return t;\n}";
const SECURITY_SNIPPET: &str = "final query = \"SELECT * FROM users WHERE name = '\" + name + \"'\";\nfinal rows = await db.rawQuery(query);";
const PERFORMANCE_SNIPPET: &str = "for (final a in items) {\n  for (final b in items) {\n    if (a.id == b.parentId) children.add(b);\n  }\n}";

impl CustodyTest {
    pub fn build(
        persona: Persona,
        category: TestCategory,
        difficulty: TestDifficulty,
        profile: &LearningProfile,
    ) -> Self {
        let subject = profile
            .subjects
            .first()
            .cloned()
            .unwrap_or_else(|| persona_subject(persona).to_string());

        let (title, prompt, rubric) = match category {
            TestCategory::KnowledgeVerification => (
                format!("Knowledge check: {}", subject),
                format!(
                    "Explain {} and when the {} persona should rely on it.",
                    subject, persona
                ),
                Rubric::Knowledge {
                    key_concept: subject.clone(),
                    correct_answer: String::new(),
                },
            ),
            TestCategory::CodeQuality => (
                "Review for code quality".to_string(),
                format!(
                    "Review this code and list its quality problems:\n\n{}",
                    QUALITY_SNIPPET
                ),
                Rubric::CodeQuality {
                    expected_issues: vec![
                        "naming".to_string(),
                        "magic number".to_string(),
                        "duplication".to_string(),
                    ],
                },
            ),
            TestCategory::SecurityAwareness => (
                "Spot the vulnerability".to_string(),
                format!(
                    "Identify the vulnerability in this code and how to fix it:\n\n{}",
                    SECURITY_SNIPPET
                ),
                Rubric::Security {
                    expected_vulnerability: "injection".to_string(),
                },
            ),
            TestCategory::PerformanceOptimization => (
                "Optimize the hot path".to_string(),
                format!(
                    "Explain the cost of this loop and how you would make it faster:\n\n{}",
                    PERFORMANCE_SNIPPET
                ),
                Rubric::Performance,
            ),
            TestCategory::InnovationCapability
            | TestCategory::SelfImprovement
            | TestCategory::CrossAiCollaboration
            | TestCategory::ExperimentalValidation => (
                format!("{}: {}", category, subject),
                format!(
                    "Propose a concrete plan for {} as part of {}, including how you would validate it.",
                    subject,
                    category.as_str().replace('_', " ")
                ),
                Rubric::General {
                    subject: subject.clone(),
                },
            ),
        };

        Self {
            id: time::new_event_id(),
            persona,
            category,
            difficulty,
            title,
            prompt,
            rubric,
            time_limit_secs: difficulty.time_limit_secs(),
        }
    }
}

/// A generator's answer and its score in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedResult {
    pub response: String,
    pub score: f64,
    pub feedback: String,
}

#[async_trait]
pub trait TestGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn administer(
        &self,
        test: &CustodyTest,
        profile: &LearningProfile,
    ) -> Result<GeneratedResult, CustodesError>;
}

/// Deterministic in-process generator: the persona answers with the rubric
/// terms it has learned, and the rubric scores that answer.
pub struct RubricTestGenerator;

impl RubricTestGenerator {
    pub fn answer(test: &CustodyTest, profile: &LearningProfile) -> String {
        let mut answer = format!(
            "As {}, which {}, I would approach this as follows.",
            test.persona,
            test.persona.purpose()
        );
        for term in test.rubric.keywords() {
            if profile.knows(&term) {
                answer.push_str(&format!(" I would address {}.", term));
            }
        }
        answer
    }
}

#[async_trait]
impl TestGenerator for RubricTestGenerator {
    fn name(&self) -> &str {
        "rubric"
    }

    async fn administer(
        &self,
        test: &CustodyTest,
        profile: &LearningProfile,
    ) -> Result<GeneratedResult, CustodesError> {
        let response = Self::answer(test, profile);
        let score = test.rubric.score(&response) * 100.0;
        let missing: Vec<String> = test
            .rubric
            .keywords()
            .into_iter()
            .filter(|k| !response.to_lowercase().contains(&k.to_lowercase()))
            .collect();
        let feedback = if missing.is_empty() {
            "Answer covered every rubric point".to_string()
        } else {
            format!("Missing: {}", missing.join(", "))
        };
        Ok(GeneratedResult {
            response,
            score,
            feedback,
        })
    }
}

static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("static regex"));

/// First number in a grader reply, clamped to [0, 100]; 50 when none is found.
pub fn extract_score(text: &str) -> f64 {
    SCORE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|s| s.clamp(0.0, 100.0))
        .unwrap_or(50.0)
}

/// Asks the provider to answer as the persona, then to grade that answer.
pub struct LlmTestGenerator {
    provider: Arc<dyn LlmProvider>,
    max_tokens: u32,
}

impl LlmTestGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }
}

#[async_trait]
impl TestGenerator for LlmTestGenerator {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn administer(
        &self,
        test: &CustodyTest,
        profile: &LearningProfile,
    ) -> Result<GeneratedResult, CustodesError> {
        let system = format!(
            "You are {}, an AI persona that {}. Known focus areas: {}.",
            test.persona,
            test.persona.purpose(),
            profile.improvement_types.join(", ")
        );
        let response = self
            .provider
            .complete(&system, &test.prompt, self.max_tokens)
            .await?;

        let grading_prompt = format!(
            "Question:\n{}\n\nAnswer:\n{}\n\nA strong answer covers: {}.\nReply with a single score from 0 to 100, then one sentence of feedback.",
            test.prompt,
            response,
            test.rubric.keywords().join(", ")
        );
        let grade = self
            .provider
            .complete(
                "You grade answers to engineering questions strictly and briefly.",
                &grading_prompt,
                256,
            )
            .await?;

        Ok(GeneratedResult {
            response,
            score: extract_score(&grade),
            feedback: compact_line(&grade, 200),
        })
    }
}

/// Ordered generators, each under its own timeout. The first success wins.
pub struct FallbackChain {
    generators: Vec<Arc<dyn TestGenerator>>,
    timeout: Duration,
}

impl FallbackChain {
    pub fn new(generators: Vec<Arc<dyn TestGenerator>>, timeout: Duration) -> Self {
        Self {
            generators,
            timeout,
        }
    }

    pub fn generator_names(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.name().to_string()).collect()
    }

    /// Returns the result and the name of the generator that produced it.
    pub async fn run(
        &self,
        test: &CustodyTest,
        profile: &LearningProfile,
    ) -> Result<(GeneratedResult, String), CustodesError> {
        let mut failures = Vec::new();
        for generator in &self.generators {
            match tokio::time::timeout(self.timeout, generator.administer(test, profile)).await {
                Ok(Ok(result)) => {
                    let mut result = result;
                    result.score = result.score.clamp(0.0, 100.0);
                    return Ok((result, generator.name().to_string()));
                }
                Ok(Err(e)) => {
                    tracing::warn!(generator = generator.name(), test_id = %test.id, error = %e, "test generator failed; trying next");
                    failures.push(format!("{}: {}", generator.name(), e));
                }
                Err(_) => {
                    tracing::warn!(generator = generator.name(), test_id = %test.id, timeout_secs = self.timeout.as_secs(), "test generator timed out; trying next");
                    failures.push(format!("{}: timed out", generator.name()));
                }
            }
        }
        Err(CustodesError::GeneratorError(if failures.is_empty() {
            "no test generators configured".to_string()
        } else {
            format!("all test generators failed ({})", failures.join("; "))
        }))
    }
}
