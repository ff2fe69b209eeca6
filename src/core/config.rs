//! `custodes.toml` loading and validation.
//!
//! A missing file is not an error: every section has defaults matching the
//! production cadence. Values are validated once after load so the scheduler
//! never starts with a zero interval or an out-of-range threshold.

use crate::core::error::CustodesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub gate: GateConfig,
    pub custody: CustodyConfig,
    pub analysis: AnalysisConfig,
    pub repo: RepoConfig,
    pub github: GithubConfig,
    pub llm: LlmConfig,
    pub apply: ApplyConfig,
}

/// Background loop identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Custody,
    Learning,
    Olympic,
    Collaborative,
    Proposal,
    AutoApply,
}

impl LoopKind {
    pub const ALL: [LoopKind; 6] = [
        LoopKind::Custody,
        LoopKind::Learning,
        LoopKind::Olympic,
        LoopKind::Collaborative,
        LoopKind::Proposal,
        LoopKind::AutoApply,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LoopKind::Custody => "custody",
            LoopKind::Learning => "learning",
            LoopKind::Olympic => "olympic",
            LoopKind::Collaborative => "collaborative",
            LoopKind::Proposal => "proposal",
            LoopKind::AutoApply => "auto_apply",
        }
    }
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub custody_interval_secs: u64,
    pub learning_interval_secs: u64,
    pub olympic_interval_secs: u64,
    pub collaborative_interval_secs: u64,
    pub proposal_interval_secs: u64,
    pub auto_apply_interval_secs: u64,
    pub enabled_loops: Vec<LoopKind>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            custody_interval_secs: 20 * 60,
            learning_interval_secs: 30 * 60,
            olympic_interval_secs: 45 * 60,
            collaborative_interval_secs: 90 * 60,
            proposal_interval_secs: 30 * 60,
            auto_apply_interval_secs: 30,
            enabled_loops: LoopKind::ALL.to_vec(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, kind: LoopKind) -> Duration {
        let secs = match kind {
            LoopKind::Custody => self.custody_interval_secs,
            LoopKind::Learning => self.learning_interval_secs,
            LoopKind::Olympic => self.olympic_interval_secs,
            LoopKind::Collaborative => self.collaborative_interval_secs,
            LoopKind::Proposal => self.proposal_interval_secs,
            LoopKind::AutoApply => self.auto_apply_interval_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Thresholds for the two eligibility gates.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    pub level_up_window: usize,
    pub level_up_min_pass_rate: f64,
    pub level_up_max_consecutive_failures: i64,
    pub proposal_min_passed_tests: i64,
    pub proposal_revoke_after_failures: i64,
    pub proposal_recency_secs: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            level_up_window: 5,
            level_up_min_pass_rate: 0.8,
            level_up_max_consecutive_failures: 2,
            proposal_min_passed_tests: 1,
            proposal_revoke_after_failures: 3,
            proposal_recency_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CustodyConfig {
    pub pass_score: f64,
    pub generator_timeout_secs: u64,
    pub history_limit: usize,
    pub olympic_bonus_xp: i64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            pass_score: 70.0,
            generator_timeout_secs: 60,
            history_limit: 50,
            olympic_bonus_xp: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub max_files: usize,
    pub max_proposals_per_run: usize,
    pub max_file_bytes: usize,
    /// Pending proposals a persona may hold before new ones are declined.
    pub max_pending_per_persona: usize,
    pub max_daily_per_persona: usize,
    pub min_confidence: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_files: 50,
            max_proposals_per_run: 3,
            max_file_bytes: 200_000,
            max_pending_per_persona: 2,
            max_daily_per_persona: 10,
            min_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoConfig {
    pub local_path: PathBuf,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("."),
        }
    }
}

/// GitHub is used as the repository source when both `owner` and `repo` are set.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token_env: String,
    pub api_base: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            branch: "main".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            api_base: "https://api.github.com".to_string(),
        }
    }
}

impl GithubConfig {
    pub fn is_configured(&self) -> bool {
        !self.owner.is_empty() && !self.repo.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    None,
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    /// Empty means the provider's default model.
    pub model: String,
    /// Empty means `ANTHROPIC_API_KEY` / `OPENAI_API_KEY`.
    pub api_key_env: String,
    /// Empty means the provider's public endpoint.
    pub api_base: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Directory proposals are written into; falls back to `repo.local_path`.
    pub workspace: Option<PathBuf>,
}

impl Config {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, CustodesError> {
        if !path.exists() {
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CustodesError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CustodesError> {
        for kind in LoopKind::ALL {
            if self.scheduler.interval(kind).is_zero() {
                return Err(CustodesError::ConfigError(format!(
                    "scheduler interval for '{}' must be greater than zero",
                    kind
                )));
            }
        }
        let gate = &self.gate;
        if gate.level_up_window == 0 {
            return Err(CustodesError::ConfigError(
                "gate.level_up_window must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&gate.level_up_min_pass_rate) {
            return Err(CustodesError::ConfigError(format!(
                "gate.level_up_min_pass_rate must be within [0, 1], got {}",
                gate.level_up_min_pass_rate
            )));
        }
        if gate.proposal_revoke_after_failures < 1 || gate.proposal_recency_secs < 1 {
            return Err(CustodesError::ConfigError(
                "gate.proposal_revoke_after_failures and gate.proposal_recency_secs must be positive"
                    .to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.custody.pass_score) {
            return Err(CustodesError::ConfigError(format!(
                "custody.pass_score must be within [0, 100], got {}",
                self.custody.pass_score
            )));
        }
        if self.custody.generator_timeout_secs == 0 {
            return Err(CustodesError::ConfigError(
                "custody.generator_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.custody.history_limit < gate.level_up_window {
            return Err(CustodesError::ConfigError(format!(
                "custody.history_limit ({}) must cover gate.level_up_window ({})",
                self.custody.history_limit, gate.level_up_window
            )));
        }
        if !(0.0..=1.0).contains(&self.analysis.min_confidence) {
            return Err(CustodesError::ConfigError(format!(
                "analysis.min_confidence must be within [0, 1], got {}",
                self.analysis.min_confidence
            )));
        }
        Ok(())
    }

    pub fn apply_workspace(&self) -> PathBuf {
        self.apply
            .workspace
            .clone()
            .unwrap_or_else(|| self.repo.local_path.clone())
    }

    /// Render the defaults written by `custodes init`.
    pub fn default_toml() -> Result<String, CustodesError> {
        toml::to_string_pretty(&Config::default())
            .map_err(|e| CustodesError::ConfigError(e.to_string()))
    }
}
