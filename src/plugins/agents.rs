//! Persona analysis passes that turn heuristic rewrites into proposals.
//!
//! A persona may only file proposals while its proposal-generation gate
//! holds; otherwise the run short-circuits with the gate's reasons.

use crate::core::broker::run_blocking;
use crate::core::config::Config;
use crate::core::error::CustodesError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::analysis::{self, FileAnalysis};
use crate::plugins::eligibility;
use crate::plugins::learning;
use crate::plugins::metrics;
use crate::plugins::persona::Persona;
use crate::plugins::proposals::{self, NewProposal};
use crate::plugins::repo::RepoSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunReport {
    pub persona: Persona,
    pub source: String,
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub findings: usize,
    pub proposals_created: Vec<String>,
    pub duplicates: usize,
    /// Rewrites refused by the persona's proposal limits.
    pub declined: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentRunOutcome {
    NotEligible { persona: Persona, reasons: Vec<String> },
    Completed(AgentRunReport),
}

async fn fetch_files(
    source: &dyn RepoSource,
    config: &Config,
) -> Result<(Vec<(String, String)>, usize), CustodesError> {
    let listed = source.list_files().await?;
    let mut files = Vec::new();
    let mut skipped = 0;
    for path in listed.into_iter().take(config.analysis.max_files) {
        match source.file_content(&path).await {
            Ok(content) if content.len() <= config.analysis.max_file_bytes => {
                files.push((path, content))
            }
            Ok(content) => {
                tracing::debug!(path = %path, bytes = content.len(), "skipping oversized file");
                skipped += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to read file; skipping");
                skipped += 1;
            }
        }
    }
    Ok((files, skipped))
}

/// One analysis pass for one persona.
pub async fn run_persona(
    store: &Store,
    config: &Config,
    persona: Persona,
    source: &dyn RepoSource,
) -> Result<AgentRunOutcome, CustodesError> {
    let now = time::now_secs();
    let s = store.clone();
    let m = run_blocking(move || metrics::get_or_create_at(&s, persona, now)).await?;
    let gate = eligibility::proposal_generation(&m, &config.gate, now);
    if !gate.eligible {
        tracing::info!(persona = %persona, reasons = ?gate.reasons, "persona not eligible to generate proposals");
        return Ok(AgentRunOutcome::NotEligible {
            persona,
            reasons: gate.reasons,
        });
    }

    let (files, files_skipped) = fetch_files(source, config).await?;
    let files_scanned = files.len();
    let (files, analyses): (Vec<(String, String)>, Vec<FileAnalysis>) =
        tokio::task::spawn_blocking(move || {
            let analyses = analysis::analyze_files(persona, &files);
            (files, analyses)
        })
        .await?;

    let findings = analyses.iter().map(|a| a.findings.len()).sum();
    let mut created = Vec::new();
    let mut duplicates = 0;
    let mut declined = 0;
    let mut improvement_types = BTreeSet::new();
    let mut file_types = BTreeSet::new();

    for ((_, before), fa) in files.iter().zip(analyses.iter()) {
        let Some(rewrite) = fa.rewrite.as_ref() else {
            continue;
        };
        if created.len() >= config.analysis.max_proposals_per_run {
            break;
        }
        let new = NewProposal {
            persona,
            file_path: fa.path.clone(),
            code_before: before.clone(),
            code_after: rewrite.code_after.clone(),
            description: rewrite.description.clone(),
            improvement_type: rewrite.improvement_type.clone(),
            confidence: rewrite.confidence,
        };
        let s = store.clone();
        let limits = config.analysis.clone();
        match run_blocking(move || proposals::create_proposal(&s, &new, &limits)).await {
            Ok((id, true)) => {
                tracing::info!(persona = %persona, proposal_id = %id, path = %fa.path, "proposal created");
                created.push(id);
            }
            Ok((_, false)) => duplicates += 1,
            Err(CustodesError::ValidationError(reason)) => {
                tracing::debug!(persona = %persona, path = %fa.path, reason = %reason, "proposal declined");
                declined += 1;
            }
            Err(e) => return Err(e),
        }
        improvement_types.insert(rewrite.improvement_type.clone());
        if let Some(ext) = analysis::extension_of(&fa.path) {
            file_types.insert(ext.to_string());
        }
    }

    let commit_context = if persona == Persona::Sandbox {
        match source.recent_commits(5).await {
            Ok(c) => c.into_iter().map(|c| c.message).collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read recent commits for experiments");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let report = AgentRunReport {
        persona,
        source: source.describe(),
        files_scanned,
        files_skipped,
        findings,
        proposals_created: created,
        duplicates,
        declined,
    };
    let detail = serde_json::json!({
        "files_scanned": report.files_scanned,
        "findings": report.findings,
        "created": report.proposals_created.len(),
        "duplicates": report.duplicates,
        "declined": report.declined,
        "improvement_types": improvement_types,
        "file_types": file_types,
        "commit_context": commit_context,
    });
    let s = store.clone();
    run_blocking(move || {
        learning::record_event(&s, persona, learning::KIND_PROPOSAL_RUN, "analysis", &detail)
    })
    .await?;

    tracing::info!(
        persona = %persona,
        files = report.files_scanned,
        findings = report.findings,
        created = report.proposals_created.len(),
        duplicates = report.duplicates,
        declined = report.declined,
        "persona analysis pass finished"
    );
    Ok(AgentRunOutcome::Completed(report))
}

/// Run every persona. Per-persona errors are logged and skipped.
pub async fn run_all(
    store: &Store,
    config: &Config,
    source: &dyn RepoSource,
) -> Vec<AgentRunOutcome> {
    let mut outcomes = Vec::new();
    for persona in Persona::ALL {
        match run_persona(store, config, persona, source).await {
            Ok(o) => outcomes.push(o),
            Err(e) => tracing::error!(persona = %persona, error = %e, "persona analysis pass failed"),
        }
    }
    outcomes
}
