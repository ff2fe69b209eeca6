//! Apply tested proposals to the workspace.
//!
//! Only proposals with status `test-passed` and test status `passed` are
//! considered. A proposal is written only when the file on disk still equals
//! its `code_before`; otherwise it is demoted to `test-failed`. The previous
//! file content is kept as `<file>.backup.<epoch>`.

use crate::core::error::CustodesError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::proposals::{self, Proposal, ProposalFilter, ProposalStatus, TestStatus};
use crate::plugins::repo::safe_relative_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyAction {
    Applied,
    WouldApply,
    Stale,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub proposal_id: String,
    pub file_path: String,
    pub action: ApplyAction,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub considered: usize,
    pub outcomes: Vec<ApplyOutcome>,
}

impl ApplyReport {
    pub fn count(&self, action: ApplyAction) -> usize {
        self.outcomes.iter().filter(|o| o.action == action).count()
    }
}

enum Prepared {
    Ready { target: PathBuf, existing: bool },
    Stale(String),
}

fn prepare(workspace: &Path, p: &Proposal) -> Result<Prepared, CustodesError> {
    let rel = match safe_relative_path(&p.file_path) {
        Ok(r) => r,
        Err(e) => return Ok(Prepared::Stale(e.to_string())),
    };
    let target = workspace.join(rel);
    let (current, existing) = match fs::read_to_string(&target) {
        Ok(c) => (c, true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (String::new(), false),
        Err(e) => return Err(e.into()),
    };
    if current != p.code_before {
        return Ok(Prepared::Stale(if existing {
            "target file changed since the proposal was tested".to_string()
        } else {
            "target file no longer exists".to_string()
        }));
    }
    let checks = proposals::check_change(&p.code_before, &p.code_after);
    if let Some(failed) = checks.iter().find(|c| !c.passed) {
        return Ok(Prepared::Stale(format!(
            "final check {} failed: {}",
            failed.name, failed.detail
        )));
    }
    Ok(Prepared::Ready { target, existing })
}

fn write_with_backup(target: &Path, existing: bool, content: &str) -> Result<Option<PathBuf>, CustodesError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let backup = if existing {
        let name = format!("{}.backup.{}", target.display(), time::now_secs());
        let backup = PathBuf::from(name);
        fs::copy(target, &backup)?;
        Some(backup)
    } else {
        None
    };
    let tmp = PathBuf::from(format!("{}.custodes.tmp", target.display()));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, target)?;
    Ok(backup)
}

fn apply_one(
    store: &Store,
    workspace: &Path,
    p: &Proposal,
    dry_run: bool,
) -> Result<ApplyOutcome, CustodesError> {
    let outcome = |action, detail: String| ApplyOutcome {
        proposal_id: p.id.clone(),
        file_path: p.file_path.clone(),
        action,
        detail,
    };

    match prepare(workspace, p)? {
        Prepared::Stale(reason) => {
            if !dry_run {
                proposals::mark_stale(store, &p.id, &reason)?;
            }
            tracing::warn!(proposal_id = %p.id, path = %p.file_path, reason = %reason, "proposal is stale; not applied");
            Ok(outcome(ApplyAction::Stale, reason))
        }
        Prepared::Ready { .. } if dry_run => Ok(outcome(
            ApplyAction::WouldApply,
            "dry run; file left untouched".to_string(),
        )),
        Prepared::Ready { target, existing } => {
            let backup = write_with_backup(&target, existing, &p.code_after)?;
            let note = match &backup {
                Some(b) => format!("applied at {}; backup {}", time::now_epoch_z(), b.display()),
                None => format!("applied at {}; new file", time::now_epoch_z()),
            };
            proposals::mark_applied(store, &p.id, &note)?;
            tracing::info!(proposal_id = %p.id, path = %p.file_path, persona = %p.persona, "proposal applied");
            Ok(outcome(ApplyAction::Applied, note))
        }
    }
}

/// One auto-apply pass. Per-proposal failures are logged and reported.
pub fn apply_ready(store: &Store, workspace: &Path, dry_run: bool) -> Result<ApplyReport, CustodesError> {
    let ready: Vec<Proposal> = proposals::list(
        store,
        &ProposalFilter {
            status: Some(ProposalStatus::TestPassed),
            ..ProposalFilter::default()
        },
    )?
    .into_iter()
    .filter(|p| p.test_status == TestStatus::Passed)
    .collect();

    let mut report = ApplyReport {
        considered: ready.len(),
        outcomes: Vec::new(),
    };
    for p in &ready {
        match apply_one(store, workspace, p, dry_run) {
            Ok(o) => report.outcomes.push(o),
            Err(e) => {
                tracing::error!(proposal_id = %p.id, error = %e, "failed to apply proposal");
                report.outcomes.push(ApplyOutcome {
                    proposal_id: p.id.clone(),
                    file_path: p.file_path.clone(),
                    action: ApplyAction::Failed,
                    detail: e.to_string(),
                });
            }
        }
    }
    if report.considered > 0 {
        tracing::info!(
            considered = report.considered,
            applied = report.count(ApplyAction::Applied),
            stale = report.count(ApplyAction::Stale),
            dry_run,
            "auto-apply pass finished"
        );
    }
    Ok(report)
}
