//! Code-change proposals and their review lifecycle.
//!
//! A proposal is identified by the SHA-256 of its `(file_path, code_before,
//! code_after)` content. The unique index on that hash makes creation
//! idempotent: submitting the same change twice returns the first id.

use crate::core::broker::DbBroker;
use crate::core::config::AnalysisConfig;
use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::analysis;
use crate::plugins::persona::Persona;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const ACTOR: &str = "custodes";
const DAY_SECS: i64 = 24 * 60 * 60;

pub fn initialize_proposals_db(root: &Path) -> Result<(), error::CustodesError> {
    std::fs::create_dir_all(root)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&db::custodes_db_path(root), ACTOR, None, "proposals.init", |conn| {
        conn.execute(schemas::PROPOSALS_DB_SCHEMA, [])?;
        conn.execute(schemas::PROPOSALS_DB_SCHEMA_HASH_INDEX, [])?;
        conn.execute(schemas::PROPOSALS_DB_SCHEMA_STATUS_INDEX, [])?;
        Ok(())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    TestPassed,
    TestFailed,
    Applied,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::TestPassed => "test-passed",
            ProposalStatus::TestFailed => "test-failed",
            ProposalStatus::Applied => "applied",
        }
    }

    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, TestPassed)
                | (Approved, TestFailed)
                | (TestPassed, Applied)
                | (TestPassed, TestFailed)
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = error::CustodesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            "test-passed" => Ok(ProposalStatus::TestPassed),
            "test-failed" => Ok(ProposalStatus::TestFailed),
            "applied" => Ok(ProposalStatus::Applied),
            other => Err(error::CustodesError::ValidationError(format!(
                "unknown proposal status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    NotRun,
    Passed,
    Failed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::NotRun => "not-run",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
        }
    }
}

impl FromStr for TestStatus {
    type Err = error::CustodesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-run" => Ok(TestStatus::NotRun),
            "passed" => Ok(TestStatus::Passed),
            "failed" => Ok(TestStatus::Failed),
            other => Err(error::CustodesError::ValidationError(format!(
                "unknown test status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub persona: Persona,
    pub file_path: String,
    pub code_before: String,
    pub code_after: String,
    pub description: String,
    pub improvement_type: String,
    pub confidence: f64,
    pub code_hash: String,
    pub status: ProposalStatus,
    pub test_status: TestStatus,
    pub test_output: Option<String>,
    pub user_feedback: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub persona: Persona,
    pub file_path: String,
    pub code_before: String,
    pub code_after: String,
    pub description: String,
    pub improvement_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub persona: Option<Persona>,
    pub status: Option<ProposalStatus>,
    pub limit: Option<usize>,
}

pub fn content_hash(file_path: &str, code_before: &str, code_after: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(code_before.as_bytes());
    hasher.update([0u8]);
    hasher.update(code_after.as_bytes());
    format!("{:x}", hasher.finalize())
}

const SELECT_COLUMNS: &str = "id, persona, file_path, code_before, code_after, description,
    improvement_type, confidence, code_hash, status, test_status, test_output, user_feedback,
    created_at, updated_at";

fn parse_col<T: FromStr<Err = error::CustodesError>>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    Ok(Proposal {
        id: row.get(0)?,
        persona: parse_col(1, row.get(1)?)?,
        file_path: row.get(2)?,
        code_before: row.get(3)?,
        code_after: row.get(4)?,
        description: row.get(5)?,
        improvement_type: row.get(6)?,
        confidence: row.get(7)?,
        code_hash: row.get(8)?,
        status: parse_col(9, row.get(9)?)?,
        test_status: parse_col(10, row.get(10)?)?,
        test_output: row.get(11)?,
        user_feedback: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<Proposal, error::CustodesError> {
    conn.query_row(
        &format!("SELECT {} FROM proposals WHERE id = ?1", SELECT_COLUMNS),
        params![id],
        row_to_proposal,
    )
    .optional()?
    .ok_or_else(|| error::CustodesError::NotFound(format!("proposal '{}'", id)))
}

fn validate_new(p: &NewProposal) -> Result<(), error::CustodesError> {
    if p.file_path.trim().is_empty() {
        return Err(error::CustodesError::ValidationError(
            "proposal file_path must not be empty".to_string(),
        ));
    }
    if p.code_before == p.code_after {
        return Err(error::CustodesError::ValidationError(format!(
            "proposal for {} does not change the code",
            p.file_path
        )));
    }
    if p.description.trim().is_empty() {
        return Err(error::CustodesError::ValidationError(
            "proposal description must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Strip blank lines, `//` and `#` comment lines and surrounding whitespace.
fn substantive_lines(code: &str) -> String {
    code.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("//") && !l.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// True when the change only touches whitespace, blank lines or comments.
pub fn is_cosmetic_change(code_before: &str, code_after: &str) -> bool {
    let before = substantive_lines(code_before);
    let after = substantive_lines(code_after);
    before == after || before.replace(' ', "") == after.replace(' ', "")
}

/// Per-persona admission rules applied inside the create transaction.
fn validate_new_for_persona(
    conn: &Connection,
    p: &NewProposal,
    limits: &AnalysisConfig,
    now: i64,
) -> Result<(), error::CustodesError> {
    if p.confidence < limits.min_confidence {
        return Err(error::CustodesError::ValidationError(format!(
            "confidence {:.2} below minimum {:.2}",
            p.confidence, limits.min_confidence
        )));
    }
    if is_cosmetic_change(&p.code_before, &p.code_after) {
        return Err(error::CustodesError::ValidationError(format!(
            "change to {} only touches whitespace or comments",
            p.file_path
        )));
    }
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM proposals WHERE persona = ?1 AND status = 'pending'",
        params![p.persona.as_str()],
        |row| row.get(0),
    )?;
    if pending >= limits.max_pending_per_persona as i64 {
        return Err(error::CustodesError::ValidationError(format!(
            "{} already has {} pending proposals (max {})",
            p.persona, pending, limits.max_pending_per_persona
        )));
    }
    let today: i64 = conn.query_row(
        "SELECT COUNT(*) FROM proposals WHERE persona = ?1 AND created_at > ?2",
        params![p.persona.as_str(), now - DAY_SECS],
        |row| row.get(0),
    )?;
    if today >= limits.max_daily_per_persona as i64 {
        return Err(error::CustodesError::ValidationError(format!(
            "{} reached the daily limit of {} proposals",
            p.persona, limits.max_daily_per_persona
        )));
    }
    Ok(())
}

/// Create a proposal, or return the existing one with identical content.
/// Returns `(id, created)`. New content must pass the persona's admission
/// limits; a declined proposal is a `ValidationError`.
pub fn create_proposal(
    store: &Store,
    new: &NewProposal,
    limits: &AnalysisConfig,
) -> Result<(String, bool), error::CustodesError> {
    validate_new(new)?;
    let hash = content_hash(&new.file_path, &new.code_before, &new.code_after);
    let now = time::now_secs();
    let broker = DbBroker::new(&store.root);

    broker.with_tx(
        &db::custodes_db_path(&store.root),
        new.persona.as_str(),
        Some(&hash),
        "proposals.create",
        |tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM proposals WHERE code_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok((id, false));
            }
            validate_new_for_persona(tx, new, limits, now)?;

            let id = time::new_event_id();
            tx.execute(
                "INSERT INTO proposals(id, persona, file_path, code_before, code_after,
                    description, improvement_type, confidence, code_hash, status, test_status,
                    created_at, updated_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 'not-run', ?10, ?10)",
                params![
                    id,
                    new.persona.as_str(),
                    new.file_path,
                    new.code_before,
                    new.code_after,
                    new.description,
                    new.improvement_type,
                    new.confidence.clamp(0.0, 1.0),
                    hash,
                    now
                ],
            )?;
            Ok((id, true))
        },
    )
}

pub fn get(store: &Store, id: &str) -> Result<Proposal, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(id),
        "proposals.get",
        |conn| load(conn, id),
    )
}

pub fn list(store: &Store, filter: &ProposalFilter) -> Result<Vec<Proposal>, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        ACTOR,
        None,
        "proposals.list",
        |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM proposals
                 WHERE (?1 IS NULL OR persona = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3",
                SELECT_COLUMNS
            ))?;
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
            let rows = stmt
                .query_map(
                    params![
                        filter.persona.map(|p| p.as_str()),
                        filter.status.map(|s| s.as_str()),
                        limit
                    ],
                    row_to_proposal,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        },
    )
}

/// Proposal counts per status for one persona.
pub fn count_by_status(
    store: &Store,
    persona: Persona,
) -> Result<FxHashMap<String, i64>, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(persona.as_str()),
        "proposals.count",
        |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM proposals WHERE persona = ?1 GROUP BY status",
            )?;
            let mut counts = FxHashMap::default();
            let rows = stmt.query_map(params![persona.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for r in rows {
                let (status, n) = r?;
                counts.insert(status, n);
            }
            Ok(counts)
        },
    )
}

fn transition(
    conn: &Connection,
    id: &str,
    next: ProposalStatus,
    test_status: Option<TestStatus>,
    test_output: Option<&str>,
    user_feedback: Option<&str>,
) -> Result<Proposal, error::CustodesError> {
    let current = load(conn, id)?;
    if !current.status.can_transition_to(next) {
        return Err(error::CustodesError::ValidationError(format!(
            "proposal {} cannot move from {} to {}",
            id, current.status, next
        )));
    }
    conn.execute(
        "UPDATE proposals SET status = ?2,
            test_status = COALESCE(?3, test_status),
            test_output = COALESCE(?4, test_output),
            user_feedback = COALESCE(?5, user_feedback),
            updated_at = ?6
         WHERE id = ?1 AND status = ?7",
        params![
            id,
            next.as_str(),
            test_status.map(|t| t.as_str()),
            test_output,
            user_feedback,
            time::now_secs(),
            current.status.as_str()
        ],
    )?;
    load(conn, id)
}

pub fn approve(store: &Store, id: &str) -> Result<Proposal, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(id),
        "proposals.approve",
        |tx| transition(tx, id, ProposalStatus::Approved, None, None, None),
    )
}

pub fn reject(store: &Store, id: &str, reason: Option<&str>) -> Result<Proposal, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(id),
        "proposals.reject",
        |tx| transition(tx, id, ProposalStatus::Rejected, None, None, reason),
    )
}

/// Mark a test-passed proposal as applied.
pub fn mark_applied(store: &Store, id: &str, note: &str) -> Result<Proposal, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(id),
        "proposals.applied",
        |tx| transition(tx, id, ProposalStatus::Applied, None, Some(note), None),
    )
}

/// Demote a test-passed proposal whose target no longer matches.
pub fn mark_stale(store: &Store, id: &str, reason: &str) -> Result<Proposal, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(id),
        "proposals.stale",
        |tx| {
            transition(
                tx,
                id,
                ProposalStatus::TestFailed,
                Some(TestStatus::Failed),
                Some(reason),
                None,
            )
        },
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalTestReport {
    pub proposal_id: String,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

impl ProposalTestReport {
    pub fn render(&self) -> String {
        self.checks
            .iter()
            .map(|c| {
                format!(
                    "{} {}: {}",
                    if c.passed { "PASS" } else { "FAIL" },
                    c.name,
                    c.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Net open-minus-close counts for `()`, `{}`, `[]`.
pub fn bracket_balance(code: &str) -> [i64; 3] {
    let mut b = [0i64; 3];
    for ch in code.chars() {
        match ch {
            '(' => b[0] += 1,
            ')' => b[0] -= 1,
            '{' => b[1] += 1,
            '}' => b[1] -= 1,
            '[' => b[2] += 1,
            ']' => b[2] -= 1,
            _ => {}
        }
    }
    b
}

/// Security rules that match more often after the change than before.
pub fn introduced_security_findings(code_before: &str, code_after: &str) -> Vec<String> {
    let before: FxHashMap<String, usize> = analysis::security_findings(code_before)
        .into_iter()
        .map(|f| (f.rule_id, f.matches))
        .collect();
    analysis::security_findings(code_after)
        .into_iter()
        .filter(|f| f.matches > before.get(&f.rule_id).copied().unwrap_or(0))
        .map(|f| f.rule_id)
        .collect()
}

/// Static checks run against an approved proposal before it may be applied.
pub fn check_change(code_before: &str, code_after: &str) -> Vec<CheckResult> {
    let mut checks = Vec::new();

    checks.push(CheckResult {
        name: "non_empty".to_string(),
        passed: !code_after.trim().is_empty(),
        detail: format!("{} bytes after change", code_after.len()),
    });

    checks.push(CheckResult {
        name: "changed".to_string(),
        passed: code_before != code_after,
        detail: "code_after differs from code_before".to_string(),
    });

    let before_b = bracket_balance(code_before);
    let after_b = bracket_balance(code_after);
    checks.push(CheckResult {
        name: "brackets".to_string(),
        passed: before_b == after_b,
        detail: format!("balance before {:?}, after {:?}", before_b, after_b),
    });

    checks.push(CheckResult {
        name: "substantive".to_string(),
        passed: !is_cosmetic_change(code_before, code_after),
        detail: "change touches more than whitespace or comments".to_string(),
    });

    let introduced = introduced_security_findings(code_before, code_after);
    checks.push(CheckResult {
        name: "security".to_string(),
        passed: introduced.is_empty(),
        detail: if introduced.is_empty() {
            "no new security findings".to_string()
        } else {
            format!("new security findings: {}", introduced.join(", "))
        },
    });

    checks
}

/// Run the static checks on an approved proposal and record the verdict.
pub fn test_proposal(store: &Store, id: &str) -> Result<ProposalTestReport, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(id),
        "proposals.test",
        |tx| {
            let proposal = load(tx, id)?;
            if proposal.status != ProposalStatus::Approved {
                return Err(error::CustodesError::ValidationError(format!(
                    "proposal {} must be approved before testing (status {})",
                    id, proposal.status
                )));
            }
            let checks = check_change(&proposal.code_before, &proposal.code_after);
            let report = ProposalTestReport {
                proposal_id: id.to_string(),
                passed: checks.iter().all(|c| c.passed),
                checks,
            };
            let (next, test_status) = if report.passed {
                (ProposalStatus::TestPassed, TestStatus::Passed)
            } else {
                (ProposalStatus::TestFailed, TestStatus::Failed)
            };
            transition(tx, id, next, Some(test_status), Some(&report.render()), None)?;
            Ok(report)
        },
    )
}
