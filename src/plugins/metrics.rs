//! Per-persona custody metrics.
//!
//! One `agent_metrics` row per persona, created on first access and never
//! deleted. Every administered test goes through [`record_test`], which
//! inserts the history row and updates the metrics row in a single
//! transaction.

use crate::core::broker::DbBroker;
use crate::core::config::GateConfig;
use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::eligibility;
use crate::plugins::generators::{TestCategory, TestDifficulty};
use crate::plugins::persona::Persona;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ACTOR: &str = "custodes";

pub fn initialize_metrics_db(root: &Path) -> Result<(), error::CustodesError> {
    std::fs::create_dir_all(root)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&db::custodes_db_path(root), ACTOR, None, "metrics.init", |conn| {
        conn.execute(schemas::METRICS_DB_SCHEMA_AGENT_METRICS, [])?;
        conn.execute(schemas::METRICS_DB_SCHEMA_CUSTODY_TESTS, [])?;
        conn.execute(schemas::METRICS_DB_SCHEMA_CUSTODY_TESTS_INDEX, [])?;
        conn.execute(schemas::METRICS_DB_SCHEMA_XP_AWARDS, [])?;
        Ok(())
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub persona: Persona,
    pub level: i64,
    pub xp: i64,
    pub total_tests_given: i64,
    pub total_tests_passed: i64,
    pub total_tests_failed: i64,
    pub consecutive_successes: i64,
    pub consecutive_failures: i64,
    pub last_test_date: Option<i64>,
    /// Most recent first, bounded by the configured history limit.
    pub recent_results: Vec<bool>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AgentMetrics {
    pub fn new(persona: Persona, now: i64) -> Self {
        Self {
            persona,
            level: 1,
            xp: 0,
            total_tests_given: 0,
            total_tests_passed: 0,
            total_tests_failed: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_test_date: None,
            recent_results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total_tests_given == 0 {
            0.0
        } else {
            self.total_tests_passed as f64 / self.total_tests_given as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_tests_given == 0 {
            0.0
        } else {
            self.total_tests_failed as f64 / self.total_tests_given as f64
        }
    }

    /// Apply one test result to the counters. Does not touch XP or level.
    pub fn apply_result(&mut self, passed: bool, now: i64, history_limit: usize) {
        self.total_tests_given += 1;
        if passed {
            self.total_tests_passed += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.total_tests_failed += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }
        self.recent_results.insert(0, passed);
        self.recent_results.truncate(history_limit);
        self.last_test_date = Some(now);
        self.updated_at = now;
    }

    /// Raise the level to what the XP supports, but only while the level-up
    /// gate holds. Levels never drop.
    pub fn settle_level(&mut self, gate: &GateConfig, now: i64) -> bool {
        let target = level_for_xp(self.xp);
        if target <= self.level {
            return false;
        }
        if !eligibility::level_up(self, gate, now).eligible {
            return false;
        }
        self.level = target;
        true
    }
}

/// Custody XP thresholds: 100, 300, 600, 1000, 1500, 2100, 2800, 3600, 4500.
pub fn level_for_xp(xp: i64) -> i64 {
    const THRESHOLDS: [i64; 9] = [100, 300, 600, 1000, 1500, 2100, 2800, 3600, 4500];
    THRESHOLDS
        .iter()
        .position(|t| xp < *t)
        .map(|i| i as i64 + 1)
        .unwrap_or(10)
}

/// The scored result of one administered custody test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub category: TestCategory,
    pub difficulty: TestDifficulty,
    pub score: f64,
    pub passed: bool,
    pub generator: String,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedTest {
    pub test_id: String,
    pub xp_awarded: i64,
    pub previous_level: i64,
    pub leveled_up: bool,
    pub metrics: AgentMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyTestRow {
    pub test_id: String,
    pub persona: String,
    pub category: String,
    pub difficulty: String,
    pub score: f64,
    pub passed: bool,
    pub xp_awarded: i64,
    pub generator: String,
    pub feedback: Option<String>,
    pub created_at: i64,
}

fn load_metrics(
    conn: &Connection,
    persona: Persona,
) -> Result<Option<AgentMetrics>, error::CustodesError> {
    let row = conn
        .query_row(
            "SELECT level, xp, total_tests_given, total_tests_passed, total_tests_failed,
                    consecutive_successes, consecutive_failures, last_test_date,
                    created_at, updated_at
             FROM agent_metrics WHERE persona = ?1",
            params![persona.as_str()],
            |row| {
                Ok(AgentMetrics {
                    persona,
                    level: row.get(0)?,
                    xp: row.get(1)?,
                    total_tests_given: row.get(2)?,
                    total_tests_passed: row.get(3)?,
                    total_tests_failed: row.get(4)?,
                    consecutive_successes: row.get(5)?,
                    consecutive_failures: row.get(6)?,
                    last_test_date: row.get(7)?,
                    recent_results: Vec::new(),
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            },
        )
        .optional()?;

    let Some(mut metrics) = row else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT passed FROM custody_tests WHERE persona = ?1 ORDER BY seq DESC")?;
    let results = stmt
        .query_map(params![persona.as_str()], |row| row.get::<_, bool>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    metrics.recent_results = results;
    Ok(Some(metrics))
}

fn ensure_row(
    conn: &Connection,
    persona: Persona,
    now: i64,
) -> Result<AgentMetrics, error::CustodesError> {
    if let Some(m) = load_metrics(conn, persona)? {
        return Ok(m);
    }
    conn.execute(
        "INSERT INTO agent_metrics(persona, level, xp, created_at, updated_at)
         VALUES(?1, 1, 0, ?2, ?2)",
        params![persona.as_str(), now],
    )?;
    Ok(AgentMetrics::new(persona, now))
}

fn write_metrics(conn: &Connection, m: &AgentMetrics) -> Result<(), error::CustodesError> {
    let changed = conn.execute(
        "UPDATE agent_metrics SET level = ?2, xp = ?3, total_tests_given = ?4,
            total_tests_passed = ?5, total_tests_failed = ?6, consecutive_successes = ?7,
            consecutive_failures = ?8, last_test_date = ?9, updated_at = ?10
         WHERE persona = ?1",
        params![
            m.persona.as_str(),
            m.level,
            m.xp,
            m.total_tests_given,
            m.total_tests_passed,
            m.total_tests_failed,
            m.consecutive_successes,
            m.consecutive_failures,
            m.last_test_date,
            m.updated_at
        ],
    )?;
    if changed != 1 {
        return Err(error::CustodesError::ValidationError(format!(
            "expected to update exactly one metrics row for {}, updated {}",
            m.persona, changed
        )));
    }
    Ok(())
}

pub fn get_or_create(store: &Store, persona: Persona) -> Result<AgentMetrics, error::CustodesError> {
    get_or_create_at(store, persona, time::now_secs())
}

pub fn get_or_create_at(
    store: &Store,
    persona: Persona,
    now: i64,
) -> Result<AgentMetrics, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(persona.as_str()),
        "metrics.get",
        |conn| ensure_row(conn, persona, now),
    )
}

pub fn list_all(store: &Store) -> Result<Vec<AgentMetrics>, error::CustodesError> {
    let now = time::now_secs();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        ACTOR,
        None,
        "metrics.list",
        |conn| {
            Persona::ALL
                .iter()
                .map(|p| ensure_row(conn, *p, now))
                .collect()
        },
    )
}

/// Record one administered test: insert the history row, update counters,
/// award XP on pass, settle the level, prune history. One transaction; on
/// any failure nothing is written.
pub fn record_test(
    store: &Store,
    persona: Persona,
    outcome: &TestOutcome,
    gate: &GateConfig,
    history_limit: usize,
    now: i64,
) -> Result<RecordedTest, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    let test_id = time::new_event_id();

    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(&test_id),
        "metrics.record_test",
        |tx| {
            let mut metrics = ensure_row(tx, persona, now)?;
            let previous_level = metrics.level;
            let xp_awarded = if outcome.passed {
                outcome.difficulty.xp_reward()
            } else {
                0
            };

            tx.execute(
                "INSERT INTO custody_tests(test_id, persona, category, difficulty, score, passed,
                                           xp_awarded, generator, feedback, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    test_id,
                    persona.as_str(),
                    outcome.category.as_str(),
                    outcome.difficulty.as_str(),
                    outcome.score,
                    outcome.passed,
                    xp_awarded,
                    outcome.generator,
                    outcome.feedback,
                    now
                ],
            )?;
            tx.execute(
                "DELETE FROM custody_tests WHERE persona = ?1 AND seq NOT IN (
                    SELECT seq FROM custody_tests WHERE persona = ?1 ORDER BY seq DESC LIMIT ?2
                 )",
                params![persona.as_str(), history_limit as i64],
            )?;

            metrics.apply_result(outcome.passed, now, history_limit);
            metrics.xp += xp_awarded;
            let leveled_up = metrics.settle_level(gate, now);
            write_metrics(tx, &metrics)?;

            Ok(RecordedTest {
                test_id: test_id.clone(),
                xp_awarded,
                previous_level,
                leveled_up,
                metrics,
            })
        },
    )
}

/// Grant bonus XP outside a test (e.g. an Olympic win).
pub fn award_xp(
    store: &Store,
    persona: Persona,
    amount: i64,
    reason: &str,
    gate: &GateConfig,
    now: i64,
) -> Result<AgentMetrics, error::CustodesError> {
    if amount <= 0 {
        return Err(error::CustodesError::ValidationError(format!(
            "XP award must be positive, got {}",
            amount
        )));
    }
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(reason),
        "metrics.award_xp",
        |tx| {
            let mut metrics = ensure_row(tx, persona, now)?;
            tx.execute(
                "INSERT INTO xp_awards(award_id, persona, amount, reason, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![time::new_event_id(), persona.as_str(), amount, reason, now],
            )?;
            metrics.xp += amount;
            metrics.updated_at = now;
            metrics.settle_level(gate, now);
            write_metrics(tx, &metrics)?;
            Ok(metrics)
        },
    )
}

/// Zero the counters and drop the test history; the row itself stays.
pub fn reset(store: &Store, persona: Persona) -> Result<AgentMetrics, error::CustodesError> {
    let now = time::now_secs();
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(persona.as_str()),
        "metrics.reset",
        |tx| {
            let existing = ensure_row(tx, persona, now)?;
            tx.execute(
                "DELETE FROM custody_tests WHERE persona = ?1",
                params![persona.as_str()],
            )?;
            let mut fresh = AgentMetrics::new(persona, existing.created_at);
            fresh.updated_at = now;
            write_metrics(tx, &fresh)?;
            Ok(fresh)
        },
    )
}

pub fn test_history(
    store: &Store,
    persona: Persona,
    limit: usize,
) -> Result<Vec<CustodyTestRow>, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        ACTOR,
        Some(persona.as_str()),
        "metrics.history",
        |conn| {
            let mut stmt = conn.prepare(
                "SELECT test_id, persona, category, difficulty, score, passed, xp_awarded,
                        generator, feedback, created_at
                 FROM custody_tests WHERE persona = ?1 ORDER BY seq DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![persona.as_str(), limit as i64], |row| {
                    Ok(CustodyTestRow {
                        test_id: row.get(0)?,
                        persona: row.get(1)?,
                        category: row.get(2)?,
                        difficulty: row.get(3)?,
                        score: row.get(4)?,
                        passed: row.get(5)?,
                        xp_awarded: row.get(6)?,
                        generator: row.get(7)?,
                        feedback: row.get(8)?,
                        created_at: row.get(9)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        },
    )
}
