//! Learning events and the per-persona learning profile.
//!
//! A persona's profile is its baseline vocabulary plus everything it picked
//! up from recorded events: study terms after failed test categories, and the
//! improvement types and file types of the proposals it filed. The rubric
//! test generator answers from this profile, so learning changes scores.

use crate::core::broker::DbBroker;
use crate::core::config::GateConfig;
use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::eligibility;
use crate::plugins::generators::TestCategory;
use crate::plugins::metrics;
use crate::plugins::persona::Persona;
use crate::plugins::proposals;
use rusqlite::params;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub const KIND_REMEDIATION: &str = "remediation";
pub const KIND_PROPOSAL_RUN: &str = "proposal_run";
pub const KIND_INSIGHT: &str = "insight";

/// Newest events kept per persona for each prunable kind. Remediation
/// events are never pruned: they are what the persona has learned.
pub const EVENT_HISTORY: i64 = 200;
/// Proposal runs folded into a profile.
const PROFILE_PROPOSAL_RUNS: i64 = 50;

pub fn initialize_learning_db(root: &Path) -> Result<(), error::CustodesError> {
    std::fs::create_dir_all(root)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&db::custodes_db_path(root), "custodes", None, "learning.init", |conn| {
        conn.execute(schemas::LEARNING_DB_SCHEMA_EVENTS, [])?;
        conn.execute(schemas::LEARNING_DB_SCHEMA_EVENTS_INDEX, [])?;
        Ok(())
    })
}

fn base_vocabulary(persona: Persona) -> &'static [&'static str] {
    match persona {
        Persona::Imperium => &[
            "performance",
            "complexity",
            "optimization",
            "readability",
            "maintainability",
        ],
        Persona::Guardian => &[
            "security",
            "injection",
            "authentication",
            "authorization",
            "xss",
        ],
        Persona::Sandbox => &["apply", "implement", "practice", "experiment"],
        Persona::Conquest => &["efficiency", "bottleneck", "use", "real-world"],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningProfile {
    pub persona: Persona,
    pub known_terms: BTreeSet<String>,
    /// Most recent first.
    pub subjects: Vec<String>,
    pub improvement_types: Vec<String>,
    pub file_types: Vec<String>,
}

impl LearningProfile {
    pub fn baseline(persona: Persona) -> Self {
        Self {
            persona,
            known_terms: base_vocabulary(persona)
                .iter()
                .map(|t| t.to_string())
                .collect(),
            subjects: Vec::new(),
            improvement_types: Vec::new(),
            file_types: Vec::new(),
        }
    }

    pub fn knows(&self, term: &str) -> bool {
        self.known_terms.contains(&term.to_lowercase())
    }

    pub fn learn<I, S>(&mut self, terms: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for t in terms {
            self.known_terms.insert(t.as_ref().to_lowercase());
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

pub fn record_event(
    store: &Store,
    persona: Persona,
    kind: &str,
    subject: &str,
    detail: &serde_json::Value,
) -> Result<String, error::CustodesError> {
    let event_id = time::new_event_id();
    let detail_json = serde_json::to_string(detail)?;
    let broker = DbBroker::new(&store.root);
    broker.with_tx(
        &db::custodes_db_path(&store.root),
        persona.as_str(),
        Some(kind),
        "learning.record",
        |tx| {
            tx.execute(
                "INSERT INTO learning_events(event_id, persona, kind, subject, detail, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event_id,
                    persona.as_str(),
                    kind,
                    subject,
                    detail_json,
                    time::now_secs()
                ],
            )?;
            if kind != KIND_REMEDIATION {
                tx.execute(
                    "DELETE FROM learning_events WHERE persona = ?1 AND kind = ?2 AND rowid NOT IN (
                        SELECT rowid FROM learning_events WHERE persona = ?1 AND kind = ?2
                        ORDER BY created_at DESC, rowid DESC LIMIT ?3
                     )",
                    params![persona.as_str(), kind, EVENT_HISTORY],
                )?;
            }
            Ok(())
        },
    )?;
    Ok(event_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub event_id: String,
    pub persona: String,
    pub kind: String,
    pub subject: String,
    pub detail: serde_json::Value,
    pub created_at: i64,
}

pub fn recent_events(
    store: &Store,
    persona: Persona,
    limit: i64,
) -> Result<Vec<LearningEvent>, error::CustodesError> {
    events_of_kind(store, persona, None, limit)
}

/// Events for one persona, newest first, optionally of a single kind.
/// A negative `limit` returns every row.
pub fn events_of_kind(
    store: &Store,
    persona: Persona,
    kind: Option<&str>,
    limit: i64,
) -> Result<Vec<LearningEvent>, error::CustodesError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::custodes_db_path(&store.root),
        "custodes",
        Some(persona.as_str()),
        "learning.recent",
        |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, persona, kind, subject, detail, created_at
                 FROM learning_events WHERE persona = ?1 AND (?2 IS NULL OR kind = ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            )?;
            let raw = stmt
                .query_map(params![persona.as_str(), kind, limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter()
                .map(|(event_id, persona, kind, subject, detail, created_at)| {
                    Ok(LearningEvent {
                        event_id,
                        persona,
                        kind,
                        subject,
                        detail: serde_json::from_str(&detail)?,
                        created_at,
                    })
                })
                .collect()
        },
    )
}

fn string_list(v: &serde_json::Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|x| x.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Built from every remediation event plus the latest proposal runs, so
/// insight rows never push learned terms out of the profile.
pub fn profile(store: &Store, persona: Persona) -> Result<LearningProfile, error::CustodesError> {
    let mut events =
        events_of_kind(store, persona, Some(KIND_PROPOSAL_RUN), PROFILE_PROPOSAL_RUNS)?;
    events.extend(events_of_kind(store, persona, Some(KIND_REMEDIATION), -1)?);
    Ok(profile_from_events(persona, &events))
}

/// Fold events (most recent first) into a profile.
pub fn profile_from_events(persona: Persona, events: &[LearningEvent]) -> LearningProfile {
    let mut p = LearningProfile::baseline(persona);
    for ev in events {
        match ev.kind.as_str() {
            KIND_REMEDIATION => p.learn(string_list(&ev.detail, "terms")),
            KIND_PROPOSAL_RUN => {
                for t in string_list(&ev.detail, "improvement_types") {
                    push_unique(&mut p.improvement_types, &t);
                    push_unique(&mut p.subjects, &t);
                    p.learn([t]);
                }
                for f in string_list(&ev.detail, "file_types") {
                    push_unique(&mut p.file_types, &f);
                }
            }
            _ => {}
        }
    }
    p
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningInsight {
    pub persona: Persona,
    pub level: i64,
    pub pass_rate: f64,
    pub recent_pass_rate: Option<f64>,
    pub remediated_categories: Vec<String>,
    pub proposals_by_status: FxHashMap<String, i64>,
}

/// Examine recent results for one persona, record remediation for failed
/// categories it has not yet studied, and append an insight event.
pub fn learn_persona(
    store: &Store,
    persona: Persona,
    gate: &GateConfig,
) -> Result<LearningInsight, error::CustodesError> {
    let m = metrics::get_or_create(store, persona)?;
    let history = metrics::test_history(store, persona, gate.level_up_window.max(1) * 2)?;
    let mut profile = profile(store, persona)?;

    let mut remediated = Vec::new();
    for row in history.iter().filter(|r| !r.passed) {
        let Ok(category) = row.category.parse::<TestCategory>() else {
            continue;
        };
        let terms = category.study_terms();
        if terms.iter().all(|t| profile.knows(t)) {
            continue;
        }
        record_event(
            store,
            persona,
            KIND_REMEDIATION,
            category.as_str(),
            &serde_json::json!({ "terms": terms }),
        )?;
        profile.learn(terms.iter());
        remediated.push(category.as_str().to_string());
    }

    let insight = LearningInsight {
        persona,
        level: m.level,
        pass_rate: m.pass_rate(),
        recent_pass_rate: eligibility::recent_pass_rate(&m.recent_results, gate.level_up_window),
        remediated_categories: remediated,
        proposals_by_status: proposals::count_by_status(store, persona)?,
    };
    record_event(
        store,
        persona,
        KIND_INSIGHT,
        "learning_cycle",
        &serde_json::to_value(&insight)?,
    )?;
    tracing::info!(
        persona = %persona,
        level = insight.level,
        pass_rate = insight.pass_rate,
        remediated = insight.remediated_categories.len(),
        "learning cycle insight recorded"
    );
    Ok(insight)
}

/// One learning pass over every persona. A failure for one persona is logged
/// and does not stop the others.
pub fn learning_cycle(
    store: &Store,
    gate: &GateConfig,
) -> Result<Vec<LearningInsight>, error::CustodesError> {
    let mut insights = Vec::new();
    for persona in Persona::ALL {
        match learn_persona(store, persona, gate) {
            Ok(i) => insights.push(i),
            Err(e) => tracing::warn!(persona = %persona, error = %e, "learning cycle failed for persona"),
        }
    }
    Ok(insights)
}
