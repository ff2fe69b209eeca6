//! Persona heuristics over source files.
//!
//! Each persona owns a fixed table of regex rules. A rule either reports a
//! finding, or also carries a replacement, in which case matching files get a
//! rewritten body that becomes a proposal's `code_after`.

use crate::plugins::persona::Persona;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Performance,
    Security,
    Quality,
    Experiment,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::Performance => "performance",
            FindingKind::Security => "security",
            FindingKind::Quality => "quality",
            FindingKind::Experiment => "experiment",
        }
    }
}

pub struct Rule {
    pub id: &'static str,
    pub persona: Persona,
    pub kind: FindingKind,
    /// Empty means every source extension.
    pub extensions: &'static [&'static str],
    pub pattern: Regex,
    pub description: &'static str,
    pub replacement: Option<&'static str>,
    /// Fire only when the pattern matches more than this many times.
    pub min_matches: usize,
    /// Fire only on files at least this long.
    pub min_file_len: usize,
    pub confidence: f64,
}

/// Extensions the repository scan considers at all.
pub const SOURCE_EXTENSIONS: &[&str] = &[
    "dart", "js", "jsx", "ts", "tsx", "py", "rs", "java", "kt", "swift", "go",
];

#[allow(clippy::too_many_arguments)]
fn rule(
    id: &'static str,
    persona: Persona,
    kind: FindingKind,
    extensions: &'static [&'static str],
    pattern: &str,
    description: &'static str,
    replacement: Option<&'static str>,
    confidence: f64,
) -> Rule {
    Rule {
        id,
        persona,
        kind,
        extensions,
        pattern: Regex::new(pattern).expect("static regex"),
        description,
        replacement,
        min_matches: 0,
        min_file_len: 0,
        confidence,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // Imperium: optimization
        rule(
            "imperium.debug_print",
            Persona::Imperium,
            FindingKind::Performance,
            &["dart"],
            r"\bprint\(",
            "Replace print() with debugPrint() so release builds stay quiet",
            Some("debugPrint("),
            0.8,
        ),
        Rule {
            min_matches: 3,
            ..rule(
                "imperium.set_state_churn",
                Persona::Imperium,
                FindingKind::Performance,
                &["dart"],
                r"\bsetState\(",
                "Frequent setState() calls; consider a state management approach",
                None,
                0.6,
            )
        },
        Rule {
            min_file_len: 1000,
            ..rule(
                "imperium.large_class",
                Persona::Imperium,
                FindingKind::Quality,
                &["dart"],
                r"\bclass\s+\w+",
                "Large class file; consider splitting into smaller widgets",
                None,
                0.5,
            )
        },
        // Guardian: security and quality
        rule(
            "guardian.hardcoded_password",
            Persona::Guardian,
            FindingKind::Security,
            &["dart"],
            r#"(?i)(password\s*=\s*)["'][^"']+["']"#,
            "Hardcoded password; read it from the environment instead",
            Some("${1}Platform.environment['APP_PASSWORD'] ?? ''"),
            0.9,
        ),
        rule(
            "guardian.sql_concat",
            Persona::Guardian,
            FindingKind::Security,
            &[],
            r"SELECT.*\+.*\$",
            "SQL built by string concatenation; use parameterized queries",
            None,
            0.7,
        ),
        rule(
            "guardian.trailing_whitespace",
            Persona::Guardian,
            FindingKind::Quality,
            &[],
            r"(?m)[ \t]+$",
            "Strip trailing whitespace",
            Some(""),
            0.95,
        ),
        rule(
            "guardian.long_line",
            Persona::Guardian,
            FindingKind::Quality,
            &[],
            r"(?m)^.{121,}$",
            "Line longer than 120 characters",
            None,
            0.5,
        ),
        // Sandbox: experiments with newer APIs
        rule(
            "sandbox.raised_button",
            Persona::Sandbox,
            FindingKind::Experiment,
            &["dart"],
            r"\bRaisedButton\b",
            "Migrate deprecated RaisedButton to ElevatedButton",
            Some("ElevatedButton"),
            0.75,
        ),
        rule(
            "sandbox.flat_button",
            Persona::Sandbox,
            FindingKind::Experiment,
            &["dart"],
            r"\bFlatButton\b",
            "Migrate deprecated FlatButton to TextButton",
            Some("TextButton"),
            0.75,
        ),
        // Conquest: lean production code
        rule(
            "conquest.length_zero",
            Persona::Conquest,
            FindingKind::Performance,
            &["dart"],
            r"\.length\s*==\s*0\b",
            "Use .isEmpty instead of comparing length to zero",
            Some(".isEmpty"),
            0.85,
        ),
        rule(
            "conquest.length_positive",
            Persona::Conquest,
            FindingKind::Performance,
            &["dart"],
            r"\.length\s*>\s*0\b",
            "Use .isNotEmpty instead of length > 0",
            Some(".isNotEmpty"),
            0.85,
        ),
    ]
});

pub fn rules_for(persona: Persona) -> impl Iterator<Item = &'static Rule> {
    RULES.iter().filter(move |r| r.persona == persona)
}

pub fn extension_of(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() { None } else { Some(ext) }
}

pub fn is_source_file(path: &str) -> bool {
    extension_of(path)
        .map(|e| SOURCE_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub persona: Persona,
    pub kind: FindingKind,
    pub description: String,
    /// 1-based line of the first match.
    pub line: usize,
    pub matches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rewrite {
    pub code_after: String,
    pub rule_ids: Vec<String>,
    pub description: String,
    pub improvement_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub path: String,
    pub findings: Vec<Finding>,
    pub rewrite: Option<Rewrite>,
}

fn evaluate(rule: &Rule, content: &str) -> Option<Finding> {
    if content.len() < rule.min_file_len {
        return None;
    }
    let mut iter = rule.pattern.find_iter(content);
    let first = iter.next()?;
    let matches = 1 + iter.count();
    if matches <= rule.min_matches {
        return None;
    }
    let line = content[..first.start()].matches('\n').count() + 1;
    Some(Finding {
        rule_id: rule.id.to_string(),
        persona: rule.persona,
        kind: rule.kind,
        description: rule.description.to_string(),
        line,
        matches,
    })
}

fn applies_to(rule: &Rule, path: &str) -> bool {
    if rule.extensions.is_empty() {
        return true;
    }
    extension_of(path)
        .map(|e| rule.extensions.contains(&e))
        .unwrap_or(false)
}

/// Run one persona's rules over one file.
pub fn analyze_file(persona: Persona, path: &str, content: &str) -> FileAnalysis {
    let mut findings = Vec::new();
    let mut code_after = content.to_string();
    let mut applied: Vec<&Rule> = Vec::new();

    for rule in rules_for(persona).filter(|r| applies_to(r, path)) {
        let Some(finding) = evaluate(rule, content) else {
            continue;
        };
        findings.push(finding);
        if let Some(replacement) = rule.replacement {
            let next = rule.pattern.replace_all(&code_after, replacement).into_owned();
            if next != code_after {
                code_after = next;
                applied.push(rule);
            }
        }
    }

    let rewrite = if applied.is_empty() {
        None
    } else {
        let confidence = applied
            .iter()
            .map(|r| r.confidence)
            .fold(f64::INFINITY, f64::min);
        Some(Rewrite {
            code_after,
            rule_ids: applied.iter().map(|r| r.id.to_string()).collect(),
            description: applied
                .iter()
                .map(|r| r.description)
                .collect::<Vec<_>>()
                .join("; "),
            improvement_type: applied[0].kind.as_str().to_string(),
            confidence,
        })
    };

    FileAnalysis {
        path: path.to_string(),
        findings,
        rewrite,
    }
}

/// Analyze many `(path, content)` pairs in parallel, keeping input order.
pub fn analyze_files(persona: Persona, files: &[(String, String)]) -> Vec<FileAnalysis> {
    files
        .par_iter()
        .map(|(path, content)| analyze_file(persona, path, content))
        .collect()
}

/// Security findings from every persona's security rules, ignoring extension.
pub fn security_findings(content: &str) -> Vec<Finding> {
    RULES
        .iter()
        .filter(|r| r.kind == FindingKind::Security)
        .filter_map(|r| evaluate(r, content))
        .collect()
}
