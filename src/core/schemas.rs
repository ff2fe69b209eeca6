//! Centralized database schema definitions.
//!
//! custodes keeps all state in one SQLite database, `custodes.db`:
//! 1. agent_metrics + custody_tests: per-persona counters and bounded test history.
//! 2. proposals: code-change proposals with a content-hash unique index.
//! 3. learning_events + xp_awards: append-only activity records.

pub const CUSTODES_DB_NAME: &str = "custodes.db";

// --- 1. Metrics ---

pub const METRICS_DB_SCHEMA_AGENT_METRICS: &str = "
    CREATE TABLE IF NOT EXISTS agent_metrics (
        persona TEXT PRIMARY KEY,
        level INTEGER NOT NULL DEFAULT 1,
        xp INTEGER NOT NULL DEFAULT 0,
        total_tests_given INTEGER NOT NULL DEFAULT 0,
        total_tests_passed INTEGER NOT NULL DEFAULT 0,
        total_tests_failed INTEGER NOT NULL DEFAULT 0,
        consecutive_successes INTEGER NOT NULL DEFAULT 0,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        last_test_date INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const METRICS_DB_SCHEMA_CUSTODY_TESTS: &str = "
    CREATE TABLE IF NOT EXISTS custody_tests (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        test_id TEXT NOT NULL UNIQUE,
        persona TEXT NOT NULL,
        category TEXT NOT NULL,
        difficulty TEXT NOT NULL,
        score REAL NOT NULL,
        passed INTEGER NOT NULL,
        xp_awarded INTEGER NOT NULL DEFAULT 0,
        generator TEXT NOT NULL,
        feedback TEXT,
        created_at INTEGER NOT NULL,
        FOREIGN KEY(persona) REFERENCES agent_metrics(persona)
    )
";
pub const METRICS_DB_SCHEMA_CUSTODY_TESTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_custody_tests_persona ON custody_tests(persona, seq)";

pub const METRICS_DB_SCHEMA_XP_AWARDS: &str = "
    CREATE TABLE IF NOT EXISTS xp_awards (
        award_id TEXT PRIMARY KEY,
        persona TEXT NOT NULL,
        amount INTEGER NOT NULL,
        reason TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY(persona) REFERENCES agent_metrics(persona)
    )
";

// --- 2. Proposals ---

pub const PROPOSALS_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS proposals (
        id TEXT PRIMARY KEY,
        persona TEXT NOT NULL,
        file_path TEXT NOT NULL,
        code_before TEXT NOT NULL,
        code_after TEXT NOT NULL,
        description TEXT NOT NULL,
        improvement_type TEXT NOT NULL,
        confidence REAL NOT NULL,
        code_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        test_status TEXT NOT NULL DEFAULT 'not-run',
        test_output TEXT,
        user_feedback TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";
pub const PROPOSALS_DB_SCHEMA_HASH_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_proposals_code_hash ON proposals(code_hash)";
pub const PROPOSALS_DB_SCHEMA_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status, test_status)";

// --- 3. Learning ---

pub const LEARNING_DB_SCHEMA_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS learning_events (
        event_id TEXT PRIMARY KEY,
        persona TEXT NOT NULL,
        kind TEXT NOT NULL,
        subject TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
";
pub const LEARNING_DB_SCHEMA_EVENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_learning_events_persona ON learning_events(persona, created_at)";
