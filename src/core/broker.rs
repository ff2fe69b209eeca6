use crate::core::db;
use crate::core::error;
use crate::core::time;
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The DB Broker is the single path for state access.
/// It serializes in-process access and appends one audit event per operation.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

static DB_LOCK: Mutex<()> = Mutex::new(());

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join("broker.events.jsonl"),
        }
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::CustodesError>
    where
        F: FnOnce(&Connection) -> Result<R, error::CustodesError>,
    {
        let _lock = DB_LOCK.lock().map_err(|_| {
            error::CustodesError::ValidationError("DbBroker lock poisoned".to_string())
        })?;

        let db_id = db_id(db_path);
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        self.log_event(actor, intent_ref, op_name, &db_id, status)?;

        result
    }

    /// Like `with_conn`, but runs the closure inside one transaction.
    /// The transaction commits only when the closure returns `Ok`; an error
    /// drops it, which rolls every statement back.
    pub fn with_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::CustodesError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, error::CustodesError>,
    {
        let _lock = DB_LOCK.lock().map_err(|_| {
            error::CustodesError::ValidationError("DbBroker lock poisoned".to_string())
        })?;

        let db_id = db_id(db_path);
        let mut conn = db::db_connect(&db_path.to_string_lossy())?;

        let result: Result<R, error::CustodesError> = (|| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })();

        let status = if result.is_ok() { "success" } else { "rolled_back" };
        self.log_event(actor, intent_ref, op_name, &db_id, status)?;

        result
    }

    fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), error::CustodesError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::CustodesError::IoError)?;

        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(error::CustodesError::IoError)?;
        Ok(())
    }
}

fn db_id(db_path: &Path) -> String {
    db_path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// Read the audit log, newest last.
pub fn read_audit_log(root: &Path) -> Result<Vec<BrokerEvent>, error::CustodesError> {
    let path = root.join("broker.events.jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(error::CustodesError::from))
        .collect()
}

/// Run a blocking broker call off the async runtime's worker threads.
pub async fn run_blocking<F, R>(f: F) -> Result<R, error::CustodesError>
where
    F: FnOnce() -> Result<R, error::CustodesError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
