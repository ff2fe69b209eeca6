//! Subsystem registration: every table-owning plugin lists its initializer here.
//!
//! Adding a new subsystem: append one entry to `SUBSYSTEMS`.

use crate::core::error;
use crate::plugins::{learning, metrics, proposals};
use std::path::Path;

pub struct SubsystemInit {
    pub name: &'static str,
    pub initialize_db: fn(&Path) -> Result<(), error::CustodesError>,
}

/// Sequential on purpose: all subsystems share one SQLite file, and the
/// metrics tables must exist before anything references a persona.
pub const SUBSYSTEMS: &[SubsystemInit] = &[
    SubsystemInit { name: "metrics", initialize_db: metrics::initialize_metrics_db },
    SubsystemInit { name: "proposals", initialize_db: proposals::initialize_proposals_db },
    SubsystemInit { name: "learning", initialize_db: learning::initialize_learning_db },
];

/// Initialize all subsystem tables in the store at `root`.
pub fn initialize_all_dbs(root: &Path) -> Result<(), error::CustodesError> {
    std::fs::create_dir_all(root)?;
    for sub in SUBSYSTEMS {
        tracing::debug!(subsystem = sub.name, "initializing subsystem tables");
        (sub.initialize_db)(root)?;
    }
    Ok(())
}
