//! Persona subsystems: metrics, gates, custody testing, proposals and the
//! background loops that drive them.

pub mod agents;
pub mod analysis;
pub mod auto_apply;
pub mod custody;
pub mod eligibility;
pub mod generators;
pub mod learning;
pub mod llm;
pub mod metrics;
pub mod persona;
pub mod proposals;
pub mod repo;
pub mod scheduler;
