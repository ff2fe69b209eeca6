//! Core modules shared by every custodes subsystem.
//!
//! Store layout, database access through the broker, configuration, logging
//! and time helpers live here.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod output;
pub mod schemas;
pub mod store;
pub mod time;
