//! Infrastructure layer for Wayflow.
//!
//! Contains implementations of the repository traits defined in
//! `wayflow-core` (SQLite storage) and the engine configuration loader.

pub mod config;
pub mod sqlite;
