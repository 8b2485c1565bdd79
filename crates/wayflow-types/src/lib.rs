//! Shared domain types for Wayflow.
//!
//! This crate contains the types shared by the engine, storage and CLI:
//! variable scopes, stored workflow definitions, session records, function
//! descriptors, engine configuration and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod function;
pub mod identity;
pub mod scope;
pub mod session;
pub mod workflow;
