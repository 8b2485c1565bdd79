//! Workflow engine and service layer for Wayflow.
//!
//! This crate defines the engine (graphs, steps, sessions) and the "ports"
//! (repository traits) that the infrastructure layer implements. It depends
//! only on `wayflow-types` -- never on `wayflow-infra` or any database crate.

pub mod expr;
pub mod function;
pub mod id;
pub mod repository;
pub mod service;
pub mod workflow;
