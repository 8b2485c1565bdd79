//! Logging and trace export setup for Wayflow binaries.

pub mod tracing_setup;
