//! Workflow engine core.
//!
//! - `definition` -- stored definition parsing, validation, load/save
//! - `compiler` -- definition -> executable [`Graph`]
//! - `graph` -- steps and parent/child paths
//! - `step` -- step kinds, requests and responses
//! - `exprset` -- ordered variable assignments
//! - `gateway` -- join and conditional routing
//! - `session` -- the scheduler running one graph

pub mod compiler;
pub mod definition;
pub mod exprset;
pub mod gateway;
pub mod graph;
pub mod session;
pub mod step;

pub use compiler::compile;
pub use graph::{Graph, GraphError};
pub use session::{
    Session, SessionError, SessionOptions, SessionSnapshot, StateChange, StateChangeHandler,
};
pub use step::{ExecRequest, ExecResponse, Step, StepError, StepHandler, StepKind, Suspend};
