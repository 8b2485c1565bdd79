//! Functions available to workflows run from the command line.

use chrono::Utc;
use wayflow_core::function::Function;
use wayflow_types::function::{FunctionMeta, Param};
use wayflow_types::scope::{Scope, ValueType};

/// `echo`, `log` and `now`.
pub fn builtin_functions() -> Vec<Function> {
    vec![
        Function::new(
            FunctionMeta::new("echo").describe("Return the arguments as results"),
            |call| async move { Ok(call.args) },
        ),
        Function::new(
            FunctionMeta::new("log")
                .describe("Write the arguments to the log")
                .param(Param::new("message", &[ValueType::String])),
            |call| async move {
                tracing::info!(
                    session_id = call.session_id,
                    step_id = call.step_id,
                    args = %call.args.to_json(),
                    "workflow log"
                );
                Ok(Scope::new())
            },
        ),
        Function::new(
            FunctionMeta::new("now")
                .describe("Current time")
                .result(Param::new("now", &[ValueType::DateTime])),
            |_call| async move { Ok(Scope::new().with("now", Utc::now())) },
        ),
    ]
}
