//! Gateway steps: routing without producing data.
//!
//! Fork is stateless and lives directly on [`StepKind`](super::step::StepKind).
//! Join keeps a per-state arrival buffer shared by every branch that reaches
//! it; inclusive and exclusive choose children by evaluating guards in
//! declared order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use wayflow_types::scope::Scope;
use wayflow_types::workflow::StepId;

use super::step::{ExecRequest, ExecResponse, StepError};
use crate::expr::Evaluable;

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// Arrival buffer of one join invocation.
///
/// Every branch reaching the join within a session shares the same
/// `JoinState`; the mutex serializes arrivals.
#[derive(Debug, Default)]
pub struct JoinState {
    arrived: Mutex<BTreeMap<StepId, Scope>>,
}

impl JoinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a buffer from persisted arrivals.
    pub fn with_arrivals(arrivals: impl IntoIterator<Item = (StepId, Scope)>) -> Self {
        Self {
            arrived: Mutex::new(arrivals.into_iter().collect()),
        }
    }

    /// Branch scopes received so far, ordered by parent id.
    pub fn arrivals(&self) -> Vec<(StepId, Scope)> {
        self.arrived
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, scope)| (*id, scope.clone()))
            .collect()
    }
}

/// Waits for every declared parent, then merges their branch scopes.
#[derive(Debug, Clone)]
pub struct JoinGateway {
    parents: Vec<StepId>,
}

impl JoinGateway {
    pub fn new(parents: Vec<StepId>) -> Self {
        Self { parents }
    }

    pub fn parents(&self) -> &[StepId] {
        &self.parents
    }

    /// Record the calling branch. Until the last declared parent arrives the
    /// answer is `Partial`; the final merge follows declared parent order,
    /// so later-declared parents win on key conflicts regardless of timing.
    pub fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        let state = req
            .join
            .as_ref()
            .ok_or_else(|| StepError::Internal(format!("join {} has no state", req.step_id)))?;

        if !self.parents.contains(&req.parent) {
            return Err(StepError::UnknownJoinPath(req.parent));
        }

        let mut arrived = state
            .arrived
            .lock()
            .map_err(|_| StepError::Internal(format!("join {} state poisoned", req.step_id)))?;
        if arrived.contains_key(&req.parent) {
            return Err(StepError::DuplicateJoinPath(req.parent));
        }
        arrived.insert(req.parent, req.merged_scope());

        if arrived.len() < self.parents.len() {
            tracing::debug!(
                session_id = req.session_id,
                step_id = req.step_id,
                parent = req.parent,
                arrived = arrived.len(),
                expected = self.parents.len(),
                "join waiting for more branches"
            );
            return Ok(ExecResponse::Partial);
        }

        let merged = self
            .parents
            .iter()
            .filter_map(|parent| arrived.get(parent))
            .fold(Scope::new(), |acc, branch| acc.merge([branch]));

        Ok(ExecResponse::Result(merged))
    }
}

// ---------------------------------------------------------------------------
// Inclusive / exclusive
// ---------------------------------------------------------------------------

/// Outgoing path of a choice gateway. No guard means "always".
#[derive(Debug, Clone)]
pub struct GatewayPath {
    pub child: StepId,
    pub test: Option<Arc<dyn Evaluable>>,
}

impl GatewayPath {
    pub fn new(child: StepId, test: Option<Arc<dyn Evaluable>>) -> Self {
        Self { child, test }
    }

    fn matches(&self, scope: &Scope) -> Result<bool, StepError> {
        match &self.test {
            Some(test) => Ok(test.test(scope)?),
            None => Ok(true),
        }
    }
}

/// Continues into every path whose guard holds.
#[derive(Debug, Clone)]
pub struct InclusiveGateway {
    paths: Vec<GatewayPath>,
}

impl InclusiveGateway {
    pub fn new(paths: Vec<GatewayPath>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[GatewayPath] {
        &self.paths
    }

    pub fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        let scope = req.merged_scope();
        let mut next = Vec::new();
        for path in &self.paths {
            if path.matches(&scope)? {
                next.push(path.child);
            }
        }

        if next.is_empty() {
            return Err(StepError::NoMatchingPath);
        }
        Ok(ExecResponse::Next(next))
    }
}

/// Continues into the first path whose guard holds; a guard-less path
/// acts as the default.
#[derive(Debug, Clone)]
pub struct ExclusiveGateway {
    paths: Vec<GatewayPath>,
}

impl ExclusiveGateway {
    pub fn new(paths: Vec<GatewayPath>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[GatewayPath] {
        &self.paths
    }

    pub fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, StepError> {
        let scope = req.merged_scope();
        for path in &self.paths {
            if path.matches(&scope)? {
                return Ok(ExecResponse::Step(path.child));
            }
        }
        Err(StepError::NoMatchingPath)
    }
}
