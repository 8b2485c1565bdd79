//! Directed graph of steps.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use thiserror::Error;
use wayflow_types::workflow::StepId;

use super::step::Step;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("step {0} already exists in the graph")]
    DuplicateStep(StepId),

    #[error("step {0} does not exist in the graph")]
    StepNotFound(StepId),

    #[error("no step id left after {0}")]
    IdsExhausted(StepId),
}

/// Steps plus parent -> child edges.
///
/// Nodes and edges keep insertion order, so `children`, `parents` and
/// `orphans` are deterministic.
#[derive(Debug, Default)]
pub struct Graph {
    steps: HashMap<StepId, Arc<Step>>,
    edges: DiGraphMap<StepId, ()>,
    last_id: StepId,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a step, assigning the next free id when it has none.
    pub fn add_step(&mut self, mut step: Step) -> Result<StepId, GraphError> {
        if step.id() == 0 {
            let next = self
                .last_id
                .checked_add(1)
                .ok_or(GraphError::IdsExhausted(self.last_id))?;
            step.set_id(next);
        }

        let id = step.id();
        if self.steps.contains_key(&id) {
            return Err(GraphError::DuplicateStep(id));
        }

        self.last_id = self.last_id.max(id);
        self.edges.add_node(id);
        self.steps.insert(id, Arc::new(step));
        Ok(id)
    }

    /// Insert `parent` (unless already present) and each child, wiring
    /// `parent -> child` for every child. Returns the parent's id.
    pub fn add_step_with_children(
        &mut self,
        parent: Step,
        children: impl IntoIterator<Item = Step>,
    ) -> Result<StepId, GraphError> {
        let parent_id = self.ensure(parent)?;
        for child in children {
            let child_id = self.ensure(child)?;
            self.add_parent(child_id, parent_id)?;
        }
        Ok(parent_id)
    }

    /// Insert a step, or reuse it when a step with the same non-zero id is
    /// already present.
    fn ensure(&mut self, step: Step) -> Result<StepId, GraphError> {
        if step.id() != 0 && self.steps.contains_key(&step.id()) {
            return Ok(step.id());
        }
        self.add_step(step)
    }

    /// Add a `parent -> child` edge. Adding an existing edge is a no-op.
    pub fn add_parent(&mut self, child: StepId, parent: StepId) -> Result<(), GraphError> {
        for id in [child, parent] {
            if !self.steps.contains_key(&id) {
                return Err(GraphError::StepNotFound(id));
            }
        }
        if !self.edges.contains_edge(parent, child) {
            self.edges.add_edge(parent, child, ());
        }
        Ok(())
    }

    pub fn step_by_id(&self, id: StepId) -> Option<Arc<Step>> {
        self.steps.get(&id).cloned()
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.steps.contains_key(&id)
    }

    pub fn children(&self, id: StepId) -> Vec<StepId> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn parents(&self, id: StepId) -> Vec<StepId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: StepId, dir: Direction) -> Vec<StepId> {
        if !self.edges.contains_node(id) {
            return Vec::new();
        }
        self.edges.neighbors_directed(id, dir).collect()
    }

    /// Steps without incoming edges, in insertion order.
    pub fn orphans(&self) -> Vec<StepId> {
        self.edges
            .nodes()
            .filter(|id| {
                self.edges
                    .neighbors_directed(*id, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Step ids in insertion order.
    pub fn step_ids(&self) -> Vec<StepId> {
        self.edges.nodes().collect()
    }

    /// All edges as `(parent, child)` pairs.
    pub fn paths(&self) -> Vec<(StepId, StepId)> {
        self.edges.all_edges().map(|(p, c, _)| (p, c)).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn path_count(&self) -> usize {
        self.edges.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::StepKind;

    fn fork() -> Step {
        Step::new(StepKind::Fork)
    }

    #[test]
    fn test_ids_are_assigned() {
        let mut g = Graph::new();
        let a = g.add_step(fork()).unwrap();
        let b = g.add_step(fork()).unwrap();
        let c = g.add_step(fork().with_id(10)).unwrap();
        let d = g.add_step(fork()).unwrap();
        assert_eq!((a, b, c, d), (1, 2, 10, 11));
        assert_eq!(g.step_by_id(10).unwrap().id(), 10);
        assert!(g.step_by_id(3).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut g = Graph::new();
        g.add_step(fork().with_id(5)).unwrap();
        assert_eq!(g.add_step(fork().with_id(5)), Err(GraphError::DuplicateStep(5)));
    }

    #[test]
    fn test_assigned_id_never_wraps() {
        let mut g = Graph::new();
        g.add_step(fork().with_id(StepId::MAX)).unwrap();
        assert_eq!(g.add_step(fork()), Err(GraphError::IdsExhausted(StepId::MAX)));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_fan_out_and_orphans() {
        let mut g = Graph::new();
        let start = g
            .add_step_with_children(
                fork().with_id(1),
                [fork().with_id(2), fork().with_id(3), fork().with_id(4)],
            )
            .unwrap();
        let end = g.add_step(fork().with_id(5)).unwrap();
        for split in [2, 3, 4] {
            g.add_parent(end, split).unwrap();
        }

        assert_eq!(start, 1);
        assert_eq!(g.children(1), vec![2, 3, 4]);
        assert_eq!(g.parents(5), vec![2, 3, 4]);
        assert_eq!(g.orphans(), vec![1]);
        assert_eq!(g.path_count(), 6);
    }

    #[test]
    fn test_add_parent_is_idempotent() {
        let mut g = Graph::new();
        let a = g.add_step(fork()).unwrap();
        let b = g.add_step(fork()).unwrap();
        g.add_parent(b, a).unwrap();
        g.add_parent(b, a).unwrap();
        assert_eq!(g.path_count(), 1);
    }

    #[test]
    fn test_add_parent_requires_both_steps() {
        let mut g = Graph::new();
        let a = g.add_step(fork()).unwrap();
        assert_eq!(g.add_parent(a, 99), Err(GraphError::StepNotFound(99)));
        assert_eq!(g.add_parent(98, a), Err(GraphError::StepNotFound(98)));
    }

    #[test]
    fn test_multiple_orphans_keep_insertion_order() {
        let mut g = Graph::new();
        g.add_step(fork().with_id(7)).unwrap();
        g.add_step(fork().with_id(3)).unwrap();
        g.add_step(fork().with_id(5)).unwrap();
        g.add_parent(5, 7).unwrap();
        assert_eq!(g.orphans(), vec![7, 3]);
        assert_eq!(g.step_ids(), vec![7, 3, 5]);
    }
}
