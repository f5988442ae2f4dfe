//! Run Scope
//!
//! Everything one run threads from node to node: the graph it owns, the
//! execution order, the cursor, the run context and the cancellation
//! token. Node mutations go through the scope so that a run which is no
//! longer active cannot change anything.

use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::NodeFailure;
use crate::execution::run_state::{GlobalContext, RunId, RunState};
use crate::ports::sync::{NodeUpdate, SyncPort};
use crate::workflow::model::{Node, NodeStatus, OutputEntry, WorkflowGraph};
use crate::workflow::state::WorkflowSnapshot;

pub struct RunScope {
    pub run_id: RunId,
    pub workflow_id: String,
    pub order: Vec<String>,
    /// Position of the node being executed
    pub cursor: usize,
    pub graph: WorkflowGraph,
    pub context: GlobalContext,
    pub cancel: CancellationToken,
    run_state: Arc<RunState>,
    sync: Arc<dyn SyncPort>,
}

impl RunScope {
    pub fn new(
        run_id: RunId,
        workflow_id: &str,
        order: Vec<String>,
        cursor: usize,
        graph: WorkflowGraph,
        run_state: Arc<RunState>,
        sync: Arc<dyn SyncPort>,
    ) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.to_string(),
            order,
            cursor,
            graph,
            context: run_state.context(),
            cancel: run_state.cancel_token(),
            run_state,
            sync,
        }
    }

    /// Returns true while this run may mutate state.
    pub fn is_active(&self) -> bool {
        self.run_state.is_active(self.run_id)
    }

    /// Returns true if no newer run has started, even if this one halted.
    pub fn is_latest(&self) -> bool {
        self.run_state.status().run_id == self.run_id
    }

    pub fn ensure_active(&self) -> Result<(), NodeFailure> {
        if self.is_active() {
            Ok(())
        } else {
            Err(NodeFailure::Stale)
        }
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn node_id_at(&self, index: usize) -> Option<&str> {
        self.order.get(index).map(String::as_str)
    }

    pub fn node_at(&self, index: usize) -> Option<&Node> {
        self.node_id_at(index).and_then(|id| self.graph.node(id))
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.graph.node_mut(id)
    }

    /// Order position of a node.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|n| n == id)
    }

    /// Sets a node's status if the run is still active.
    pub fn set_status(&mut self, id: &str, status: NodeStatus) -> Result<(), NodeFailure> {
        self.ensure_active()?;
        self.force_status(id, status);
        Ok(())
    }

    /// Sets a node's status without the liveness check.
    pub(crate) fn force_status(&mut self, id: &str, status: NodeStatus) {
        if let Some(node) = self.graph.node_mut(id) {
            node.status = status;
            self.sync.notify(id, &NodeUpdate::status(status));
        }
    }

    /// Replaces a node's outputs if the run is still active.
    pub fn set_outputs(&mut self, id: &str, entries: Vec<OutputEntry>) -> Result<(), NodeFailure> {
        self.ensure_active()?;
        if let Some(node) = self.graph.node_mut(id) {
            node.output_entries = entries.clone();
            self.sync.notify(id, &NodeUpdate::outputs(entries));
        }
        Ok(())
    }

    /// Notifies observers of a node's loop counter.
    pub fn publish_loop(&self, id: &str) {
        if let Some(config) = self.graph.node(id).and_then(Node::loop_config) {
            self.sync.notify(id, &NodeUpdate::loop_config(*config));
        }
    }

    /// Commits the context and persists a snapshot resuming at the cursor.
    ///
    /// Returns false when the run is no longer active.
    pub fn commit(&self) -> bool {
        if !self.run_state.commit_context(self.run_id, &self.context) {
            return false;
        }
        self.persist(self.cursor);
        true
    }

    /// Persists a snapshot that resumes at `next_index`.
    pub fn persist(&self, next_index: usize) {
        debug!("Persisting workflow '{}' at position {}", self.workflow_id, next_index);
        let snapshot =
            WorkflowSnapshot::capture(&self.workflow_id, &self.graph, next_index, &self.context);
        self.sync.persist(&snapshot);
    }

    /// Hands the graph back once the run is over.
    pub fn into_graph(self) -> WorkflowGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::sync::RecordingSync;
    use crate::workflow::model::{GenerationSpec, NodeKind};

    fn scope(run_state: &Arc<RunState>, sync: &Arc<RecordingSync>) -> RunScope {
        let mut graph = WorkflowGraph::new();
        graph
            .add_node(Node::new("a", NodeKind::Chapter(GenerationSpec::new("x"))))
            .unwrap();
        let run_id = run_state.start("w", 0, None);
        RunScope::new(
            run_id,
            "w",
            vec!["a".to_string()],
            0,
            graph,
            Arc::clone(run_state),
            Arc::clone(sync) as Arc<dyn SyncPort>,
        )
    }

    #[test]
    fn test_status_updates_notify() {
        let run_state = Arc::new(RunState::new());
        let sync = Arc::new(RecordingSync::new());
        let mut scope = scope(&run_state, &sync);

        scope.set_status("a", NodeStatus::Executing).unwrap();

        assert_eq!(scope.node_at(0).unwrap().status, NodeStatus::Executing);
        assert_eq!(sync.statuses_for("a"), vec![NodeStatus::Executing]);
    }

    #[test]
    fn test_stale_scope_cannot_mutate() {
        let run_state = Arc::new(RunState::new());
        let sync = Arc::new(RecordingSync::new());
        let mut scope = scope(&run_state, &sync);

        run_state.start("w", 0, None);

        assert!(!scope.is_latest());
        assert_eq!(
            scope.set_status("a", NodeStatus::Completed),
            Err(NodeFailure::Stale)
        );
        assert_eq!(scope.node_at(0).unwrap().status, NodeStatus::Pending);
        assert!(!scope.commit());
        assert!(sync.snapshots().is_empty());
    }

    #[test]
    fn test_commit_persists_at_cursor() {
        let run_state = Arc::new(RunState::new());
        let sync = Arc::new(RecordingSync::new());
        let mut scope = scope(&run_state, &sync);
        scope.cursor = 1;
        scope.context.active_group_anchor = Some("Volume One".to_string());

        assert!(scope.commit());

        let snapshots = sync.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].current_index, 1);
        assert_eq!(
            run_state.context().active_group_anchor.as_deref(),
            Some("Volume One")
        );
    }

    #[test]
    fn test_paused_scope_is_latest_but_inactive() {
        let run_state = Arc::new(RunState::new());
        let sync = Arc::new(RecordingSync::new());
        let scope = scope(&run_state, &sync);

        run_state.pause(0);

        assert!(scope.is_latest());
        assert!(!scope.is_active());
        assert!(scope.cancel.is_cancelled());
    }
}
