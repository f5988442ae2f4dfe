//! Workflow Snapshot Persistence
//!
//! A snapshot captures everything needed to resume a run after the
//! process exits: node statuses and outputs, the edge set, the progress
//! index and the run context.
//!
//! Snapshots are saved to `{state_dir}/{workflow_id}.state` at every node
//! boundary.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::model::{Edge, Node, NodeStatus, WorkflowGraph};
use crate::execution::run_state::GlobalContext;

/// Persistent state of a workflow run.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub workflow_id: String,

    pub nodes: Vec<Node>,

    pub edges: Vec<Edge>,

    /// Order position the next run should start from
    pub current_index: usize,

    pub context: GlobalContext,

    /// Last time the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl WorkflowSnapshot {
    /// Captures the current state of a workflow.
    pub fn capture(
        workflow_id: &str,
        graph: &WorkflowGraph,
        current_index: usize,
        context: &GlobalContext,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            nodes: graph.nodes.clone(),
            edges: graph.edges.clone(),
            current_index,
            context: context.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Rebuilds the graph held in the snapshot.
    pub fn graph(&self) -> WorkflowGraph {
        WorkflowGraph {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    /// Number of nodes that finished successfully.
    pub fn completed_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .count()
    }

    /// ID of the node that failed, if any.
    pub fn failed_node(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.status == NodeStatus::Failed)
            .map(|n| n.id.as_str())
    }

    /// Saves the snapshot under the state directory.
    pub fn save(&self, state_dir: &Path) -> Result<PathBuf, Box<dyn Error>> {
        fs::create_dir_all(state_dir)?;

        let state_file = Self::state_file_path_for(state_dir, &self.workflow_id);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&state_file, json)?;

        info!("Saved workflow state to {}", state_file.display());
        Ok(state_file)
    }

    /// Loads the snapshot of a workflow.
    ///
    /// Returns an error if no state file exists or it can't be read.
    pub fn load(state_dir: &Path, workflow_id: &str) -> Result<Self, Box<dyn Error>> {
        let state_file = Self::state_file_path_for(state_dir, workflow_id);

        let content = fs::read_to_string(&state_file)?;
        let snapshot: WorkflowSnapshot = serde_json::from_str(&content)?;

        info!("Loaded workflow state from {}", state_file.display());
        info!(
            "Previously completed: {} of {} nodes, resuming at {}",
            snapshot.completed_count(),
            snapshot.nodes.len(),
            snapshot.current_index
        );

        Ok(snapshot)
    }

    /// Deletes the snapshot of a workflow, if one exists.
    pub fn delete(state_dir: &Path, workflow_id: &str) -> Result<(), Box<dyn Error>> {
        let state_file = Self::state_file_path_for(state_dir, workflow_id);
        if state_file.exists() {
            fs::remove_file(&state_file)?;
            info!("Deleted state file: {}", state_file.display());
        }
        Ok(())
    }

    /// Returns the state file path for a workflow id.
    pub fn state_file_path_for(state_dir: &Path, workflow_id: &str) -> PathBuf {
        let stem: String = workflow_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stem = if stem.is_empty() { "workflow".to_string() } else { stem };

        state_dir.join(format!("{}.state", stem))
    }
}
