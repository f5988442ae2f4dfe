//! State Synchronisation
//!
//! The engine pushes node updates and whole-workflow snapshots through a
//! [`SyncPort`]. Both calls are fire-and-forget: failures are logged by the
//! implementation and never interrupt the run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::workflow::model::{LoopConfig, NodeStatus, OutputEntry};
use crate::workflow::state::WorkflowSnapshot;

/// Partial update of a single node, for live display.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_entries: Option<Vec<OutputEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
}

impl NodeUpdate {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn outputs(entries: Vec<OutputEntry>) -> Self {
        Self {
            output_entries: Some(entries),
            ..Self::default()
        }
    }

    pub fn loop_config(config: LoopConfig) -> Self {
        Self {
            loop_config: Some(config),
            ..Self::default()
        }
    }
}

/// Receives engine state changes.
pub trait SyncPort: Send + Sync {
    /// Persists the whole workflow after a node-boundary mutation.
    fn persist(&self, snapshot: &WorkflowSnapshot);

    /// Informs observers of a node change.
    fn notify(&self, node_id: &str, update: &NodeUpdate);
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSync;

impl SyncPort for NullSync {
    fn persist(&self, _snapshot: &WorkflowSnapshot) {}

    fn notify(&self, _node_id: &str, _update: &NodeUpdate) {}
}

/// Writes snapshots to a state directory.
///
/// Inside a Tokio runtime the write runs on the blocking pool so the run
/// loop never waits on the disk; call [`FileSync::flush`] before exiting.
/// A snapshot older than the one already written is dropped.
#[derive(Debug, Clone)]
pub struct FileSync {
    state_dir: PathBuf,
    sequence: Arc<AtomicU64>,
    written: Arc<Mutex<u64>>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FileSync {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            sequence: Arc::new(AtomicU64::new(0)),
            written: Arc::new(Mutex::new(0)),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// Waits for every queued write to reach the disk.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("State writer stopped unexpectedly: {}", e);
            }
        }
    }
}

impl SyncPort for FileSync {
    fn persist(&self, snapshot: &WorkflowSnapshot) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let state_dir = self.state_dir.clone();
        let written = Arc::clone(&self.written);
        let snapshot = snapshot.clone();

        let write = move || {
            let mut last = written.lock().unwrap_or_else(|e| e.into_inner());
            if *last > sequence {
                return;
            }
            if let Err(e) = snapshot.save(&state_dir) {
                warn!("Failed to save workflow state: {}", e);
            }
            *last = sequence;
        };

        match Handle::try_current() {
            Ok(handle) => {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.retain(|h| !h.is_finished());
                pending.push(handle.spawn_blocking(write));
            }
            Err(_) => write(),
        }
    }

    fn notify(&self, _node_id: &str, _update: &NodeUpdate) {}
}

/// Keeps every update in memory for inspection.
#[derive(Default)]
pub struct RecordingSync {
    snapshots: Mutex<Vec<WorkflowSnapshot>>,
    updates: Mutex<Vec<(String, NodeUpdate)>>,
}

impl RecordingSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<WorkflowSnapshot> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn updates(&self) -> Vec<(String, NodeUpdate)> {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Status transitions reported for one node, in order.
    pub fn statuses_for(&self, node_id: &str) -> Vec<NodeStatus> {
        self.updates()
            .into_iter()
            .filter(|(id, _)| id == node_id)
            .filter_map(|(_, update)| update.status)
            .collect()
    }

    /// Node ids in the order they were first reported completed.
    pub fn completion_order(&self) -> Vec<String> {
        self.updates()
            .into_iter()
            .filter(|(_, update)| update.status == Some(NodeStatus::Completed))
            .map(|(id, _)| id)
            .collect()
    }
}

impl SyncPort for RecordingSync {
    fn persist(&self, snapshot: &WorkflowSnapshot) {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(snapshot.clone());
    }

    fn notify(&self, node_id: &str, update: &NodeUpdate) {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((node_id.to_string(), update.clone()));
    }
}
