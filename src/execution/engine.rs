//! Workflow Execution Engine
//!
//! Drives a workflow graph node by node:
//! - derives the execution order and resets the part of the graph a run
//!   will execute
//! - dispatches each node, committing its effects before the next node
//!   reads them
//! - follows loop jumps, pause nodes and graph replacement
//! - hands control back on pause, stop, failure or when superseded by a
//!   newer run, persisting a snapshot that can be resumed later

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, NodeFailure};
use crate::execution::dispatcher::{Dispatcher, Halt, Step};
use crate::execution::run_state::{GlobalContext, RunState};
use crate::execution::scope::RunScope;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::ports::generation::GenerationPort;
use crate::ports::novel::NovelPort;
use crate::ports::sync::{NodeUpdate, NullSync, SyncPort};
use crate::workflow::model::{NodeStatus, WorkflowDocument, WorkflowGraph};
use crate::workflow::orderer::order_nodes;
use crate::workflow::state::WorkflowSnapshot;
use crate::workflow::validator::validate_graph;

/// How a run ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every node executed
    Completed,
    /// Halted by a pause node or a pause request
    Paused { resume_at: usize },
    /// Halted by a stop request
    Stopped { at: usize },
    /// A newer run took over; nothing was changed after that point
    Abandoned,
    /// The graph was replaced by a generated workflow
    GraphReplaced,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Paused { resume_at } => write!(f, "paused (resume at position {})", resume_at),
            Self::Stopped { at } => write!(f, "stopped at position {}", at),
            Self::Abandoned => write!(f, "superseded by a newer run"),
            Self::GraphReplaced => write!(f, "workflow replaced by generated graph"),
        }
    }
}

/// Workflow execution engine.
///
/// Owns the graph between runs and lends it to each run. Run control from
/// other tasks goes through the shared [`RunState`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use novelflow::execution::Engine;
/// use novelflow::load_workflow;
/// use novelflow::ports::{InMemoryNovel, ScriptedGenerator};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_workflow("volume-one.yaml")?;
///     let generator = Arc::new(ScriptedGenerator::from_yaml_file("responses.yaml")?);
///     let mut engine = Engine::from_document(document, generator, Arc::new(InMemoryNovel::new()));
///
///     let outcome = engine.run(0).await?;
///     println!("{}", outcome);
///     Ok(())
/// }
/// ```
pub struct Engine {
    workflow_id: String,
    graph: WorkflowGraph,
    run_state: Arc<RunState>,
    generator: Arc<dyn GenerationPort>,
    novel: Arc<dyn NovelPort>,
    sync: Arc<dyn SyncPort>,
    config: EngineConfig,
    timeline: ExecutionTimeline,
    resumed: Option<GlobalContext>,
}

impl Engine {
    /// Creates an engine for a workflow graph.
    pub fn new(
        workflow_id: impl Into<String>,
        graph: WorkflowGraph,
        generator: Arc<dyn GenerationPort>,
        novel: Arc<dyn NovelPort>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            graph,
            run_state: Arc::new(RunState::new()),
            generator,
            novel,
            sync: Arc::new(NullSync),
            config: EngineConfig::default(),
            timeline: ExecutionTimeline::new(),
            resumed: None,
        }
    }

    /// Creates an engine for a loaded workflow file.
    pub fn from_document(
        document: WorkflowDocument,
        generator: Arc<dyn GenerationPort>,
        novel: Arc<dyn NovelPort>,
    ) -> Self {
        let (id, graph) = document.into_parts();
        Self::new(id, graph, generator, novel)
    }

    /// Shares a run state with other engines or observers.
    pub fn set_run_state(&mut self, run_state: Arc<RunState>) {
        self.run_state = run_state;
    }

    pub fn set_sync(&mut self, sync: Arc<dyn SyncPort>) {
        self.sync = sync;
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Handle for controlling the run from another task.
    pub fn run_state(&self) -> Arc<RunState> {
        Arc::clone(&self.run_state)
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut WorkflowGraph {
        &mut self.graph
    }

    /// Execution order of the current graph.
    pub fn order(&self) -> Vec<String> {
        order_nodes(&self.graph.nodes, &self.graph.edges)
    }

    /// Timeline of the most recent run.
    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Executes the workflow from order position `start`.
    ///
    /// Nodes at positions `>= start` are reset first; earlier nodes keep
    /// their status and output and feed the context as before.
    ///
    /// # Returns
    ///
    /// * `Ok(RunOutcome)` - The run completed or halted without a failure
    /// * `Err(EngineError)` - The run could not start or a node failed
    pub async fn run(&mut self, start: usize) -> Result<RunOutcome, EngineError> {
        self.generator
            .check_ready()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        self.config.validate()?;
        validate_graph(&self.graph).map_err(EngineError::InvalidWorkflow)?;

        let order = self.order();
        if start > order.len() {
            return Err(EngineError::StartOutOfRange {
                index: start,
                len: order.len(),
            });
        }

        self.graph.reset_from(&order, start);
        let run_id = self
            .run_state
            .start(&self.workflow_id, start, self.resumed.take());
        self.timeline = ExecutionTimeline::new();

        for id in order.iter().skip(start) {
            self.sync.notify(
                id,
                &NodeUpdate {
                    status: Some(NodeStatus::Pending),
                    output_entries: Some(Vec::new()),
                    loop_config: None,
                },
            );
        }

        info!(
            "Running workflow '{}' from position {} of {}",
            self.workflow_id,
            start,
            order.len()
        );

        let graph = std::mem::take(&mut self.graph);
        let mut scope = RunScope::new(
            run_id,
            &self.workflow_id,
            order,
            start,
            graph,
            Arc::clone(&self.run_state),
            Arc::clone(&self.sync),
        );

        let outcome = self.drive(&mut scope).await;
        self.graph = scope.into_graph();
        outcome
    }

    /// Resumes from the saved position, or starts over for another workflow.
    pub async fn resume(&mut self) -> Result<RunOutcome, EngineError> {
        let status = self.run_state.status();
        let start = if status.active_workflow_id.as_deref() == Some(self.workflow_id.as_str()) {
            status.current_node_index
        } else {
            0
        };
        self.run(start).await
    }

    /// Requests a pause at the current position.
    pub fn pause(&self) -> bool {
        self.run_state.request_pause()
    }

    /// Requests the run to stop.
    pub fn stop(&self) {
        self.run_state.stop();
    }

    /// Clears every node's status, output and loop counter.
    pub fn reset_status(&mut self) -> Result<(), EngineError> {
        if self.run_state.status().is_running {
            return Err(EngineError::AlreadyRunning(self.workflow_id.clone()));
        }

        self.graph.reset_all();
        self.run_state.reset(&self.workflow_id);
        self.timeline = ExecutionTimeline::new();
        self.resumed = None;

        for node in &self.graph.nodes {
            self.sync.notify(&node.id, &NodeUpdate::status(NodeStatus::Pending));
        }
        self.sync.persist(&WorkflowSnapshot::capture(
            &self.workflow_id,
            &self.graph,
            0,
            &GlobalContext::fresh(),
        ));

        info!("Reset workflow '{}'", self.workflow_id);
        Ok(())
    }

    /// Loads a saved snapshot so the next `resume` continues from it.
    pub fn restore(&mut self, snapshot: WorkflowSnapshot) -> Result<(), EngineError> {
        if snapshot.workflow_id != self.workflow_id {
            return Err(EngineError::InvalidWorkflow(format!(
                "snapshot belongs to '{}', not '{}'",
                snapshot.workflow_id, self.workflow_id
            )));
        }

        let graph = snapshot.graph();
        let index = snapshot.current_index.min(graph.len());
        if !self
            .run_state
            .restore(&self.workflow_id, index, snapshot.context.clone())
        {
            return Err(EngineError::AlreadyRunning(self.workflow_id.clone()));
        }

        info!(
            "Restored workflow '{}' at position {} ({} nodes completed)",
            self.workflow_id,
            index,
            snapshot.completed_count()
        );
        self.graph = graph;
        self.resumed = Some(snapshot.context);
        Ok(())
    }

    async fn drive(&mut self, scope: &mut RunScope) -> Result<RunOutcome, EngineError> {
        let total = scope.order.len();

        while scope.cursor < scope.order.len() {
            let index = scope.cursor;
            if !scope.is_active() {
                return Ok(self.interrupted(scope, index));
            }
            scope.run_state().update_progress(index);

            let Some(node) = scope.node_at(index) else {
                return self.fail(scope, index, "", "node missing from graph".to_string());
            };
            let id = node.id.clone();
            let name = node.display_name().to_string();
            let skipped = node.skipped;
            let control = node.kind.is_control();

            if skipped {
                debug!("Skipping '{}'", name);
                if scope.set_status(&id, NodeStatus::Completed).is_err() {
                    return Ok(self.interrupted(scope, index));
                }
                self.timeline.add_event(&id, EventType::Skipped);
                scope.cursor = index + 1;
                if !scope.commit() {
                    return Ok(self.interrupted(scope, index));
                }
                continue;
            }

            if !wait(self.config.delays.before_node(), &scope.cancel).await {
                return Ok(self.interrupted(scope, index));
            }
            if scope.set_status(&id, NodeStatus::Executing).is_err() {
                return Ok(self.interrupted(scope, index));
            }
            info!("[{}/{}] Running '{}'", index + 1, total, name);
            self.timeline.add_event(&id, EventType::Started);

            let dispatcher =
                Dispatcher::new(self.generator.as_ref(), self.novel.as_ref(), &self.config);
            match dispatcher.dispatch(scope, index).await {
                Ok(Step::Advance) => {
                    self.timeline.add_event(&id, EventType::Completed);
                    scope.cursor = index + 1;
                }
                Ok(Step::JumpTo(target)) => {
                    let event = if target <= index {
                        EventType::Jumped
                    } else {
                        EventType::Completed
                    };
                    self.timeline.add_event(&id, event);
                    scope.cursor = target;
                }
                Ok(Step::Halt(Halt::Paused { resume_at })) => {
                    self.timeline.add_event(&id, EventType::Paused);
                    scope.cursor = resume_at;
                    if !scope.commit() {
                        return Ok(self.interrupted(scope, resume_at));
                    }
                    scope.run_state().pause(resume_at);
                    info!("Workflow paused by '{}'; resume at {}", name, resume_at);
                    return Ok(RunOutcome::Paused { resume_at });
                }
                Ok(Step::Halt(Halt::GraphReplaced)) => {
                    self.timeline.add_event(&id, EventType::Completed);
                    scope.order = order_nodes(&scope.graph.nodes, &scope.graph.edges);
                    scope.cursor = 0;
                    if !scope.commit() {
                        return Ok(self.interrupted(scope, 0));
                    }
                    scope.run_state().finish(scope.run_id, 0);
                    return Ok(RunOutcome::GraphReplaced);
                }
                Err(NodeFailure::Cancelled) | Err(NodeFailure::Stale) => {
                    return Ok(self.interrupted(scope, index));
                }
                Err(NodeFailure::Fatal(message)) => {
                    return self.fail(scope, index, &id, message);
                }
            }

            let next = scope.cursor;
            if !scope.commit() {
                return Ok(self.interrupted(scope, next));
            }
            if !wait(self.config.delays.after_node(control), &scope.cancel).await {
                return Ok(self.interrupted(scope, next));
            }
            tokio::task::yield_now().await;
        }

        let end = scope.order.len();
        scope.cursor = end;
        if !scope.commit() {
            return Ok(self.interrupted(scope, end));
        }
        scope.run_state().finish(scope.run_id, end);

        info!(
            "Workflow '{}' completed in {:.2?}",
            self.workflow_id,
            self.timeline.elapsed()
        );
        Ok(RunOutcome::Completed)
    }

    /// Settles a run that lost its right to continue.
    ///
    /// A superseded run leaves everything to the newer run. A run halted by
    /// pause or stop reverts its executing node and persists where a resume
    /// would pick up.
    fn interrupted(&mut self, scope: &mut RunScope, index: usize) -> RunOutcome {
        if !scope.is_latest() {
            info!("Run {} was superseded; discarding its results", scope.run_id);
            return RunOutcome::Abandoned;
        }

        if let Some(id) = scope
            .node_at(index)
            .filter(|node| node.status == NodeStatus::Executing)
            .map(|node| node.id.clone())
        {
            scope.force_status(&id, NodeStatus::Pending);
            self.timeline.add_event(&id, EventType::Paused);
        }

        let status = scope.run_state().status();
        if status.is_running {
            // the generation call aborted without a pause or stop request
            warn!("Generation aborted at position {}; pausing", index);
            scope.persist(index);
            scope.run_state().pause(index);
            return RunOutcome::Paused { resume_at: index };
        }

        scope.persist(status.current_node_index);
        if status.is_paused {
            info!("Run {} paused at position {}", scope.run_id, status.current_node_index);
            RunOutcome::Paused {
                resume_at: status.current_node_index,
            }
        } else {
            info!("Run {} stopped at position {}", scope.run_id, index);
            RunOutcome::Stopped { at: index }
        }
    }

    /// Marks the node failed and halts the run at its position.
    fn fail(
        &mut self,
        scope: &mut RunScope,
        index: usize,
        id: &str,
        message: String,
    ) -> Result<RunOutcome, EngineError> {
        if !scope.is_active() {
            return Ok(self.interrupted(scope, index));
        }

        error!("Node '{}' at position {} failed: {}", id, index, message);
        if scope.set_status(id, NodeStatus::Failed).is_err() {
            return Ok(self.interrupted(scope, index));
        }
        self.timeline.add_event(id, EventType::Failed);

        scope.persist(index);
        scope.run_state().set_error(format!("{}: {}", id, message));

        Err(EngineError::NodeFailed {
            node_id: id.to_string(),
            index,
            message,
        })
    }
}

/// Sleeps unless the token fires first; returns false when cancelled.
async fn wait(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
