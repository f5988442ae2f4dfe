//! Run State
//!
//! The single source of truth for which run is active, how far it got and
//! whether it may still touch node state. One instance is shared (via
//! `Arc`) by the engine, the caller controlling the run, and any observer.
//!
//! # Invariants
//!
//! - `is_running` and `is_paused` are never both true
//! - every `start` mints a new run id and cancels the previous run's token
//! - a run is active only while running and holding the latest id

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::workflow::model::SplitRule;

/// Identifier minted for each run.
pub type RunId = u64;

/// Variable holding the 1-based round of the innermost active loop.
pub const LOOP_INDEX_VAR: &str = "loop_index";

/// Variables and cross-node state carried through a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContext {
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Group that generated output is filed under
    #[serde(default)]
    pub active_group_anchor: Option<String>,

    /// Split rules waiting for their trigger marker
    #[serde(default)]
    pub pending_splits: Vec<SplitRule>,
}

impl GlobalContext {
    /// Context for a run starting from the first node.
    pub fn fresh() -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(LOOP_INDEX_VAR.to_string(), Value::from(1));
        Self {
            variables,
            active_group_anchor: None,
            pending_splits: Vec::new(),
        }
    }

    /// Current loop round, 1 when no loop has run.
    pub fn loop_index(&self) -> u32 {
        self.variables
            .get(LOOP_INDEX_VAR)
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1)
    }

    pub fn set_loop_index(&mut self, round: u32) {
        self.variables
            .insert(LOOP_INDEX_VAR.to_string(), Value::from(round));
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::fresh()
    }
}

/// Observable status of the run.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: RunId,
    pub is_running: bool,
    pub is_paused: bool,
    pub current_node_index: usize,
    pub active_workflow_id: Option<String>,
    pub error: Option<String>,
}

struct Inner {
    status: RunStatus,
    context: GlobalContext,
    cancel: CancellationToken,
    /// Last id handed out
    last_run_id: RunId,
}

/// Shared run state machine.
///
/// # Example
///
/// ```
/// use novelflow::execution::run_state::RunState;
///
/// let state = RunState::new();
/// let run = state.start("novel", 0, None);
/// assert!(state.is_active(run));
///
/// state.pause(2);
/// assert!(!state.is_active(run));
/// assert!(state.status().is_paused);
/// ```
pub struct RunState {
    inner: Mutex<Inner>,
    updates: watch::Sender<RunStatus>,
}

impl RunState {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(RunStatus::default());
        Self {
            inner: Mutex::new(Inner {
                status: RunStatus::default(),
                context: GlobalContext::fresh(),
                cancel: CancellationToken::new(),
                last_run_id: 0,
            }),
            updates,
        }
    }

    /// Begins a new run and returns its id.
    ///
    /// The context is reset when starting from the first node; otherwise
    /// the supplied context (or the one already held) carries forward.
    pub fn start(
        &self,
        workflow_id: &str,
        start_index: usize,
        resumed: Option<GlobalContext>,
    ) -> RunId {
        let mut inner = self.lock();
        inner.last_run_id += 1;
        let run_id = inner.last_run_id;

        inner.cancel.cancel();
        inner.cancel = CancellationToken::new();

        if start_index == 0 {
            inner.context = GlobalContext::fresh();
        } else if let Some(context) = resumed {
            inner.context = context;
        }

        inner.status = RunStatus {
            run_id,
            is_running: true,
            is_paused: false,
            current_node_index: start_index,
            active_workflow_id: Some(workflow_id.to_string()),
            error: None,
        };

        info!("Run {} started at position {}", run_id, start_index);
        self.publish(&inner);
        run_id
    }

    /// Halts the run, remembering where to resume.
    pub fn pause(&self, index: usize) {
        let mut inner = self.lock();
        inner.status.is_running = false;
        inner.status.is_paused = true;
        inner.status.current_node_index = index;
        inner.cancel.cancel();

        info!("Run {} paused at position {}", inner.status.run_id, index);
        self.publish(&inner);
    }

    /// Pauses a running run at its current position.
    pub fn request_pause(&self) -> bool {
        let index = {
            let inner = self.lock();
            if !inner.status.is_running {
                return false;
            }
            inner.status.current_node_index
        };
        self.pause(index);
        true
    }

    /// Halts the run without marking it resumable.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.status.is_running = false;
        inner.status.is_paused = false;
        inner.cancel.cancel();

        info!("Run {} stopped", inner.status.run_id);
        self.publish(&inner);
    }

    /// Records a fatal error; the run stays resumable at its position.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.lock();
        inner.status.is_running = false;
        inner.status.is_paused = true;
        inner.status.error = Some(message.clone());
        inner.cancel.cancel();

        warn!("Run {} halted: {}", inner.status.run_id, message);
        self.publish(&inner);
    }

    pub fn update_progress(&self, index: usize) {
        let mut inner = self.lock();
        inner.status.current_node_index = index;
        self.publish(&inner);
    }

    /// Returns true while the run is running and has not been superseded.
    pub fn is_active(&self, run_id: RunId) -> bool {
        let inner = self.lock();
        inner.status.is_running && inner.status.run_id == run_id
    }

    /// Stores the run's context if the run is still active.
    pub fn commit_context(&self, run_id: RunId, context: &GlobalContext) -> bool {
        let mut inner = self.lock();
        if !(inner.status.is_running && inner.status.run_id == run_id) {
            debug!("Dropping context commit from stale run {}", run_id);
            return false;
        }
        inner.context = context.clone();
        true
    }

    /// Marks an active run as finished at the given position.
    pub fn finish(&self, run_id: RunId, index: usize) -> bool {
        let mut inner = self.lock();
        if !(inner.status.is_running && inner.status.run_id == run_id) {
            return false;
        }
        inner.status.is_running = false;
        inner.status.is_paused = false;
        inner.status.current_node_index = index;

        info!("Run {} finished", run_id);
        self.publish(&inner);
        true
    }

    /// Rewinds progress of an idle workflow to the beginning.
    pub fn reset(&self, workflow_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.status.is_running {
            return false;
        }
        let owns = inner
            .status
            .active_workflow_id
            .as_deref()
            .map_or(true, |id| id == workflow_id);
        if !owns {
            return false;
        }

        inner.status.is_paused = false;
        inner.status.current_node_index = 0;
        inner.status.error = None;
        inner.context = GlobalContext::fresh();
        self.publish(&inner);
        true
    }

    /// Loads a saved position and context into an idle state.
    pub fn restore(&self, workflow_id: &str, index: usize, context: GlobalContext) -> bool {
        let mut inner = self.lock();
        if inner.status.is_running {
            return false;
        }
        inner.status.active_workflow_id = Some(workflow_id.to_string());
        inner.status.current_node_index = index;
        inner.status.is_paused = index > 0;
        inner.status.error = None;
        inner.context = context;
        self.publish(&inner);
        true
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> RunStatus {
        self.lock().status.clone()
    }

    /// Copy of the held context.
    pub fn context(&self) -> GlobalContext {
        self.lock().context.clone()
    }

    /// Token of the current run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    pub fn current_node_index(&self) -> usize {
        self.lock().status.current_node_index
    }

    /// Receives a status snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.updates.subscribe()
    }

    fn publish(&self, inner: &Inner) {
        self.updates.send_replace(inner.status.clone());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_not_running_and_paused(state: &RunState) {
        let status = state.status();
        assert!(!(status.is_running && status.is_paused));
    }

    #[test]
    fn test_running_and_paused_never_both_true() {
        let state = RunState::new();
        assert_not_running_and_paused(&state);

        state.start("w", 0, None);
        assert_not_running_and_paused(&state);
        state.pause(1);
        assert_not_running_and_paused(&state);
        state.start("w", 1, None);
        assert_not_running_and_paused(&state);
        state.set_error("boom");
        assert_not_running_and_paused(&state);
        state.start("w", 1, None);
        state.stop();
        assert_not_running_and_paused(&state);
    }

    #[test]
    fn test_new_run_supersedes_old() {
        let state = RunState::new();
        let first = state.start("w", 0, None);
        let first_token = state.cancel_token();

        let second = state.start("w", 0, None);

        assert!(second > first);
        assert!(!state.is_active(first));
        assert!(state.is_active(second));
        assert!(first_token.is_cancelled());
        assert!(!state.cancel_token().is_cancelled());
    }

    #[test]
    fn test_concurrent_starts_leave_newest_active() {
        let state = RunState::new();

        let ids: Vec<RunId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| state.start("w", 0, None)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let newest = *ids.iter().max().unwrap();
        assert_eq!(state.status().run_id, newest);
        assert!(state.is_active(newest));
        for id in ids.iter().filter(|id| **id != newest) {
            assert!(!state.is_active(*id));
        }
    }

    #[test]
    fn test_pause_and_stop_cancel_token() {
        let state = RunState::new();
        state.start("w", 0, None);
        let token = state.cancel_token();
        state.pause(3);
        assert!(token.is_cancelled());
        assert_eq!(state.current_node_index(), 3);

        state.start("w", 3, None);
        let token = state.cancel_token();
        state.stop();
        assert!(token.is_cancelled());
        assert!(!state.status().is_paused);
    }

    #[test]
    fn test_start_from_zero_resets_context() {
        let state = RunState::new();
        let run = state.start("w", 0, None);
        let mut context = state.context();
        context.set_variable("premise", Value::from("a heist"));
        context.set_loop_index(3);
        assert!(state.commit_context(run, &context));
        state.pause(2);

        state.start("w", 2, None);
        assert_eq!(state.context().loop_index(), 3);
        assert!(state.context().variable("premise").is_some());

        state.start("w", 0, None);
        assert_eq!(state.context(), GlobalContext::fresh());
    }

    #[test]
    fn test_start_with_resumed_context() {
        let state = RunState::new();
        let mut resumed = GlobalContext::fresh();
        resumed.active_group_anchor = Some("Volume Two".to_string());

        state.start("w", 4, Some(resumed.clone()));
        assert_eq!(state.context(), resumed);
    }

    #[test]
    fn test_stale_commit_is_dropped() {
        let state = RunState::new();
        let old = state.start("w", 0, None);
        state.start("w", 0, None);

        let mut context = GlobalContext::fresh();
        context.active_group_anchor = Some("stale".to_string());

        assert!(!state.commit_context(old, &context));
        assert!(state.context().active_group_anchor.is_none());
        assert!(!state.finish(old, 5));
    }

    #[test]
    fn test_set_error_keeps_position() {
        let state = RunState::new();
        let run = state.start("w", 0, None);
        state.update_progress(2);
        state.set_error("parse failure");

        let status = state.status();
        assert!(!state.is_active(run));
        assert!(status.is_paused);
        assert_eq!(status.current_node_index, 2);
        assert_eq!(status.error.as_deref(), Some("parse failure"));
    }

    #[test]
    fn test_request_pause_only_when_running() {
        let state = RunState::new();
        assert!(!state.request_pause());

        state.start("w", 0, None);
        state.update_progress(1);
        assert!(state.request_pause());
        assert_eq!(state.current_node_index(), 1);
        assert!(state.status().is_paused);
    }

    #[test]
    fn test_reset_and_restore() {
        let state = RunState::new();
        state.start("w", 0, None);
        state.pause(2);

        assert!(!state.reset("other"));
        assert!(state.reset("w"));
        assert_eq!(state.current_node_index(), 0);
        assert!(!state.status().is_paused);

        assert!(state.restore("w", 3, GlobalContext::fresh()));
        assert!(state.status().is_paused);
        assert_eq!(state.current_node_index(), 3);
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let state = RunState::new();
        let mut updates = state.subscribe();

        let run = state.start("w", 0, None);
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().run_id, run);

        state.pause(1);
        assert!(updates.borrow_and_update().is_paused);
    }

    #[test]
    fn test_loop_index_parsing() {
        let mut context = GlobalContext::fresh();
        assert_eq!(context.loop_index(), 1);

        context.set_variable(LOOP_INDEX_VAR, Value::from("4"));
        assert_eq!(context.loop_index(), 4);

        context.set_variable(LOOP_INDEX_VAR, Value::Null);
        assert_eq!(context.loop_index(), 1);
    }
}
