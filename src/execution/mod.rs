//! Workflow Execution Module
//!
//! Runs a workflow graph one node at a time, sharing its progress through
//! a run state that other tasks can observe and control.
//!
//! # Architecture
//!
//! - [`engine`]: Run loop, run control and snapshot restore
//! - [`run_state`]: Shared run status, run ids and cancellation
//! - [`scope`]: State threaded through a single run
//! - [`dispatcher`]: Per-node behavior
//! - [`context`]: Conversation context from predecessor nodes
//! - [`generation`]: Retry and continuation around generation calls
//! - [`merge`]: Folding generated entries into nodes and content sets

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod generation;
pub mod merge;
pub mod run_state;
pub mod scope;

pub use engine::{Engine, RunOutcome};
pub use run_state::{GlobalContext, RunState, RunStatus};
