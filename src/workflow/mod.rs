//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading,
//! ordering and persisting novel-writing workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Node, Edge, WorkflowGraph)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Structural checks
//! - [`orderer`]: Deterministic execution order
//! - [`state`]: Resumable run snapshots

pub mod model;
pub mod orderer;
pub mod parser;
pub mod state;
pub mod validator;

pub use model::{Edge, Node, NodeKind, NodeStatus, WorkflowDocument, WorkflowGraph};
pub use orderer::order_nodes;
pub use parser::load_workflow;
pub use state::WorkflowSnapshot;
