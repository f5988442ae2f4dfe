//! Novelflow - Workflow Execution Engine for AI-Assisted Novel Writing
//!
//! Executes node graphs that plan and write a novel: outlines, character
//! rosters, world-building, chapter text and volume plans are produced by
//! a text-generation service and filed into the novel as the run
//! progresses. Runs can be paused, stopped, resumed and restored from a
//! snapshot.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`workflow`]: Graph model, loading, validation, ordering and snapshots
//! - [`execution`]: Run loop, run state and per-node dispatch
//! - [`ports`]: Generation service, novel storage and state sync interfaces
//! - [`text`]: Numerals, templates and response parsing
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine settings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use novelflow::execution::Engine;
//! use novelflow::load_workflow;
//! use novelflow::ports::{InMemoryNovel, ScriptedGenerator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let document = load_workflow("volume-one.yaml")?;
//!
//!     // Replay prepared responses instead of calling a live service
//!     let generator = Arc::new(ScriptedGenerator::from_yaml_file("responses.yaml")?);
//!     let novel = Arc::new(InMemoryNovel::new());
//!
//!     // Execute the workflow
//!     let mut engine = Engine::from_document(document, generator, novel);
//!     engine.run(0).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod ports;
pub mod text;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::EngineError;
pub use execution::engine::{Engine, RunOutcome};
pub use workflow::model::{Edge, Node, NodeKind, WorkflowGraph};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Novelflow";
