//! Monitoring Module
//!
//! Records the execution timeline of a run for the CLI summary.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node start/end events and Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent, Visit};
