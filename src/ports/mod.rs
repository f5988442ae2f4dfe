//! External Collaborators
//!
//! Interfaces the engine depends on but does not own, together with the
//! in-process implementations used by the CLI and tests.
//!
//! - [`generation`]: the text-generation service
//! - [`scripted`]: replay generator with a request log
//! - [`sync`]: persistence and live status updates
//! - [`novel`]: the novel aggregate (groups, content sets, presets)

pub mod generation;
pub mod novel;
pub mod scripted;
pub mod sync;

pub use generation::{ChatMessage, ChatRole, GenerationError, GenerationPort, ModelConfig};
pub use novel::{ContentItem, ContentKind, InMemoryNovel, NovelPort};
pub use scripted::ScriptedGenerator;
pub use sync::{FileSync, NodeUpdate, NullSync, RecordingSync, SyncPort};
