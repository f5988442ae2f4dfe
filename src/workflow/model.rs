//! Workflow Data Model
//!
//! Core data structures representing workflow nodes, the edges between
//! them, and the output each node accumulates during a run.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: first-volume
//! nodes:
//!   - id: folder
//!     typeKey: createFolder
//!     folderName: Volume One
//!     position: { x: 0, y: 0 }
//!
//!   - id: outline
//!     typeKey: outline
//!     instruction: Generate 30 chapters of outline for {{premise}}
//!     position: { x: 0, y: 120 }
//!
//! edges:
//!   - { id: e1, source: folder, target: outline }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ports::generation::ModelConfig;
use crate::ports::novel::ContentKind;

/// Run-time status of a node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet visited in the current run
    #[default]
    Pending,
    /// Currently being dispatched
    Executing,
    /// Finished successfully
    Completed,
    /// Failed; the run halted at this node
    Failed,
}

/// Canvas coordinates, used only to break ordering ties.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single piece of generated output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputEntry {
    /// Local nonce, never reused across entries
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl OutputEntry {
    /// Creates an entry with a fresh id.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            content: content.into(),
        }
    }

    /// Returns true if the entry carries neither a title nor content.
    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty() && self.content.trim().is_empty()
    }
}

/// Generates a fresh local identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Redirects generated output into a new group once a marker is seen.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SplitRule {
    pub trigger_marker: String,
    pub new_group_name: String,
}

impl SplitRule {
    pub fn new(trigger_marker: impl Into<String>, new_group_name: impl Into<String>) -> Self {
        Self {
            trigger_marker: trigger_marker.into(),
            new_group_name: new_group_name.into(),
        }
    }

    /// Returns true if the rule's marker appears in the given title.
    ///
    /// A marker ending in a digit does not match a longer number, so
    /// "Chapter 1" does not match "Chapter 12".
    pub fn matches(&self, title: &str) -> bool {
        let marker = self.trigger_marker.trim();
        if marker.is_empty() {
            return false;
        }
        let numeric_tail = marker.ends_with(|c: char| c.is_ascii_digit());
        title.match_indices(marker).any(|(at, _)| {
            !numeric_tail || !title[at + marker.len()..].starts_with(|c: char| c.is_ascii_digit())
        })
    }
}

/// Loop counter configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_count")]
    pub count: u32,
    /// Rounds already jumped back; mutated by the engine
    #[serde(default)]
    pub current_index: u32,
    /// Round of the enclosing loop, held while this loop repeats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_round: Option<u32>,
}

impl LoopConfig {
    /// Clears the counters left by a previous pass.
    pub fn rewind(&mut self) {
        self.current_index = 0;
        self.outer_round = None;
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count: default_loop_count(),
            current_index: 0,
            outer_round: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_loop_count() -> u32 {
    1
}

/// Per-node model settings layered over the engine defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelOverride {
    /// Applies the override on top of a base configuration.
    pub fn apply(&self, base: &ModelConfig) -> ModelConfig {
        let mut config = base.clone();
        if let Some(model) = self.model.as_ref().filter(|m| !m.trim().is_empty()) {
            config.model = model.clone();
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            config.top_p = top_p;
        }
        if self.top_k.is_some() {
            config.top_k = self.top_k;
        }
        if self.max_tokens.is_some() {
            config.max_tokens = self.max_tokens;
        }
        config
    }
}

/// Content sets selected as reference material for a generation node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSelection {
    #[serde(default)]
    pub world_set_ids: Vec<String>,
    #[serde(default)]
    pub character_set_ids: Vec<String>,
    #[serde(default)]
    pub outline_set_ids: Vec<String>,
    #[serde(default)]
    pub inspiration_set_ids: Vec<String>,
}

impl ReferenceSelection {
    /// Returns the selected set ids grouped by content kind, skipping empty lists.
    pub fn selections(&self) -> Vec<(ContentKind, &[String])> {
        [
            (ContentKind::World, self.world_set_ids.as_slice()),
            (ContentKind::Characters, self.character_set_ids.as_slice()),
            (ContentKind::Outline, self.outline_set_ids.as_slice()),
            (ContentKind::Inspiration, self.inspiration_set_ids.as_slice()),
        ]
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.selections().is_empty()
    }
}

/// Binds a value extracted from a user-input node into a run variable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VariableBinding {
    pub name: String,
    /// Optional regex; the first capture group (or whole match) is bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Configuration of a grouping node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FolderSpec {
    #[serde(default)]
    pub folder_name: String,
}

/// Configuration of a user-input node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInputSpec {
    #[serde(default)]
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variable_bindings: Vec<VariableBinding>,
    /// Instruction after interpolation; set by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_instruction: Option<String>,
}

/// Configuration of a loop controller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoopSpec {
    #[serde(default)]
    pub loop_config: LoopConfig,
}

/// Configuration shared by every node that calls the generation service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSpec {
    #[serde(default)]
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<ModelOverride>,
    #[serde(default)]
    pub references: ReferenceSelection,
    /// Extra instruction per loop round, keyed by the round number
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loop_instructions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split_rules: Vec<SplitRule>,
}

impl GenerationSpec {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Self::default()
        }
    }

    /// Adds an extra instruction for a specific loop round.
    pub fn with_round_instruction(mut self, round: u32, text: impl Into<String>) -> Self {
        self.loop_instructions.insert(round.to_string(), text.into());
        self
    }

    pub fn with_references(mut self, references: ReferenceSelection) -> Self {
        self.references = references;
        self
    }

    pub fn with_split_rules(mut self, rules: Vec<SplitRule>) -> Self {
        self.split_rules = rules;
        self
    }

    /// Returns the extra instruction for the given round, if any.
    pub fn round_instruction(&self, round: u32) -> Option<&str> {
        self.loop_instructions
            .get(&round.to_string())
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

/// The closed set of node variants, keyed by `typeKey`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "typeKey", rename_all = "camelCase")]
pub enum NodeKind {
    CreateFolder(FolderSpec),
    ReuseDirectory(FolderSpec),
    UserInput(UserInputSpec),
    PauseNode,
    LoopNode(LoopSpec),
    SaveToVolume(GenerationSpec),
    WorkflowGenerator(GenerationSpec),
    Outline(GenerationSpec),
    Characters(GenerationSpec),
    WorldBuilding(GenerationSpec),
    Inspiration(GenerationSpec),
    AiChat(GenerationSpec),
    Chapter(GenerationSpec),
}

impl NodeKind {
    /// The serialized variant name.
    pub fn type_key(&self) -> &'static str {
        match self {
            Self::CreateFolder(_) => "createFolder",
            Self::ReuseDirectory(_) => "reuseDirectory",
            Self::UserInput(_) => "userInput",
            Self::PauseNode => "pauseNode",
            Self::LoopNode(_) => "loopNode",
            Self::SaveToVolume(_) => "saveToVolume",
            Self::WorkflowGenerator(_) => "workflowGenerator",
            Self::Outline(_) => "outline",
            Self::Characters(_) => "characters",
            Self::WorldBuilding(_) => "worldBuilding",
            Self::Inspiration(_) => "inspiration",
            Self::AiChat(_) => "aiChat",
            Self::Chapter(_) => "chapter",
        }
    }

    /// Fixed heading used when this node's output is shown to later nodes.
    pub fn context_label(&self) -> &'static str {
        match self {
            Self::CreateFolder(_) | Self::ReuseDirectory(_) => "group",
            Self::UserInput(_) => "user input",
            Self::PauseNode => "pause",
            Self::LoopNode(_) => "loop",
            Self::SaveToVolume(_) => "volume plan",
            Self::WorkflowGenerator(_) => "workflow draft",
            Self::Outline(_) => "outline",
            Self::Characters(_) => "character roster",
            Self::WorldBuilding(_) => "world-building",
            Self::Inspiration(_) => "inspiration",
            Self::AiChat(_) => "conversation",
            Self::Chapter(_) => "chapter text",
        }
    }

    /// Group name adopted by grouping nodes.
    pub fn group_name(&self) -> Option<&str> {
        match self {
            Self::CreateFolder(spec) | Self::ReuseDirectory(spec) => {
                Some(spec.folder_name.trim()).filter(|name| !name.is_empty())
            }
            _ => None,
        }
    }

    /// Returns the generation settings for nodes that call the service.
    pub fn generation_spec(&self) -> Option<&GenerationSpec> {
        match self {
            Self::SaveToVolume(spec)
            | Self::WorkflowGenerator(spec)
            | Self::Outline(spec)
            | Self::Characters(spec)
            | Self::WorldBuilding(spec)
            | Self::Inspiration(spec)
            | Self::AiChat(spec)
            | Self::Chapter(spec) => Some(spec),
            _ => None,
        }
    }

    /// Content set that standard output of this node is filed under.
    pub fn content_kind(&self) -> Option<ContentKind> {
        match self {
            Self::Outline(_) => Some(ContentKind::Outline),
            Self::Characters(_) => Some(ContentKind::Characters),
            Self::WorldBuilding(_) => Some(ContentKind::World),
            Self::Inspiration(_) => Some(ContentKind::Inspiration),
            Self::Chapter(_) => Some(ContentKind::Chapters),
            _ => None,
        }
    }

    /// Set-like output inlines entry titles when shown as context.
    pub fn is_set_like(&self) -> bool {
        matches!(
            self,
            Self::Outline(_) | Self::Characters(_) | Self::WorldBuilding(_)
        )
    }

    /// Control nodes complete without calling the generation service.
    pub fn is_control(&self) -> bool {
        self.generation_spec().is_none()
    }
}

/// A single step in the workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default = "new_id")]
    pub id: String,

    /// Display name shown on the canvas
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    #[serde(default)]
    pub position: Position,

    #[serde(default)]
    pub status: NodeStatus,

    /// Skipped nodes are passed over by the engine
    #[serde(default)]
    pub skipped: bool,

    /// Generated output, in generation order
    #[serde(default)]
    pub output_entries: Vec<OutputEntry>,

    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// Creates a pending node.
    ///
    /// # Example
    ///
    /// ```
    /// use novelflow::workflow::model::{GenerationSpec, Node, NodeKind};
    ///
    /// let node = Node::new("outline", NodeKind::Outline(GenerationSpec::new("Generate 10 chapters")))
    ///     .at(0.0, 120.0)
    ///     .with_label("Outline");
    /// assert_eq!(node.kind.type_key(), "outline");
    /// ```
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into().trim().to_string(),
            label: String::new(),
            position: Position::default(),
            status: NodeStatus::Pending,
            skipped: false,
            output_entries: Vec::new(),
            kind,
        }
    }

    /// Places the node on the canvas.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Marks the node as skipped.
    pub fn skipped(mut self) -> Self {
        self.skipped = true;
        self
    }

    /// Name used in log lines and the timeline.
    pub fn display_name(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    /// Clears run-time state so the node can execute again.
    pub fn reset(&mut self) {
        self.status = NodeStatus::Pending;
        self.output_entries.clear();
    }

    /// Loop configuration, for loop nodes.
    pub fn loop_config(&self) -> Option<&LoopConfig> {
        match &self.kind {
            NodeKind::LoopNode(spec) => Some(&spec.loop_config),
            _ => None,
        }
    }

    pub fn loop_config_mut(&mut self) -> Option<&mut LoopConfig> {
        match &mut self.kind {
            NodeKind::LoopNode(spec) => Some(&mut spec.loop_config),
            _ => None,
        }
    }
}

/// A directed precedence (or loop back-reference) between two nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    #[serde(default = "new_id")]
    pub id: String,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            source: source.into(),
            target: target.into(),
        }
    }
}

/// The node and edge set the engine executes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the graph.
    pub fn add_node(&mut self, node: Node) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Adds an edge between two nodes.
    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.edges.push(Edge::new(source, target));
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<(), String> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| format!("Node '{}' not found", id))?;

        self.edges.retain(|e| e.source != id && e.target != id);
        self.nodes.remove(index);
        Ok(())
    }

    /// Gets a node by ID.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Gets a mutable reference to a node by ID.
    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Edges leaving the node, in insertion order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Edges entering the node, in insertion order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Resets status and output of every node at order position `>= start`.
    ///
    /// A fresh run (`start == 0`) also rewinds loop counters.
    pub fn reset_from(&mut self, order: &[String], start: usize) {
        for id in order.iter().skip(start) {
            if let Some(node) = self.node_mut(id) {
                node.reset();
                if start == 0 {
                    if let Some(config) = node.loop_config_mut() {
                        config.rewind();
                    }
                }
            }
        }
    }

    /// Clears status, output and loop counters of every node.
    pub fn reset_all(&mut self) {
        for node in &mut self.nodes {
            node.reset();
            if let Some(config) = node.loop_config_mut() {
                config.rewind();
            }
        }
    }

    /// Returns the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A workflow file: identity plus its graph.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDocument {
    /// Splits the document into its id and graph.
    pub fn into_parts(self) -> (String, WorkflowGraph) {
        (
            self.id,
            WorkflowGraph {
                nodes: self.nodes,
                edges: self.edges,
            },
        )
    }
}
