//! Node Dispatch
//!
//! Executes a single node against the run scope. Control nodes act on the
//! run context and the cursor; generation nodes compose a conversation,
//! call the generation service and fold the result back into the node and
//! the novel.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::NodeFailure;
use crate::execution::context::build_context;
use crate::execution::generation::{complete_with_retry, generate_entries, GenerationRequest};
use crate::execution::merge::{merge_into_set, merge_output_entries};
use crate::execution::scope::RunScope;
use crate::ports::generation::{ChatMessage, GenerationPort, ModelConfig};
use crate::ports::novel::{ContentKind, NovelPort};
use crate::text::numerals::target_end_index;
use crate::text::response::{parse_graph, parse_split_rules};
use crate::text::template::{bind_variables, interpolate};
use crate::workflow::model::{
    GenerationSpec, Node, NodeKind, NodeStatus, OutputEntry, SplitRule, UserInputSpec,
};
use crate::workflow::validator::validate_graph;

/// What the run loop does after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Continue with the next position
    Advance,
    /// Move the cursor to an arbitrary position
    JumpTo(usize),
    Halt(Halt),
}

/// Reasons a node ends the run without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Paused { resume_at: usize },
    /// The graph was replaced by a generated workflow
    GraphReplaced,
}

/// Executes nodes with the configured ports.
pub struct Dispatcher<'a> {
    generator: &'a dyn GenerationPort,
    novel: &'a dyn NovelPort,
    config: &'a EngineConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        generator: &'a dyn GenerationPort,
        novel: &'a dyn NovelPort,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            generator,
            novel,
            config,
        }
    }

    /// Executes the node at order position `index`.
    ///
    /// The node is expected to be marked executing already; on success it
    /// has been marked completed (or reset, for a loop that jumps back).
    ///
    /// # Returns
    ///
    /// * `Ok(Step)` - Where the run continues
    /// * `Err(NodeFailure)` - The node was cancelled, superseded or failed
    pub async fn dispatch(&self, scope: &mut RunScope, index: usize) -> Result<Step, NodeFailure> {
        let node = scope
            .node_at(index)
            .cloned()
            .ok_or_else(|| NodeFailure::fatal(format!("no node at position {}", index)))?;

        debug!(
            "Dispatching '{}' ({}) at position {}",
            node.display_name(),
            node.kind.type_key(),
            index
        );

        match &node.kind {
            NodeKind::CreateFolder(_) => self.create_folder(scope, &node),
            NodeKind::ReuseDirectory(_) => self.reuse_directory(scope, &node),
            NodeKind::UserInput(spec) => self.user_input(scope, &node.id, spec),
            NodeKind::PauseNode => {
                scope.set_status(&node.id, NodeStatus::Completed)?;
                Ok(Step::Halt(Halt::Paused {
                    resume_at: index + 1,
                }))
            }
            NodeKind::LoopNode(_) => self.loop_node(scope, index, &node),
            NodeKind::SaveToVolume(spec) => self.save_to_volume(scope, index, &node, spec).await,
            NodeKind::WorkflowGenerator(spec) => {
                self.workflow_generator(scope, index, &node, spec).await
            }
            NodeKind::Outline(spec)
            | NodeKind::Characters(spec)
            | NodeKind::WorldBuilding(spec)
            | NodeKind::Inspiration(spec)
            | NodeKind::AiChat(spec)
            | NodeKind::Chapter(spec) => self.generate(scope, index, &node, spec).await,
        }
    }

    fn create_folder(&self, scope: &mut RunScope, node: &Node) -> Result<Step, NodeFailure> {
        let name = node
            .kind
            .group_name()
            .ok_or_else(|| NodeFailure::fatal("folder name is empty"))?
            .to_string();

        scope.ensure_active()?;
        if self.novel.ensure_group(&name) {
            info!("Created group '{}'", name);
        }
        scope.context.active_group_anchor = Some(name);
        scope.set_status(&node.id, NodeStatus::Completed)?;
        Ok(Step::Advance)
    }

    fn reuse_directory(&self, scope: &mut RunScope, node: &Node) -> Result<Step, NodeFailure> {
        let name = node
            .kind
            .group_name()
            .ok_or_else(|| NodeFailure::fatal("folder name is empty"))?
            .to_string();

        if !self.novel.has_group(&name) {
            warn!("Group '{}' does not exist yet; output will create it", name);
        }
        scope.context.active_group_anchor = Some(name);
        scope.set_status(&node.id, NodeStatus::Completed)?;
        Ok(Step::Advance)
    }

    fn user_input(
        &self,
        scope: &mut RunScope,
        id: &str,
        spec: &UserInputSpec,
    ) -> Result<Step, NodeFailure> {
        let resolved = interpolate(&spec.instruction, &scope.context.variables);
        let bound = bind_variables(&resolved, &spec.variable_bindings)?;

        scope.ensure_active()?;
        for (name, value) in bound {
            debug!("Bound variable '{}'", name);
            scope.context.set_variable(name, value);
        }
        if let Some(node) = scope.node_mut(id) {
            if let NodeKind::UserInput(spec) = &mut node.kind {
                spec.resolved_instruction = Some(resolved);
            }
        }
        scope.set_status(id, NodeStatus::Completed)?;
        Ok(Step::Advance)
    }

    fn loop_node(&self, scope: &mut RunScope, index: usize, node: &Node) -> Result<Step, NodeFailure> {
        let config = node.loop_config().copied().unwrap_or_default();
        if !config.enabled {
            debug!("Loop '{}' is disabled", node.display_name());
            scope.set_status(&node.id, NodeStatus::Completed)?;
            return Ok(Step::Advance);
        }

        let targets: Vec<usize> = scope
            .graph
            .outgoing(&node.id)
            .filter_map(|edge| scope.position_of(&edge.target))
            .collect();
        let back = targets
            .iter()
            .copied()
            .find(|&t| t <= index)
            .or_else(|| targets.first().copied());

        let target = match back {
            Some(target) if target <= index => target,
            _ => {
                warn!(
                    "Loop '{}' has no edge back into the workflow; passing through",
                    node.display_name()
                );
                scope.set_status(&node.id, NodeStatus::Completed)?;
                return Ok(Step::Advance);
            }
        };

        scope.ensure_active()?;

        if config.current_index + 1 < config.count {
            let round = config.current_index + 1;
            let outer = scope.context.loop_index();
            if let Some(loop_config) = scope.node_mut(&node.id).and_then(Node::loop_config_mut) {
                loop_config.current_index = round;
                loop_config.outer_round.get_or_insert(outer);
            }
            for position in target..=index {
                if let Some(id) = scope.node_id_at(position).map(str::to_string) {
                    scope.set_status(&id, NodeStatus::Pending)?;
                }
            }
            scope.context.set_loop_index(round + 1);
            scope.publish_loop(&node.id);

            info!(
                "Loop '{}' starting round {} of {}",
                node.display_name(),
                round + 1,
                config.count
            );
            return Ok(Step::JumpTo(target));
        }

        if let Some(loop_config) = scope.node_mut(&node.id).and_then(Node::loop_config_mut) {
            loop_config.rewind();
        }
        // hand the round back to an enclosing loop
        if let Some(outer) = config.outer_round {
            scope.context.set_loop_index(outer);
        }
        scope.publish_loop(&node.id);
        scope.set_status(&node.id, NodeStatus::Completed)?;

        let farthest = scope
            .graph
            .incoming(&node.id)
            .filter_map(|edge| scope.position_of(&edge.source))
            .max()
            .unwrap_or(index);
        let next = farthest.max(index) + 1;

        info!("Loop '{}' finished after {} rounds", node.display_name(), config.count);
        Ok(Step::JumpTo(next))
    }

    async fn save_to_volume(
        &self,
        scope: &mut RunScope,
        index: usize,
        node: &Node,
        spec: &GenerationSpec,
    ) -> Result<Step, NodeFailure> {
        let context = build_context(&scope.order, index, &scope.graph);
        let messages = self.compose(scope, &node.kind, spec, context.messages);
        let model = self.model_for(spec);

        let text = complete_with_retry(
            self.generator,
            &messages,
            &model,
            &self.config.retry,
            &scope.cancel,
        )
        .await?;
        scope.ensure_active()?;

        let rules = parse_split_rules(&text)?;
        info!("Volume plan produced {} split rules", rules.len());

        if let Some(node) = scope.node_mut(&node.id) {
            if let NodeKind::SaveToVolume(spec) = &mut node.kind {
                spec.split_rules = rules.clone();
            }
        }
        let entries = rules
            .iter()
            .map(|rule| {
                OutputEntry::new(
                    rule.new_group_name.clone(),
                    format!("Starts at: {}", rule.trigger_marker),
                )
            })
            .collect();
        scope.set_outputs(&node.id, entries)?;

        if let Some(first) = rules.first() {
            if self.novel.has_group(&first.new_group_name) {
                scope.context.active_group_anchor = Some(first.new_group_name.clone());
            }
        }
        scope.context.pending_splits.extend(rules);

        scope.set_status(&node.id, NodeStatus::Completed)?;
        Ok(Step::Advance)
    }

    async fn workflow_generator(
        &self,
        scope: &mut RunScope,
        index: usize,
        node: &Node,
        spec: &GenerationSpec,
    ) -> Result<Step, NodeFailure> {
        if scope.graph.len() != 1 {
            return Err(NodeFailure::fatal(
                "workflow generator must be the only node in the workflow",
            ));
        }

        let context = build_context(&scope.order, index, &scope.graph);
        let messages = self.compose(scope, &node.kind, spec, context.messages);
        let model = self.model_for(spec);

        let text = complete_with_retry(
            self.generator,
            &messages,
            &model,
            &self.config.retry,
            &scope.cancel,
        )
        .await?;
        scope.ensure_active()?;

        let mut graph = parse_graph(&text)?;
        validate_graph(&graph).map_err(NodeFailure::Fatal)?;
        graph.reset_all();

        info!(
            "Generated workflow with {} nodes and {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        scope.graph = graph;
        Ok(Step::Halt(Halt::GraphReplaced))
    }

    async fn generate(
        &self,
        scope: &mut RunScope,
        index: usize,
        node: &Node,
        spec: &GenerationSpec,
    ) -> Result<Step, NodeFailure> {
        let context = build_context(&scope.order, index, &scope.graph);
        let messages = self.compose(scope, &node.kind, spec, context.messages);
        let model = self.model_for(spec);
        let target = target_end_index(&interpolate(&spec.instruction, &scope.context.variables));
        if let Some(target) = target {
            debug!("Instruction targets item {}", target);
        }

        let run_state = Arc::clone(scope.run_state());
        let run_id = scope.run_id;
        let generated = generate_entries(
            self.generator,
            messages,
            GenerationRequest {
                config: &model,
                retry: &self.config.retry,
                cancel: &scope.cancel,
                target,
                max_rounds: self.config.max_continuation_rounds,
            },
            move || run_state.is_active(run_id),
        )
        .await?;
        scope.ensure_active()?;

        let entries: Vec<OutputEntry> = generated
            .entries
            .into_iter()
            .filter(|entry| !entry.is_blank())
            .collect();

        let mut outputs = scope
            .node_at(index)
            .map(|n| n.output_entries.clone())
            .unwrap_or_default();
        let appended = merge_output_entries(&mut outputs, entries.clone());
        info!(
            "'{}' produced {} entries ({} new, {} continuations)",
            node.display_name(),
            entries.len(),
            appended,
            generated.continuations
        );
        scope.set_outputs(&node.id, outputs)?;

        if let Some(kind) = node.kind.content_kind() {
            let anchor = scope
                .context
                .active_group_anchor
                .clone()
                .or(context.group_anchor);
            match anchor {
                Some(anchor) => self.file_entries(scope, kind, anchor, &spec.split_rules, &entries),
                None => debug!("No group anchor; {} output stays on the node", kind),
            }
        }

        scope.set_status(&node.id, NodeStatus::Completed)?;
        Ok(Step::Advance)
    }

    /// Files entries into the novel, starting under `anchor`.
    ///
    /// A pending split rule whose marker appears in an entry title moves
    /// that entry and every later one to the rule's group, and is consumed.
    /// The node's own rules redirect the same way but stay in place.
    fn file_entries(
        &self,
        scope: &mut RunScope,
        kind: ContentKind,
        anchor: String,
        node_rules: &[SplitRule],
        entries: &[OutputEntry],
    ) {
        let mut group = anchor;
        let mut buckets: Vec<(String, Vec<OutputEntry>)> = Vec::new();

        for entry in entries {
            let pending = scope
                .context
                .pending_splits
                .iter()
                .position(|rule| rule.matches(&entry.title));

            let redirect = match pending {
                Some(position) => Some(scope.context.pending_splits.remove(position)),
                None => node_rules.iter().find(|rule| rule.matches(&entry.title)).cloned(),
            };

            if let Some(rule) = redirect {
                let name = rule.new_group_name.trim();
                if !name.is_empty() && name != group {
                    info!("'{}' starts group '{}'", entry.title.trim(), name);
                    group = name.to_string();
                }
            }

            let starts_bucket = buckets.last().map_or(true, |(current, _)| *current != group);
            if starts_bucket {
                buckets.push((group.clone(), Vec::new()));
            }
            if let Some((_, items)) = buckets.last_mut() {
                items.push(entry.clone());
            }
        }

        for (name, items) in buckets {
            self.novel.ensure_group(&name);
            let merged = merge_into_set(
                self.novel.content_set(&name, kind),
                &items,
                kind.is_ordered(),
            );
            debug!("Group '{}' now holds {} {} items", name, merged.len(), kind);
            self.novel.replace_content_set(&name, kind, merged);
        }

        scope.context.active_group_anchor = Some(group);
    }

    /// Prompt, context, references, instruction and round instruction, in that order.
    fn compose(
        &self,
        scope: &RunScope,
        kind: &NodeKind,
        spec: &GenerationSpec,
        context: Vec<ChatMessage>,
    ) -> Vec<ChatMessage> {
        let variables = &scope.context.variables;

        let template = match spec.preset_id.as_deref() {
            Some(preset_id) => self.novel.preset(preset_id).unwrap_or_else(|| {
                warn!("Preset '{}' not found; using the built-in prompt", preset_id);
                default_prompt(kind).to_string()
            }),
            None => default_prompt(kind).to_string(),
        };

        let mut messages = vec![ChatMessage::system(interpolate(&template, variables))];
        messages.extend(context);

        let references: Vec<String> = spec
            .references
            .selections()
            .into_iter()
            .filter_map(|(kind, ids)| {
                self.novel
                    .reference_text(kind, ids)
                    .map(|text| format!("[{}]\n{}", kind.heading(), text))
            })
            .collect();
        if !references.is_empty() {
            messages.push(ChatMessage::system(references.join("\n\n")));
        }

        let instruction = interpolate(&spec.instruction, variables);
        if !instruction.trim().is_empty() {
            messages.push(ChatMessage::user(instruction.trim()));
        }

        if let Some(extra) = spec.round_instruction(scope.context.loop_index()) {
            messages.push(ChatMessage::user(interpolate(extra, variables)));
        }

        messages
    }

    fn model_for(&self, spec: &GenerationSpec) -> ModelConfig {
        match &spec.model_override {
            Some(overrides) => overrides.apply(&self.config.model),
            None => self.config.model.clone(),
        }
    }
}

fn default_prompt(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Outline(_) => {
            "You are a novel outlining assistant. Reply with a JSON array of objects \
             with \"title\" and \"content\" fields, one per chapter, each title \
             starting with its chapter number."
        }
        NodeKind::Characters(_) => {
            "You are a character designer for a novel. Reply with a JSON array of \
             objects with \"title\" (the character's name) and \"content\" (a profile)."
        }
        NodeKind::WorldBuilding(_) => {
            "You are a world-building assistant for a novel. Reply with a JSON array \
             of objects with \"title\" and \"content\" fields, one per setting element."
        }
        NodeKind::Inspiration(_) => {
            "You are a creative partner brainstorming a novel. Reply with a JSON array \
             of objects with \"title\" and \"content\" fields, one per idea."
        }
        NodeKind::Chapter(_) => {
            "You are a novelist. Write the requested chapter text in full prose. \
             Follow the outline and keep characters consistent with the context."
        }
        NodeKind::SaveToVolume(_) => {
            "You are planning how a novel is split into volumes. Reply with a JSON \
             array of objects with \"triggerMarker\" (the chapter title that opens \
             the volume) and \"newGroupName\" (the volume name)."
        }
        NodeKind::WorkflowGenerator(_) => {
            "You design writing workflows. Reply with a JSON object with \"nodes\" \
             (each with \"id\", \"typeKey\" and its settings) and \"edges\" (each with \
             \"source\" and \"target\")."
        }
        _ => "You are a helpful co-writer working on a novel.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::novel::{ContentItem, InMemoryNovel};
    use crate::ports::scripted::ScriptedGenerator;
    use crate::ports::sync::{NullSync, SyncPort};
    use crate::execution::run_state::RunState;
    use crate::workflow::model::{
        FolderSpec, LoopConfig, LoopSpec, ReferenceSelection, VariableBinding, WorkflowGraph,
    };

    fn scope_for(nodes: Vec<Node>, edges: &[(&str, &str)]) -> RunScope {
        let mut graph = WorkflowGraph::new();
        let order: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        for node in nodes {
            graph.add_node(node).unwrap();
        }
        for (source, target) in edges {
            graph.connect(*source, *target);
        }

        let run_state = Arc::new(RunState::new());
        let run_id = run_state.start("w", 0, None);
        RunScope::new(
            run_id,
            "w",
            order,
            0,
            graph,
            run_state,
            Arc::new(NullSync) as Arc<dyn SyncPort>,
        )
    }

    fn loop_node(id: &str, count: u32) -> Node {
        Node::new(
            id,
            NodeKind::LoopNode(LoopSpec {
                loop_config: LoopConfig {
                    count,
                    ..LoopConfig::default()
                },
            }),
        )
    }

    fn chapter(id: &str, instruction: &str) -> Node {
        Node::new(id, NodeKind::Chapter(GenerationSpec::new(instruction)))
    }

    #[tokio::test]
    async fn test_create_folder_sets_anchor_once() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let folder = |id: &str| {
            Node::new(
                id,
                NodeKind::CreateFolder(FolderSpec {
                    folder_name: "Volume One".to_string(),
                }),
            )
        };
        let mut scope = scope_for(vec![folder("f1"), folder("f2")], &[]);

        assert_eq!(dispatcher.dispatch(&mut scope, 0).await, Ok(Step::Advance));
        assert_eq!(dispatcher.dispatch(&mut scope, 1).await, Ok(Step::Advance));

        assert_eq!(novel.group_names(), vec!["Volume One".to_string()]);
        assert_eq!(scope.context.active_group_anchor.as_deref(), Some("Volume One"));
        assert_eq!(scope.node_at(1).unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_create_folder_without_name_fails() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let node = Node::new("f", NodeKind::CreateFolder(FolderSpec::default()));
        let mut scope = scope_for(vec![node], &[]);

        assert!(matches!(
            dispatcher.dispatch(&mut scope, 0).await,
            Err(NodeFailure::Fatal(_))
        ));
        assert!(novel.group_names().is_empty());
    }

    #[tokio::test]
    async fn test_reuse_directory_creates_nothing() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let node = Node::new(
            "r",
            NodeKind::ReuseDirectory(FolderSpec {
                folder_name: "Volume Two".to_string(),
            }),
        );
        let mut scope = scope_for(vec![node], &[]);

        assert_eq!(dispatcher.dispatch(&mut scope, 0).await, Ok(Step::Advance));
        assert!(novel.group_names().is_empty());
        assert_eq!(scope.context.active_group_anchor.as_deref(), Some("Volume Two"));
    }

    #[tokio::test]
    async fn test_user_input_binds_variables() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let node = Node::new(
            "in",
            NodeKind::UserInput(UserInputSpec {
                instruction: "Hero: Lin, round {{loop_index}}".to_string(),
                variable_bindings: vec![VariableBinding {
                    name: "hero".to_string(),
                    pattern: Some(r"Hero:\s*(\w+)".to_string()),
                }],
                resolved_instruction: None,
            }),
        );
        let mut scope = scope_for(vec![node], &[]);

        dispatcher.dispatch(&mut scope, 0).await.unwrap();

        assert_eq!(
            scope.context.variable("hero"),
            Some(&serde_json::Value::from("Lin"))
        );
        match &scope.node_at(0).unwrap().kind {
            NodeKind::UserInput(spec) => {
                assert_eq!(spec.resolved_instruction.as_deref(), Some("Hero: Lin, round 1"))
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_node_halts_after_itself() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut scope = scope_for(vec![chapter("a", ""), Node::new("p", NodeKind::PauseNode)], &[]);

        assert_eq!(
            dispatcher.dispatch(&mut scope, 1).await,
            Ok(Step::Halt(Halt::Paused { resume_at: 2 }))
        );
        assert_eq!(scope.node_at(1).unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_loop_jumps_back_then_exits() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut scope = scope_for(
            vec![chapter("a", ""), chapter("b", ""), loop_node("l", 2)],
            &[("a", "b"), ("b", "l"), ("l", "a")],
        );
        scope.force_status("a", NodeStatus::Completed);
        scope.force_status("b", NodeStatus::Completed);

        assert_eq!(dispatcher.dispatch(&mut scope, 2).await, Ok(Step::JumpTo(0)));
        assert_eq!(scope.node_at(0).unwrap().status, NodeStatus::Pending);
        assert_eq!(scope.node_at(1).unwrap().status, NodeStatus::Pending);
        assert_eq!(scope.context.loop_index(), 2);
        assert_eq!(scope.node_at(2).unwrap().loop_config().unwrap().current_index, 1);

        assert_eq!(dispatcher.dispatch(&mut scope, 2).await, Ok(Step::JumpTo(3)));
        assert_eq!(scope.node_at(2).unwrap().status, NodeStatus::Completed);
        assert_eq!(scope.node_at(2).unwrap().loop_config().unwrap().current_index, 0);
        assert_eq!(scope.context.loop_index(), 1);
    }

    #[tokio::test]
    async fn test_inner_loop_restores_outer_round() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut scope = scope_for(
            vec![chapter("a", ""), loop_node("inner", 2)],
            &[("a", "inner"), ("inner", "a")],
        );
        // third round of an enclosing loop
        scope.context.set_loop_index(3);

        assert_eq!(dispatcher.dispatch(&mut scope, 1).await, Ok(Step::JumpTo(0)));
        assert_eq!(scope.context.loop_index(), 2);
        assert_eq!(
            scope.node_at(1).unwrap().loop_config().unwrap().outer_round,
            Some(3)
        );

        assert_eq!(dispatcher.dispatch(&mut scope, 1).await, Ok(Step::JumpTo(2)));
        assert_eq!(scope.context.loop_index(), 3);
        assert_eq!(scope.node_at(1).unwrap().loop_config().unwrap().outer_round, None);
    }

    #[tokio::test]
    async fn test_loop_without_back_edge_passes_through() {
        let generator = ScriptedGenerator::new();
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut scope = scope_for(
            vec![loop_node("l", 3), chapter("after", "")],
            &[("l", "after")],
        );

        assert_eq!(dispatcher.dispatch(&mut scope, 0).await, Ok(Step::Advance));
        assert_eq!(scope.node_at(0).unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_compose_order() {
        let generator = ScriptedGenerator::with_texts(["[{\"title\": \"Chapter 1\", \"content\": \"x\"}]"]);
        let novel = InMemoryNovel::new();
        novel.add_preset("p1", "Write for {{audience}}.");
        novel.replace_content_set(
            "Volume One",
            ContentKind::Characters,
            vec![ContentItem::new("Lin", "a thief")],
        );
        let set_id = novel.set_id("Volume One", ContentKind::Characters).unwrap();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut spec = GenerationSpec::new("Outline for {{audience}}")
            .with_round_instruction(1, "first round")
            .with_references(ReferenceSelection {
                character_set_ids: vec![set_id],
                ..ReferenceSelection::default()
            });
        spec.preset_id = Some("p1".to_string());

        let mut scope = scope_for(vec![Node::new("o", NodeKind::Outline(spec))], &[]);
        scope
            .context
            .set_variable("audience", serde_json::Value::from("teens"));

        dispatcher.dispatch(&mut scope, 0).await.unwrap();

        let request = &generator.requests()[0];
        let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "Write for teens.",
                "[Character reference]\nLin: a thief",
                "Outline for teens",
                "first round",
            ]
        );
    }

    #[tokio::test]
    async fn test_split_rules_redirect_entries() {
        let generator = ScriptedGenerator::with_texts([
            r#"[{"title": "Chapter 10", "content": "end"}, {"title": "Chapter 11", "content": "begin"}, {"title": "Chapter 12", "content": "next"}]"#,
        ]);
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut scope = scope_for(vec![Node::new("o", NodeKind::Outline(GenerationSpec::new("go")))], &[]);
        scope.context.active_group_anchor = Some("Volume One".to_string());
        scope
            .context
            .pending_splits
            .push(SplitRule::new("Chapter 11", "Volume Two"));

        dispatcher.dispatch(&mut scope, 0).await.unwrap();

        let first = novel.content_set("Volume One", ContentKind::Outline);
        let second = novel.content_set("Volume Two", ContentKind::Outline);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].title, "Chapter 11");
        assert!(scope.context.pending_splits.is_empty());
        assert_eq!(scope.context.active_group_anchor.as_deref(), Some("Volume Two"));
        assert_eq!(scope.node_at(0).unwrap().output_entries.len(), 3);
    }

    #[tokio::test]
    async fn test_output_without_anchor_stays_on_node() {
        let generator = ScriptedGenerator::with_texts(["plain prose"]);
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let mut scope = scope_for(vec![chapter("c", "write")], &[]);
        dispatcher.dispatch(&mut scope, 0).await.unwrap();

        assert!(novel.group_names().is_empty());
        let outputs = &scope.node_at(0).unwrap().output_entries;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].content, "plain prose");
    }

    #[tokio::test]
    async fn test_save_to_volume_stores_rules() {
        let generator = ScriptedGenerator::with_texts([
            r#"{"volumes": [{"triggerMarker": "Chapter 1", "newGroupName": "Volume One"}, {"triggerMarker": "Chapter 11", "newGroupName": "Volume Two"}]}"#,
        ]);
        let novel = InMemoryNovel::new();
        novel.ensure_group("Volume One");
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let node = Node::new("plan", NodeKind::SaveToVolume(GenerationSpec::default()));
        let mut scope = scope_for(vec![node], &[]);

        assert_eq!(dispatcher.dispatch(&mut scope, 0).await, Ok(Step::Advance));

        assert_eq!(scope.context.pending_splits.len(), 2);
        assert_eq!(scope.context.active_group_anchor.as_deref(), Some("Volume One"));
        let node = scope.node_at(0).unwrap();
        assert_eq!(node.output_entries.len(), 2);
        assert_eq!(node.kind.generation_spec().unwrap().split_rules.len(), 2);
    }

    #[tokio::test]
    async fn test_workflow_generator_requires_sole_node() {
        let generator = ScriptedGenerator::with_texts(["{}"]);
        let novel = InMemoryNovel::new();
        let config = EngineConfig::immediate();
        let dispatcher = Dispatcher::new(&generator, &novel, &config);

        let node = Node::new("gen", NodeKind::WorkflowGenerator(GenerationSpec::new("plan")));
        let mut scope = scope_for(vec![node, chapter("c", "")], &[]);

        assert!(matches!(
            dispatcher.dispatch(&mut scope, 0).await,
            Err(NodeFailure::Fatal(_))
        ));
        assert_eq!(generator.request_count(), 0);
    }
}
