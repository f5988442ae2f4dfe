//! Context Building
//!
//! Derives what a node sees of the nodes before it. Each predecessor in
//! execution order contributes from its live state:
//! - grouping nodes set the group anchor (the most recent wins)
//! - user-input nodes add a user message with their resolved instruction
//! - nodes with output add one system message under a fixed heading
//!
//! Skipped predecessors contribute nothing.

use log::debug;

use crate::ports::generation::ChatMessage;
use crate::workflow::model::{Node, NodeKind, WorkflowGraph};

/// Messages and group anchor visible to a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltContext {
    pub messages: Vec<ChatMessage>,
    pub group_anchor: Option<String>,
}

/// Builds the context for the node at order position `upto`.
pub fn build_context(order: &[String], upto: usize, graph: &WorkflowGraph) -> BuiltContext {
    let mut context = BuiltContext::default();

    for id in order.iter().take(upto) {
        let Some(node) = graph.node(id) else {
            continue;
        };
        if node.skipped {
            continue;
        }

        if let Some(name) = node.kind.group_name() {
            context.group_anchor = Some(name.to_string());
        }

        if let NodeKind::UserInput(spec) = &node.kind {
            let text = spec
                .resolved_instruction
                .as_deref()
                .unwrap_or(&spec.instruction);
            if !text.trim().is_empty() {
                context.messages.push(ChatMessage::user(text.trim()));
            }
        }

        if let Some(body) = render_outputs(node) {
            context.messages.push(ChatMessage::system(format!(
                "[{}]\n{}",
                node.kind.context_label(),
                body
            )));
        }
    }

    debug!(
        "Built context for position {}: {} messages, anchor {:?}",
        upto,
        context.messages.len(),
        context.group_anchor
    );
    context
}

fn render_outputs(node: &Node) -> Option<String> {
    let set_like = node.kind.is_set_like();

    let parts: Vec<String> = node
        .output_entries
        .iter()
        .filter(|e| !e.is_blank())
        .map(|entry| {
            let title = entry.title.trim();
            let content = entry.content.trim();
            if set_like && !title.is_empty() {
                if content.is_empty() {
                    title.to_string()
                } else {
                    format!("{}: {}", title, content)
                }
            } else if content.is_empty() {
                title.to_string()
            } else {
                content.to_string()
            }
        })
        .collect();

    if parts.is_empty() {
        return None;
    }

    let separator = if set_like { "\n" } else { "\n\n" };
    Some(parts.join(separator))
}
