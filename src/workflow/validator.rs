//! Workflow Validation
//!
//! Checks a workflow graph before it is run:
//! - Node identity (non-empty, unique IDs)
//! - Loop configuration
//! - Edge reference integrity (warned, edges to missing nodes are ignored)
//! - Grouping and generation node configuration (warned)

use std::collections::HashSet;

use log::{debug, info, warn};
use thiserror::Error;

use super::model::{Node, NodeKind, WorkflowGraph};

/// Problems found in a workflow graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Workflow has no nodes")]
    EmptyWorkflow,

    #[error("Duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("Node has empty or whitespace-only ID")]
    EmptyNodeId,

    #[error("Loop node '{0}' must repeat at least once")]
    InvalidLoopCount(String),

    #[error("Edge '{edge}' references unknown node '{node}'")]
    DanglingEdge { edge: String, node: String },

    #[error("Node '{0}' has no folder name")]
    EmptyFolderName(String),

    #[error("Node '{0}' has no instruction")]
    EmptyInstruction(String),
}

/// Validates a single node's fields.
fn validate_node(node: &Node) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.id.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors;
    }

    if let NodeKind::LoopNode(spec) = &node.kind {
        if spec.loop_config.count == 0 {
            errors.push(ValidationError::InvalidLoopCount(node.id.clone()));
        }
        if !spec.loop_config.enabled {
            debug!("Loop node '{}' is disabled and will not repeat", node.id);
        }
    }

    errors
}

/// Validates the whole graph.
///
/// Performs the following checks:
/// 1. Graph is not empty
/// 2. Every node has a non-empty, unique ID
/// 3. Loop nodes repeat at least once
///
/// Recoverable problems reported by [`quick_validate`] are logged as
/// warnings and do not fail validation.
pub fn validate_graph(graph: &WorkflowGraph) -> Result<(), String> {
    info!(
        "Validating workflow with {} nodes and {} edges",
        graph.nodes.len(),
        graph.edges.len()
    );

    if graph.is_empty() {
        return Err(ValidationError::EmptyWorkflow.to_string());
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for node in &graph.nodes {
        errors.extend(validate_node(node));

        if !node.id.trim().is_empty() && !seen_ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(messages.join("\n"));
    }

    for warning in quick_validate(graph) {
        warn!("{}", warning);
    }

    info!("Workflow validation passed");
    Ok(())
}

/// Returns recoverable problems as human-readable warnings.
pub fn quick_validate(graph: &WorkflowGraph) -> Vec<String> {
    let ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut warnings = Vec::new();

    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                warnings.push(
                    ValidationError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    }
                    .to_string(),
                );
            }
        }
    }

    for node in &graph.nodes {
        match &node.kind {
            NodeKind::CreateFolder(spec) | NodeKind::ReuseDirectory(spec)
                if spec.folder_name.trim().is_empty() =>
            {
                warnings.push(ValidationError::EmptyFolderName(node.id.clone()).to_string());
            }
            kind => {
                let blank = kind
                    .generation_spec()
                    .map_or(false, |spec| spec.instruction.trim().is_empty());
                // planning nodes rely on their preset alone
                if blank && !matches!(kind, NodeKind::SaveToVolume(_) | NodeKind::AiChat(_)) {
                    warnings.push(ValidationError::EmptyInstruction(node.id.clone()).to_string());
                }
            }
        }
    }

    warnings
}
