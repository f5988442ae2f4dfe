//! Workflow Parser
//!
//! Handles loading and saving workflow definitions. Files ending in
//! `.json` are read as JSON, anything else as YAML.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDocument;
use super::validator::validate_graph;

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("json"))
}

/// Loads a workflow from a YAML or JSON file.
///
/// This function:
/// 1. Reads and parses the file
/// 2. Defaults the workflow ID to the file stem
/// 3. Validates the graph structure
///
/// # Arguments
///
/// * `path` - Path to the workflow file
///
/// # Returns
///
/// * `Ok(WorkflowDocument)` - Successfully loaded and validated workflow
/// * `Err` - Read, parse or validation error
///
/// # Example
///
/// ```rust,no_run
/// use novelflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_workflow("novel.yaml")?;
///     println!("Loaded {} nodes", document.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: &str) -> Result<WorkflowDocument, Box<dyn Error>> {
    info!("Loading workflow from: {}", path);
    let file_path = Path::new(path);

    let content = fs::read_to_string(file_path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let mut document: WorkflowDocument = if is_json(file_path) {
        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse workflow JSON: {}. Check the file format.", e))?
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| format!("Failed to parse workflow YAML: {}. Check the file format.", e))?
    };

    if document.id.trim().is_empty() {
        document.id = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    info!(
        "Parsed workflow '{}': {} nodes, {} edges",
        document.id,
        document.nodes.len(),
        document.edges.len()
    );

    let name = std::mem::take(&mut document.name);
    let (id, graph) = document.into_parts();
    validate_graph(&graph)?;

    Ok(WorkflowDocument {
        id,
        name,
        nodes: graph.nodes,
        edges: graph.edges,
    })
}

/// Saves a workflow to a YAML or JSON file.
///
/// # Arguments
///
/// * `document` - The workflow to save
/// * `path` - Output file path
pub fn save_workflow(document: &WorkflowDocument, path: &str) -> Result<(), Box<dyn Error>> {
    let content = if is_json(Path::new(path)) {
        serde_json::to_string_pretty(document)?
    } else {
        serde_yaml::to_string(document)?
    };
    fs::write(path, content)?;
    info!("Workflow saved to: {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{GenerationSpec, Node, NodeKind};
    use tempfile::tempdir;

    const NOVEL_YAML: &str = r#"
name: First Volume
nodes:
  - id: folder
    typeKey: createFolder
    folderName: Volume One
    position: { x: 0, y: 0 }
  - id: outline
    typeKey: outline
    instruction: Generate 10 chapters of outline
    position: { x: 0, y: 100 }
  - id: loop
    typeKey: loopNode
    loopConfig: { count: 3 }
    position: { x: 0, y: 200 }
edges:
  - { id: e1, source: folder, target: outline }
  - { id: e2, source: outline, target: loop }
"#;

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_workflow_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("volume_one.yaml");
        fs::write(&workflow_path, NOVEL_YAML).unwrap();

        let document = load_workflow(workflow_path.to_str().unwrap()).unwrap();

        assert_eq!(document.id, "volume_one");
        assert_eq!(document.nodes.len(), 3);
        assert_eq!(document.edges.len(), 2);
        assert_eq!(document.nodes[2].loop_config().unwrap().count, 3);
    }

    #[test]
    fn test_load_workflow_json() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("plan.json");
        fs::write(
            &workflow_path,
            r#"{"id": "plan", "nodes": [{"id": "p", "typeKey": "pauseNode"}], "edges": []}"#,
        )
        .unwrap();

        let document = load_workflow(workflow_path.to_str().unwrap()).unwrap();
        assert_eq!(document.id, "plan");
        assert_eq!(document.nodes[0].kind, NodeKind::PauseNode);
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("bad.yaml");
        fs::write(&workflow_path, "this is not valid yaml: [[[").unwrap();

        assert!(load_workflow(workflow_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_load_workflow_fails_validation() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("empty.yaml");
        fs::write(&workflow_path, "nodes: []\nedges: []\n").unwrap();

        let err = load_workflow(workflow_path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no nodes"));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("saved.yaml");

        let document = WorkflowDocument {
            id: "saved".to_string(),
            name: String::new(),
            nodes: vec![Node::new("c", NodeKind::Chapter(GenerationSpec::new("Write")))],
            edges: Vec::new(),
        };

        save_workflow(&document, workflow_path.to_str().unwrap()).unwrap();
        assert!(workflow_path.exists());

        let reloaded = load_workflow(workflow_path.to_str().unwrap()).unwrap();
        assert_eq!(reloaded.nodes[0].kind, document.nodes[0].kind);
    }
}
