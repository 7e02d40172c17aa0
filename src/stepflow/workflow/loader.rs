//! Workflow loader - YAML file loading and parsing
//!
//! This module handles loading graph definitions from YAML files and
//! exporting the JSON Schema of the format.

use schemars::schema::RootSchema;
use std::fs;
use std::path::Path;

use super::types::GraphDefinition;
use crate::adk::error::StepflowError;

/// Loads graph definitions from YAML files
pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a graph definition from a YAML file
    pub fn load_workflow<P: AsRef<Path>>(&self, path: P) -> Result<GraphDefinition, StepflowError> {
        let content = fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded graph file {}", path.as_ref().display());
        Self::parse_yaml(&content)
    }

    /// Parse a graph definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<GraphDefinition, StepflowError> {
        let def: GraphDefinition = serde_yaml::from_str(content)?;
        Ok(def)
    }

    /// JSON Schema describing the graph file format
    pub fn schema() -> RootSchema {
        schemars::schema_for!(GraphDefinition)
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stepflow::workflow::types::NodeKind;
    use std::io::Write;

    const PIPELINE: &str = r#"
name: pipeline
description: "Analyze, optionally decompose, then coordinate"
entry: Analyze

engine:
  max_steps: 20
  retry:
    max_attempts: 3

state:
  complexity:
    type: string
  notes:
    type: array
    reducer: append

nodes:
  - name: Analyze
    handler: analyzer
    inputs: [taskText]
    outputs: [complexity]
  - name: Coordinator
    kind: coordinator
    coordinator:
      workers: [echo]
      policy: best_effort
  - name: Done
    handler: finalizer

edges:
  - from: Analyze
    to: Coordinator
    when: "complexity == 'low'"
  - from: Coordinator
    to: Done
"#;

    #[test]
    fn test_parse_graph_definition() {
        let def = WorkflowLoader::parse_yaml(PIPELINE).unwrap();
        assert_eq!(def.name, "pipeline");
        assert_eq!(def.entry, "Analyze");
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.nodes[1].kind, NodeKind::Coordinator);
        assert_eq!(def.edges.len(), 2);
        assert_eq!(def.engine.max_steps, 20);
        assert_eq!(def.engine.max_concurrent_invocations, 16);
        assert_eq!(def.state.fields.len(), 2);
        assert!(def.interrupt_before.is_empty());
    }

    #[test]
    fn test_missing_entry_is_rejected() {
        let yaml = "name: broken\nnodes: []\n";
        assert!(matches!(
            WorkflowLoader::parse_yaml(yaml),
            Err(StepflowError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PIPELINE.as_bytes()).unwrap();

        let def = WorkflowLoader::new().load_workflow(file.path()).unwrap();
        assert_eq!(def.name, "pipeline");

        assert!(matches!(
            WorkflowLoader::new().load_workflow("/nonexistent/graph.yaml"),
            Err(StepflowError::Io(_))
        ));
    }

    #[test]
    fn test_schema_export() {
        let schema = serde_json::to_value(WorkflowLoader::schema()).unwrap();
        assert_eq!(schema["title"], "GraphDefinition");
        assert!(schema["properties"]["nodes"].is_object());
        assert!(schema["definitions"]["PartialFailurePolicy"].is_object());
    }
}
