//! Workflow documents on disk and the sub-workflow library built from them.
//!
//! A document holds either a single workflow or several under a `workflows` key. Every
//! workflow in a document is callable from the others through `workflow` actions.

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde::Deserialize;
use stepflow_types::WorkflowDefinition;

use crate::executor::WorkflowLibrary;

/// Identifier used when a single-workflow document omits `workflow`.
const DEFAULT_WORKFLOW_ID: &str = "default";

/// Workflows parsed from one document, keyed by the name they were declared under.
#[derive(Debug, Clone, Default)]
pub struct WorkflowBundle {
    pub workflows: IndexMap<String, WorkflowDefinition>,
}

impl WorkflowBundle {
    /// Looks a workflow up by declaration key or by its `workflow` identifier.
    pub fn get(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.workflows
            .get(id)
            .or_else(|| self.workflows.values().find(|definition| definition.workflow == id))
    }

    /// First declared workflow.
    pub fn first(&self) -> Option<&WorkflowDefinition> {
        self.workflows.values().next()
    }

    /// Builds the sub-workflow library keyed by `workflow` identifier.
    pub fn library(&self) -> Result<WorkflowLibrary> {
        build_library(self.workflows.values())
    }
}

/// Builds an ordered library of workflows keyed by identifier.
pub fn build_library<'a>(definitions: impl IntoIterator<Item = &'a WorkflowDefinition>) -> Result<WorkflowLibrary> {
    let mut library = WorkflowLibrary::new();
    for definition in definitions {
        let identifier = definition.workflow.trim();
        if identifier.is_empty() {
            bail!("workflow definition is missing the required 'workflow' identifier");
        }
        if library.contains_key(identifier) {
            bail!("duplicate workflow identifier detected: '{identifier}'");
        }
        library.insert(identifier.to_string(), Arc::new(definition.clone()));
    }
    Ok(library)
}

/// Loads a workflow file. YAML is a superset of JSON, so both formats are accepted.
///
/// # Examples
///
/// ```rust
/// use stepflow_engine::parse_workflow_file;
///
/// let temp_dir = tempfile::tempdir()?;
/// let workflow_path = temp_dir.path().join("smoke.yaml");
/// std::fs::write(&workflow_path, r#"
/// workflow: "smoke-test"
/// steps: []
/// "#)?;
///
/// let workflow_bundle = parse_workflow_file(&workflow_path)?;
/// println!("Loaded {} workflows", workflow_bundle.workflows.len());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn parse_workflow_file(file_path: impl AsRef<Path>) -> Result<WorkflowBundle> {
    let file_path = file_path.as_ref();
    let file_content = fs::read(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path.display()))?;
    parse_workflow_document(&String::from_utf8_lossy(&file_content))
        .with_context(|| format!("Failed to parse workflow file: {}", file_path.display()))
}

/// Parses workflow document text.
pub fn parse_workflow_document(content: &str) -> Result<WorkflowBundle> {
    // Multi-workflow documents are tried first so they are not accepted as a single
    // workflow with ignored fields.
    #[derive(Deserialize)]
    struct MultiWorkflowDocument {
        workflows: IndexMap<String, WorkflowDefinition>,
    }

    if let Ok(document) = serde_yaml::from_str::<MultiWorkflowDocument>(content) {
        let workflows = document
            .workflows
            .into_iter()
            .map(|(key, mut definition)| {
                if definition.workflow.trim().is_empty() {
                    definition.workflow = key.clone();
                }
                (key, definition)
            })
            .collect();
        return Ok(WorkflowBundle { workflows });
    }

    match serde_yaml::from_str::<WorkflowDefinition>(content) {
        Ok(mut definition) => {
            if definition.workflow.trim().is_empty() {
                definition.workflow = DEFAULT_WORKFLOW_ID.to_string();
            }
            let mut workflows = IndexMap::new();
            workflows.insert(definition.workflow.clone(), definition);
            Ok(WorkflowBundle { workflows })
        }
        Err(error) => bail!(
            "Unsupported workflow document format ({error}). Expected one of:\n\
             - Single workflow with 'workflow', 'inputs', 'variables', and 'steps' fields\n\
             - Multi-workflow document with workflows under 'workflows' key"
        ),
    }
}
