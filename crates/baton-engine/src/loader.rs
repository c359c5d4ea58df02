//! Sub-workflow loader contract and the filesystem implementation.
//!
//! Child paths resolve relative to the parent workflow's directory and
//! must stay inside it: absolute paths and `..` components are rejected
//! before touching the filesystem.

use std::path::{Component, Path};

use baton_types::workflow::WorkflowDefinition;

use crate::definition::{DefinitionError, load_workflow_file};

/// Errors from sub-workflow loading.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("sub-workflow path '{0}' escapes the parent directory")]
    PathEscape(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Contract for loading child workflow definitions.
pub trait SubworkflowLoader: Send + Sync {
    fn load(&self, parent_dir: &Path, path: &str) -> Result<WorkflowDefinition, LoaderError>;
}

/// Loads child definitions from YAML files under the parent directory.
#[derive(Debug, Default)]
pub struct FsSubworkflowLoader;

impl SubworkflowLoader for FsSubworkflowLoader {
    fn load(&self, parent_dir: &Path, path: &str) -> Result<WorkflowDefinition, LoaderError> {
        let relative = Path::new(path);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir));
        if escapes {
            return Err(LoaderError::PathEscape(path.to_string()));
        }
        Ok(load_workflow_file(&parent_dir.join(relative))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::save_workflow_file;
    use baton_types::workflow::{StepConfig, StepDefinition};

    fn child_definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: None,
            inputs: vec![],
            agents: Default::default(),
            steps: vec![StepDefinition {
                id: "only".to_string(),
                condition: None,
                timeout: None,
                retry: None,
                on_error: None,
                max_tokens: None,
                max_cost: None,
                permissions: None,
                config: StepConfig::Llm {
                    prompt: "hello".to_string(),
                    system: None,
                    model: None,
                    tools: vec![],
                    output_schema: None,
                },
            }],
            outputs: vec![],
            limits: None,
        }
    }

    #[test]
    fn loads_relative_child() {
        let dir = tempfile::tempdir().unwrap();
        save_workflow_file(&dir.path().join("sub/child.yaml"), &child_definition("child"))
            .unwrap();

        let loaded = FsSubworkflowLoader
            .load(dir.path(), "sub/child.yaml")
            .unwrap();
        assert_eq!(loaded.name, "child");
    }

    #[test]
    fn rejects_parent_dir_escape() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsSubworkflowLoader
            .load(dir.path(), "../outside.yaml")
            .unwrap_err();
        assert!(matches!(err, LoaderError::PathEscape(_)));
    }

    #[test]
    fn rejects_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsSubworkflowLoader
            .load(dir.path(), "/etc/workflow.yaml")
            .unwrap_err();
        assert!(matches!(err, LoaderError::PathEscape(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsSubworkflowLoader
            .load(dir.path(), "nope.yaml")
            .unwrap_err();
        assert!(matches!(err, LoaderError::Definition(DefinitionError::Io(_))));
    }
}
