// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow template loading.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::role::Role;

/// Workflow loading errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// No template under this reference.
    #[error("workflow template not found: {0}")]
    NotFound(String),
    /// Template could not be read.
    #[error("failed to read workflow template {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Template is not valid JSON for a role tree.
    #[error("failed to parse workflow template {reference}: {source}")]
    Parse {
        /// Template reference.
        reference: String,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Template parsed but is structurally invalid.
    #[error("invalid workflow template {reference}: {reason}")]
    Invalid {
        /// Template reference.
        reference: String,
        /// What is wrong.
        reason: String,
    },
}

/// Source of role trees.
#[async_trait]
pub trait WorkflowLoader: Send + Sync {
    /// Load and finalize the role tree for `reference`. `vars` are the
    /// request's root-level variables; loaders may use them to select
    /// template variants.
    async fn load(
        &self,
        reference: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<Role, WorkflowError>;
}

/// Reads `<dir>/<reference>.json`.
#[derive(Debug, Clone)]
pub struct JsonWorkflowLoader {
    dir: PathBuf,
}

impl JsonWorkflowLoader {
    /// Loader rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf, WorkflowError> {
        let valid = !reference.is_empty()
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
            && !reference.split('/').any(|part| part == ".." || part.is_empty());
        if !valid {
            return Err(WorkflowError::Invalid {
                reference: reference.to_string(),
                reason: "reference must be a relative template name".into(),
            });
        }
        Ok(self.dir.join(format!("{reference}.json")))
    }
}

#[async_trait]
impl WorkflowLoader for JsonWorkflowLoader {
    async fn load(
        &self,
        reference: &str,
        _vars: &BTreeMap<String, String>,
    ) -> Result<Role, WorkflowError> {
        let path = self.path_for(reference)?;
        debug!(reference = %reference, path = %path.display(), "loading workflow template");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkflowError::NotFound(reference.to_string()));
            }
            Err(source) => return Err(WorkflowError::Io { path, source }),
        };
        let role: Role = serde_json::from_str(&raw).map_err(|source| WorkflowError::Parse {
            reference: reference.to_string(),
            source,
        })?;
        validate(reference, &role)?;
        Ok(role.finalize())
    }
}

/// Serves role trees registered in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkflowLoader {
    workflows: HashMap<String, Role>,
}

impl StaticWorkflowLoader {
    /// Empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tree under `reference`.
    pub fn with_workflow(mut self, reference: impl Into<String>, role: Role) -> Self {
        self.workflows.insert(reference.into(), role);
        self
    }
}

#[async_trait]
impl WorkflowLoader for StaticWorkflowLoader {
    async fn load(
        &self,
        reference: &str,
        _vars: &BTreeMap<String, String>,
    ) -> Result<Role, WorkflowError> {
        let role = self
            .workflows
            .get(reference)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(reference.to_string()))?;
        validate(reference, &role)?;
        Ok(role.finalize())
    }
}

/// Role names must be non-empty, free of path separators and unique among siblings.
fn validate(reference: &str, role: &Role) -> Result<(), WorkflowError> {
    let invalid = |reason: String| WorkflowError::Invalid {
        reference: reference.to_string(),
        reason,
    };
    for node in role.walk() {
        if node.name().is_empty() || node.name().contains(super::role::PATH_SEPARATOR) {
            return Err(invalid(format!("invalid role name '{}'", node.name())));
        }
        let mut seen = BTreeSet::new();
        for child in node.children() {
            if !seen.insert(child.name()) {
                return Err(invalid(format!(
                    "duplicate role name '{}' under '{}'",
                    child.name(),
                    node.name()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{TaskClass, TaskRole};

    const TEMPLATE: &str = r#"{
        "name": "readout-dataflow",
        "roles": [
            {"name": "readout", "task": {"class": {"name": "readout", "command": "o2-readout-exe", "cpu": 0.5, "memory": 256}}}
        ]
    }"#;

    #[tokio::test]
    async fn test_json_loader_reads_template() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("readout-dataflow.json"), TEMPLATE)
            .await
            .unwrap();

        let loader = JsonWorkflowLoader::new(dir.path());
        let role = loader
            .load("readout-dataflow", &BTreeMap::new())
            .await
            .unwrap();
        assert!(role.find("readout-dataflow.readout").is_some());
    }

    #[tokio::test]
    async fn test_json_loader_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let loader = JsonWorkflowLoader::new(dir.path());
        let err = loader.load("nope", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(r) if r == "nope"));
    }

    #[tokio::test]
    async fn test_json_loader_rejects_traversal() {
        let loader = JsonWorkflowLoader::new("/tmp");
        let err = loader
            .load("../etc/passwd", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_json_loader_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("broken.json"), "{ not json")
            .await
            .unwrap();
        let loader = JsonWorkflowLoader::new(dir.path());
        let err = loader.load("broken", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_static_loader_rejects_duplicate_siblings() {
        let class = TaskClass::new("c", "/bin/true");
        let role = Role::aggregator(
            "root",
            vec![
                Role::task("a", TaskRole::new(class.clone())),
                Role::task("a", TaskRole::new(class)),
            ],
        );
        let loader = StaticWorkflowLoader::new().with_workflow("dup", role);
        let err = loader.load("dup", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid { .. }));
    }
}
