//! Workflow definition storage.

use crate::definition::{Workflow, WorkflowSummary};
use async_trait::async_trait;
use braid_core::WorkflowId;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Errors from workflow storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No workflow with this id is stored.
    NotFound { workflow_id: WorkflowId },
    /// The backing store failed.
    Backend { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::Backend { message } => write!(f, "workflow store error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Source of workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Loads a workflow by id.
    async fn get(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError>;

    /// Lists stored workflows.
    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError>;
}

/// Workflow store backed by a map. Used by tests and the runner.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
}

impl InMemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a workflow, replacing any previous version with the same id.
    pub async fn insert(&self, mut workflow: Workflow) -> WorkflowId {
        workflow.touch();
        let workflow_id = workflow.id;
        self.workflows.write().await.insert(workflow_id, workflow);
        workflow_id
    }

    /// Removes a workflow. Returns true if it was stored.
    pub async fn remove(&self, workflow_id: WorkflowId) -> bool {
        self.workflows.write().await.remove(&workflow_id).is_some()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn get(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::NotFound { workflow_id })
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .read()
            .await
            .values()
            .map(WorkflowSummary::from)
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_loads_workflows() {
        let store = InMemoryWorkflowStore::new();
        let id = store.insert(Workflow::new("daily digest")).await;

        let loaded = store.get(id).await.expect("stored");
        assert_eq!(loaded.name(), "daily digest");

        let summaries = store.list().await.expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let store = InMemoryWorkflowStore::new();
        let id = WorkflowId::new();
        assert_eq!(
            store.get(id).await,
            Err(StoreError::NotFound { workflow_id: id })
        );
        assert!(!store.remove(id).await);
    }

    #[tokio::test]
    async fn insert_replaces_by_id() {
        let store = InMemoryWorkflowStore::new();
        let id = WorkflowId::new();
        store.insert(Workflow::with_id(id, "v1")).await;
        store.insert(Workflow::with_id(id, "v2")).await;
        assert_eq!(store.get(id).await.expect("stored").name(), "v2");
        assert_eq!(store.list().await.expect("list").len(), 1);
    }
}
