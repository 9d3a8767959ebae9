//! Persistence boundary: an opaque async key/value store and the workflow
//! library built on top of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::errors::AutomationError;
use crate::executor::RunOutcome;
use crate::model::{now_millis, Workflow, WorkflowStatus};

pub const CURRENT_WORKFLOW_KEY: &str = "currentWorkflow";
pub const SAVED_WORKFLOWS_KEY: &str = "savedWorkflows";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, AutomationError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), AutomationError>;

    async fn remove(&self, key: &str) -> Result<(), AutomationError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, AutomationError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AutomationError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AutomationError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AutomationError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AutomationError::Storage(format!("invalid key `{key}`")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, AutomationError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AutomationError::Storage(format!("read {}: {e}", path.display()))),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AutomationError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        // Each write gets its own temp file so concurrent writers never rename
        // each other's file away.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let written = match tokio::fs::write(&tmp, serde_json::to_vec_pretty(&value)?).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(key, path = %path.display(), "stored value");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AutomationError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The open workflow plus the list of saved ones.
#[derive(Clone)]
pub struct WorkflowLibrary {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl WorkflowLibrary {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// The workflow currently being recorded.
    pub async fn current(&self) -> Result<Option<Workflow>, AutomationError> {
        match self.store.get(CURRENT_WORKFLOW_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn save_current(&self, workflow: &Workflow) -> Result<(), AutomationError> {
        self.store
            .set(CURRENT_WORKFLOW_KEY, serde_json::to_value(workflow)?)
            .await
    }

    pub async fn clear_current(&self) -> Result<(), AutomationError> {
        self.store.remove(CURRENT_WORKFLOW_KEY).await
    }

    pub async fn saved(&self) -> Result<Vec<Workflow>, AutomationError> {
        match self.store.get(SAVED_WORKFLOWS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_saved(&self, workflows: &[Workflow]) -> Result<(), AutomationError> {
        self.store
            .set(SAVED_WORKFLOWS_KEY, serde_json::to_value(workflows)?)
            .await
    }

    pub async fn find(&self, id: &str) -> Result<Option<Workflow>, AutomationError> {
        Ok(self.saved().await?.into_iter().find(|w| w.id == id))
    }

    /// Inserts `workflow`, replacing any saved workflow with the same id.
    pub async fn save(&self, workflow: &Workflow) -> Result<(), AutomationError> {
        let _guard = self.write_lock.lock().await;
        let mut saved = self.saved().await?;
        match saved.iter_mut().find(|w| w.id == workflow.id) {
            Some(existing) => *existing = workflow.clone(),
            None => saved.push(workflow.clone()),
        }
        self.write_saved(&saved).await?;
        info!(id = %workflow.id, name = %workflow.name, steps = workflow.steps.len(), "Saved workflow");
        Ok(())
    }

    /// Removes a saved workflow. Returns whether one was found.
    pub async fn delete(&self, id: &str) -> Result<bool, AutomationError> {
        let _guard = self.write_lock.lock().await;
        let mut saved = self.saved().await?;
        let before = saved.len();
        saved.retain(|w| w.id != id);
        if saved.len() == before {
            return Ok(false);
        }
        self.write_saved(&saved).await?;
        info!(id, "Deleted workflow");
        Ok(true)
    }

    /// Updates the run bookkeeping of a saved workflow.
    pub async fn record_run(
        &self,
        id: &str,
        outcome: RunOutcome,
        error_count: usize,
    ) -> Result<Option<Workflow>, AutomationError> {
        let _guard = self.write_lock.lock().await;
        let mut saved = self.saved().await?;
        let Some(workflow) = saved.iter_mut().find(|w| w.id == id) else {
            return Ok(None);
        };
        let now = now_millis();
        workflow.last_run = Some(now);
        match outcome {
            RunOutcome::Cancelled => {}
            RunOutcome::Completed if error_count == 0 => {
                workflow.success_count += 1;
                workflow.status = Some(WorkflowStatus::Completed);
                workflow.updated_at = now;
            }
            _ => {
                workflow.failure_count += 1;
                workflow.status = Some(WorkflowStatus::Failed);
                workflow.updated_at = now;
            }
        }
        let updated = workflow.clone();
        self.write_saved(&saved).await?;
        Ok(Some(updated))
    }
}
