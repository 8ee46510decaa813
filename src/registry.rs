use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::models::{TaskKind, TaskRecord, TaskResult, TaskStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Task not found: {0}")]
    NotFound(String),
}

/// In-memory task map shared between handlers and background routines.
///
/// Every task has exactly one background writer, so the lock only has to make
/// individual map accesses atomic; it is never held across an await point
/// outside this type.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, kind: TaskKind) -> String {
        let task_id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(task_id.clone(), kind, Utc::now());
        self.tasks.write().await.insert(task_id.clone(), record);
        task_id
    }

    pub async fn get(&self, task_id: &str) -> Result<TaskRecord, RegistryError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))
    }

    pub async fn update<F>(&self, task_id: &str, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return Err(RegistryError::NotFound(task_id.to_string()));
        };
        mutate(task);
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Moves a processing task forward. Values below the current progress are
    /// clamped so pollers never observe a regression.
    pub async fn set_progress(
        &self,
        task_id: &str,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let message = message.into();
        self.update(task_id, |task| {
            if task.status != TaskStatus::Processing {
                return;
            }
            task.progress = task.progress.max(progress.min(99));
            task.message = message.clone();
        })
        .await?;

        info!(task_id = %task_id, progress, message = %message, "Task progress update");
        Ok(())
    }

    pub async fn set_iteration(&self, task_id: &str, iteration: u32) -> Result<(), RegistryError> {
        self.update(task_id, |task| task.iteration = Some(iteration))
            .await
    }

    pub async fn complete(
        &self,
        task_id: &str,
        message: impl Into<String>,
        result: TaskResult,
    ) -> Result<(), RegistryError> {
        let message = message.into();
        self.update(task_id, |task| {
            task.status = TaskStatus::Completed;
            task.progress = 100;
            task.message = message;
            task.result = Some(result);
            task.error = None;
        })
        .await
    }

    pub async fn fail(
        &self,
        task_id: &str,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let message = message.into();
        let error = error.into();
        self.update(task_id, |task| {
            task.status = TaskStatus::Error;
            task.message = message;
            task.error = Some(error);
            task.result = None;
        })
        .await
    }

    /// Drops finished records older than `ttl`. Processing records stay until
    /// their routine finishes, whatever their age.
    pub async fn evict_expired(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> usize {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::weeks(52 * 100));
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_terminal() && now - task.created_at > ttl));
        before - tasks.len()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample_result() -> TaskResult {
        TaskResult {
            html: "<p>Hi</p>".into(),
            download_url: "/download/x/ui-bundle.zip".into(),
            files: vec!["index.html".into()],
            frame_count: None,
            duration_seconds: None,
            iterations: None,
            matched: None,
        }
    }

    #[tokio::test]
    async fn created_task_is_retrievable() {
        let registry = TaskRegistry::new();
        let id = registry.create(TaskKind::Image).await;
        let task = registry.get(&id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.progress, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let registry = TaskRegistry::new();
        assert_eq!(
            registry.get("missing").await.unwrap_err(),
            RegistryError::NotFound("missing".into())
        );
        assert!(registry.update("missing", |_| {}).await.is_err());
        assert!(registry.set_progress("missing", 10, "x").await.is_err());
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let registry = TaskRegistry::new();
        let id = registry.create(TaskKind::Video).await;

        let mut observed = Vec::new();
        for step in [10, 40, 25, 60, 60, 5, 90] {
            registry.set_progress(&id, step, "step").await.expect("update");
            observed.push(registry.get(&id).await.expect("task").progress);
        }

        assert_eq!(observed, vec![10, 40, 40, 60, 60, 60, 90]);
    }

    #[tokio::test]
    async fn progress_updates_ignored_after_completion() {
        let registry = TaskRegistry::new();
        let id = registry.create(TaskKind::Image).await;
        registry
            .complete(&id, "done", sample_result())
            .await
            .expect("complete");
        registry.set_progress(&id, 50, "late").await.expect("update");

        let task = registry.get(&id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.message, "done");
    }

    #[tokio::test]
    async fn eviction_only_touches_old_terminal_records() {
        let registry = TaskRegistry::new();
        let running = registry.create(TaskKind::Image).await;
        let finished = registry.create(TaskKind::Image).await;
        let failed = registry.create(TaskKind::Image).await;
        registry
            .complete(&finished, "done", sample_result())
            .await
            .expect("complete");
        registry.fail(&failed, "failed", "boom").await.expect("fail");

        let soon = Utc::now();
        assert_eq!(registry.evict_expired(Duration::from_secs(3600), soon).await, 0);

        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(registry.evict_expired(Duration::from_secs(3600), later).await, 2);
        assert!(registry.get(&running).await.is_ok());
        assert!(registry.get(&finished).await.is_err());
        assert_eq!(registry.len().await, 1);
    }
}
