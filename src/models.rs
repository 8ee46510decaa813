use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Image,
    Video,
    Refine,
}

impl TaskKind {
    /// Baseline run time the remaining-time estimate assumes before real
    /// progress data is available.
    pub fn base_duration_seconds(&self) -> f64 {
        match self {
            Self::Image => 30.0,
            Self::Video => 120.0,
            Self::Refine => 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub html: String,
    pub download_url: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub iteration: Option<u32>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn new(task_id: String, kind: TaskKind, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            kind,
            status: TaskStatus::Processing,
            progress: 0,
            message: "Task accepted".to_string(),
            created_at: now,
            updated_at: now,
            iteration: None,
            result: None,
            error: None,
        }
    }

    pub fn to_response(&self, now: DateTime<Utc>) -> TaskStatusResponse {
        let estimated_remaining_seconds = match self.status {
            TaskStatus::Processing => Some(self.estimate_remaining_seconds(now)),
            _ => None,
        };
        let result = match self.status {
            TaskStatus::Completed => self.result.clone(),
            _ => None,
        };

        TaskStatusResponse {
            task_id: self.task_id.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            kind: self.kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
            iteration: self.iteration,
            estimated_remaining_seconds,
            result,
            error: self.error.clone(),
        }
    }

    /// Linear extrapolation of elapsed time over reported progress, never
    /// shorter than the kind's base duration.
    pub fn estimate_remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - self.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        let base = self.kind.base_duration_seconds();
        let projected = if self.progress == 0 {
            base
        } else {
            elapsed * 100.0 / f64::from(self.progress)
        };
        let expected_total = projected.max(base);
        (expected_total - elapsed).max(0.0).round() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAcceptedResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub kind: TaskKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn estimate_uses_base_duration_before_progress() {
        let now = Utc::now();
        let record = TaskRecord::new("t".into(), TaskKind::Image, now);
        assert_eq!(record.estimate_remaining_seconds(now), 30);
    }

    #[test]
    fn estimate_extrapolates_when_slower_than_base() {
        let created = Utc::now();
        let mut record = TaskRecord::new("t".into(), TaskKind::Image, created);
        record.progress = 50;
        let now = created + Duration::seconds(40);
        // 40s for half the work projects 80s total.
        assert_eq!(record.estimate_remaining_seconds(now), 40);
    }

    #[test]
    fn response_hides_result_and_estimate_unless_relevant() {
        let now = Utc::now();
        let mut record = TaskRecord::new("t".into(), TaskKind::Video, now);
        record.result = Some(TaskResult {
            html: "<p></p>".into(),
            download_url: "/download/t/ui-bundle.zip".into(),
            files: vec![],
            frame_count: None,
            duration_seconds: None,
            iterations: None,
            matched: None,
        });

        let processing = record.to_response(now);
        assert!(processing.result.is_none());
        assert!(processing.estimated_remaining_seconds.is_some());

        record.status = TaskStatus::Completed;
        let completed = record.to_response(now);
        assert!(completed.result.is_some());
        assert!(completed.estimated_remaining_seconds.is_none());

        let json = serde_json::to_value(&completed).expect("serialize");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"]["downloadUrl"], "/download/t/ui-bundle.zip");
    }
}
