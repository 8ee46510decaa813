use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::time;
use tracing::{error, info, warn};

use crate::{
    artifact_store::sweep_expired,
    frames::SamplerError,
    media::UploadedMedia,
    model_client::ModelError,
    models::TaskResult,
    pipeline::Pipeline,
    registry::TaskRegistry,
    AppState,
};

/// Turns a pipeline failure into the task's `(message, error)` pair.
pub fn describe_failure(err: &anyhow::Error) -> (String, String) {
    if let Some(model_err) = err.downcast_ref::<ModelError>() {
        return (model_err.user_message(), model_err.to_string());
    }
    if let Some(sampler_err) = err.downcast_ref::<SamplerError>() {
        return (sampler_err.to_string(), sampler_err.to_string());
    }
    (format!("Generation failed: {err}"), format!("{err:#}"))
}

async fn finish(registry: &TaskRegistry, task_id: &str, outcome: anyhow::Result<TaskResult>) {
    let recorded = match outcome {
        Ok(result) => {
            info!(task_id = %task_id, files = result.files.len(), "Task completed");
            registry
                .complete(task_id, "Generation completed", result)
                .await
        }
        Err(err) => {
            error!(task_id = %task_id, "Task failed: {err:#}");
            let (message, detail) = describe_failure(&err);
            registry.fail(task_id, message, detail).await
        }
    };

    if let Err(err) = recorded {
        warn!(task_id = %task_id, "Could not record task outcome: {err}");
    }
}

pub fn spawn_generation(pipeline: Pipeline, task_id: String, media: UploadedMedia) {
    tokio::spawn(async move {
        info!(
            task_id = %task_id,
            kind = media.kind.as_str(),
            size_bytes = media.bytes.len(),
            "Generation task started"
        );
        let outcome = pipeline.generate(&task_id, media).await;
        finish(&pipeline.registry, &task_id, outcome).await;
    });
}

pub fn spawn_refinement(pipeline: Pipeline, task_id: String, media: UploadedMedia, html: String) {
    tokio::spawn(async move {
        info!(
            task_id = %task_id,
            kind = media.kind.as_str(),
            html_bytes = html.len(),
            "Refinement task started"
        );
        let outcome = pipeline.refine(&task_id, media, &html).await;
        finish(&pipeline.registry, &task_id, outcome).await;
    });
}

pub fn spawn_cleanup_worker(state: AppState) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(state.config.sweep_interval_seconds));
        interval.tick().await;
        loop {
            interval.tick().await;
            run_sweep(&state).await;
        }
    });
}

pub async fn run_sweep(state: &AppState) {
    let retention = state.config.retention();
    match sweep_expired(&state.config.artifact_root, retention, SystemTime::now()).await {
        Ok(removed) if removed > 0 => info!(removed, "Retention sweep removed task directories"),
        Ok(_) => {}
        Err(err) => warn!("Cleanup worker error: {err:#}"),
    }

    let evicted = state.registry.evict_expired(retention, Utc::now()).await;
    if evicted > 0 {
        let remaining = state.registry.len().await;
        info!(evicted, remaining, "Retention sweep evicted finished task records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_failures_use_friendly_message() {
        let err = anyhow::Error::new(ModelError::RateLimited("429".into()));
        let (message, detail) = describe_failure(&err);
        assert_eq!(message, ModelError::RateLimited(String::new()).user_message());
        assert_eq!(detail, "rate limited: 429");
    }

    #[test]
    fn sampler_failures_keep_raw_message() {
        let err = anyhow::Error::new(SamplerError::Probe("Invalid data found".into()));
        let (message, _) = describe_failure(&err);
        assert_eq!(message, "Failed to probe video: Invalid data found");
    }

    #[test]
    fn other_failures_are_wrapped() {
        let err = anyhow::anyhow!("disk full");
        let (message, detail) = describe_failure(&err);
        assert_eq!(message, "Generation failed: disk full");
        assert_eq!(detail, "disk full");
    }
}
