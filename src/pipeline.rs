//! Background work behind one task: model conversations, frame sampling,
//! post-processing and packaging.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::fs;
use tracing::info;

use crate::{
    artifact_store::{
        delete_dir_if_exists, delete_file_if_exists, download_url, ensure_task_dir, task_dir,
        write_bundle, BundleSpec, BUNDLE_FILE,
    },
    frames::{FrameSource, SampledFrame, SampledVideo, SamplerConfig},
    media::{MediaKind, UploadedMedia},
    model_client::{CompletionRequest, ContentBlock, Message, ModelClient, ModelError},
    models::{TaskKind, TaskResult},
    postprocess::{assemble_document, contains_code, extract_code, inline_document, ExtractedCode},
    prompts,
    registry::TaskRegistry,
    retry::{with_retry, RetryPolicy},
};

static RE_MATCH_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^[\s*_#>-]*MATCH\s*:\s*\**\s*(YES|NO)\b").unwrap());

/// Phrases a critique uses when it considers the markup good enough.
const MATCH_PHRASES: [&str; 8] = [
    "matches the design",
    "matches the original",
    "very close match",
    "closely matches",
    "no significant differences",
    "no changes needed",
    "no further changes",
    "looks identical",
];

const FRAME_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub artifact_root: PathBuf,
    pub model: String,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
    pub sampler: SamplerConfig,
    pub refine_sampler: SamplerConfig,
    pub refine_max_iterations: u32,
}

#[derive(Clone)]
pub struct Pipeline {
    pub registry: TaskRegistry,
    pub client: Arc<dyn ModelClient>,
    pub frames: Arc<dyn FrameSource>,
    pub settings: PipelineSettings,
}

/// Prepared visual reference for a model call.
struct MediaInput {
    blocks: Vec<ContentBlock>,
    video: Option<SampledVideo>,
}

impl Pipeline {
    async fn progress(&self, task_id: &str, progress: u8, message: impl Into<String>) -> Result<()> {
        self.registry
            .set_progress(task_id, progress, message)
            .await
            .map_err(Into::into)
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, ModelError> {
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            system: Some(prompts::SYSTEM_PROMPT.to_string()),
            messages: messages.to_vec(),
        };
        let client = self.client.clone();
        with_retry(self.settings.retry, || {
            let client = client.clone();
            let request = request.clone();
            async move { client.complete(&request).await }
        })
        .await
    }

    pub async fn generate(&self, task_id: &str, media: UploadedMedia) -> Result<TaskResult> {
        match media.kind {
            MediaKind::Image => self.generate_from_image(task_id, media).await,
            MediaKind::Video => self.generate_from_video(task_id, media).await,
        }
    }

    async fn generate_from_image(&self, task_id: &str, media: UploadedMedia) -> Result<TaskResult> {
        self.progress(task_id, 10, "Analyzing design image").await?;

        let messages = vec![Message::user(vec![
            ContentBlock::image(&media.content_type, &media.bytes),
            ContentBlock::text(prompts::IMAGE_GENERATION_PROMPT),
        ])];
        self.progress(task_id, 30, "Generating HTML from design").await?;
        let response = self.complete(&messages).await?;

        self.progress(task_id, 80, "Processing generated code").await?;
        let code = extract_code(&response);
        self.package(task_id, TaskKind::Image, &code, &[], None, None, None)
            .await
    }

    async fn generate_from_video(&self, task_id: &str, media: UploadedMedia) -> Result<TaskResult> {
        self.progress(task_id, 5, "Extracting frames from video").await?;
        let video = self
            .sample_video(task_id, &media, &self.settings.sampler)
            .await?;
        let total = video.frames.len();
        self.progress(task_id, 20, format!("Extracted {total} frames"))
            .await?;

        let summary = self.analyze_interactions(task_id, &video.frames).await?;
        let mut conversation = summary.conversation;

        self.progress(task_id, 85, "Generating interactive HTML").await?;
        conversation.push(Message::user_text(prompts::video_implementation_prompt(
            &summary.summary,
        )));
        let response = self.complete(&conversation).await?;

        self.progress(task_id, 92, "Processing generated code").await?;
        let code = extract_code(&response);
        self.package(
            task_id,
            TaskKind::Video,
            &code,
            &video.frames,
            Some(video.duration),
            None,
            None,
        )
        .await
    }

    /// Frame-by-frame conversation: a baseline turn, one "what changed" turn
    /// per later frame, then a summary turn. Replies accumulate as assistant
    /// turns so each prompt stays small.
    pub async fn analyze_interactions(
        &self,
        task_id: &str,
        frames: &[SampledFrame],
    ) -> Result<InteractionSummary> {
        let Some(first) = frames.first() else {
            anyhow::bail!("No frames were extracted from the video");
        };
        let total = frames.len();
        let mut conversation = vec![Message::user(vec![
            ContentBlock::image(FRAME_MEDIA_TYPE, &first.bytes),
            ContentBlock::text(prompts::VIDEO_BASELINE_PROMPT),
        ])];

        self.progress(task_id, 25, "Analyzing initial UI state").await?;
        let baseline = self.complete(&conversation).await?;
        conversation.push(Message::assistant(baseline));

        for frame in &frames[1..] {
            let progress = 25 + (frame.index * 50 / total.max(1)) as u8;
            self.progress(
                task_id,
                progress,
                format!("Analyzing frame {} of {}", frame.index + 1, total),
            )
            .await?;

            conversation.push(Message::user(vec![
                ContentBlock::image(FRAME_MEDIA_TYPE, &frame.bytes),
                ContentBlock::text(prompts::video_frame_prompt(frame.index, frame.timestamp, total)),
            ]));
            let reply = self.complete(&conversation).await?;
            conversation.push(Message::assistant(reply));
        }

        self.progress(task_id, 78, "Summarizing interactions").await?;
        conversation.push(Message::user_text(prompts::VIDEO_SUMMARY_PROMPT));
        let summary = self.complete(&conversation).await?;
        conversation.push(Message::assistant(summary.clone()));

        info!(task_id = %task_id, frames = total, turns = conversation.len(), "Interaction analysis finished");
        Ok(InteractionSummary {
            conversation,
            summary,
        })
    }

    pub async fn refine(
        &self,
        task_id: &str,
        media: UploadedMedia,
        current_html: &str,
    ) -> Result<TaskResult> {
        self.progress(task_id, 5, "Preparing reference media").await?;
        let reference = self.reference_media(task_id, &media).await?;

        let max_iterations = self.settings.refine_max_iterations.max(1);
        let mut current = extract_code(current_html);
        let mut matched = false;
        let mut iterations = 0;

        for iteration in 1..=max_iterations {
            iterations = iteration;
            self.registry.set_iteration(task_id, iteration).await?;
            let progress = 10 + ((iteration - 1) * 80 / max_iterations) as u8;
            self.progress(
                task_id,
                progress,
                format!("Refinement pass {iteration} of {max_iterations}"),
            )
            .await?;

            let mut blocks = reference.blocks.clone();
            blocks.push(ContentBlock::text(prompts::refinement_prompt(
                &inline_document(&current),
                iteration,
                max_iterations,
            )));
            let critique = self.complete(&[Message::user(blocks)]).await?;

            if declares_match(&critique) {
                matched = true;
                info!(task_id = %task_id, iteration, "Refinement declared a close match");
                break;
            }
            if contains_code(&critique) {
                current = extract_code(&critique);
            }
        }

        self.progress(task_id, 92, "Packaging refined code").await?;
        let (frames, duration) = match &reference.video {
            Some(video) => (video.frames.as_slice(), Some(video.duration)),
            None => (&[][..], None),
        };
        self.package(
            task_id,
            TaskKind::Refine,
            &current,
            frames,
            duration,
            Some(iterations),
            Some(matched),
        )
        .await
    }

    async fn reference_media(&self, task_id: &str, media: &UploadedMedia) -> Result<MediaInput> {
        match media.kind {
            MediaKind::Image => Ok(MediaInput {
                blocks: vec![ContentBlock::image(&media.content_type, &media.bytes)],
                video: None,
            }),
            MediaKind::Video => {
                let video = self
                    .sample_video(task_id, media, &self.settings.refine_sampler)
                    .await?;
                let blocks = video
                    .frames
                    .iter()
                    .map(|frame| ContentBlock::image(FRAME_MEDIA_TYPE, &frame.bytes))
                    .collect();
                Ok(MediaInput {
                    blocks,
                    video: Some(video),
                })
            }
        }
    }

    /// Writes the upload next to the task's artifacts, samples it, and drops
    /// the intermediates again.
    async fn sample_video(
        &self,
        task_id: &str,
        media: &UploadedMedia,
        config: &SamplerConfig,
    ) -> Result<SampledVideo> {
        let dir = task_dir(&self.settings.artifact_root, task_id);
        ensure_task_dir(&dir).await?;
        let source = dir.join(format!("source.{}", media.extension()));
        fs::write(&source, &media.bytes)
            .await
            .with_context(|| format!("Failed to stage upload at {}", source.display()))?;

        let work_dir = dir.join("work");
        let sampled = self.frames.sample(&source, &work_dir, config).await;
        cleanup_intermediates(&source, &work_dir).await;
        let video = sampled?;
        info!(
            task_id = %task_id,
            frames = video.frames.len(),
            duration = video.duration,
            fps = video.fps,
            "Video sampled"
        );
        Ok(video)
    }

    #[allow(clippy::too_many_arguments)]
    async fn package(
        &self,
        task_id: &str,
        kind: TaskKind,
        code: &ExtractedCode,
        frames: &[SampledFrame],
        duration: Option<f64>,
        iterations: Option<u32>,
        matched: Option<bool>,
    ) -> Result<TaskResult> {
        let document = assemble_document(code);
        let bundle = write_bundle(
            &self.settings.artifact_root,
            BundleSpec {
                task_id,
                kind,
                model: &self.settings.model,
                code,
                document: &document,
                frames,
                iterations,
            },
        )
        .await?;
        info!(task_id = %task_id, dir = %bundle.dir.display(), "Task packaged");

        Ok(TaskResult {
            html: document,
            download_url: download_url(task_id, BUNDLE_FILE),
            files: bundle.files,
            frame_count: (!frames.is_empty()).then_some(frames.len()),
            duration_seconds: duration,
            iterations,
            matched,
        })
    }
}

async fn cleanup_intermediates(source: &Path, work_dir: &Path) {
    if let Err(err) = delete_file_if_exists(source).await {
        tracing::warn!("Failed to remove staged upload: {err:#}");
    }
    if let Err(err) = delete_dir_if_exists(work_dir).await {
        tracing::warn!("Failed to remove frame work dir: {err:#}");
    }
}

#[derive(Debug, Clone)]
pub struct InteractionSummary {
    pub conversation: Vec<Message>,
    pub summary: String,
}

/// Whether a critique says the markup already matches the design. An explicit
/// `MATCH: YES/NO` line decides; without one, known phrases are looked for.
pub fn declares_match(critique: &str) -> bool {
    if let Some(caps) = RE_MATCH_MARKER.captures(critique) {
        return caps[1].eq_ignore_ascii_case("yes");
    }
    let lowered = critique.to_lowercase();
    MATCH_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}
