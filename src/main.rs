mod api;
mod artifact_store;
mod auth;
mod config;
mod frames;
mod media;
mod model_client;
mod models;
mod pipeline;
mod postprocess;
mod prompts;
mod registry;
mod retry;
mod worker;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use frames::{FfmpegFrameSource, FrameSource};
use model_client::{AnthropicProvider, ModelProvider};
use pipeline::{Pipeline, PipelineSettings};
use registry::TaskRegistry;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: TaskRegistry,
    pub models: Arc<dyn ModelProvider>,
    pub frames: Arc<dyn FrameSource>,
    pub ffmpeg: bool,
}

impl AppState {
    /// Pipeline bound to one caller's credential and model choice.
    pub fn pipeline_for(&self, api_key: &str, model: Option<String>) -> Pipeline {
        Pipeline {
            registry: self.registry.clone(),
            client: self.models.client(api_key),
            frames: self.frames.clone(),
            settings: PipelineSettings {
                artifact_root: self.config.artifact_root.clone(),
                model: model.unwrap_or_else(|| self.config.default_model.clone()),
                max_tokens: self.config.max_tokens,
                retry: self.config.retry_policy(),
                sampler: self.config.sampler_config(),
                refine_sampler: self.config.refine_sampler_config(),
                refine_max_iterations: self.config.refine_max_iterations,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "design2code_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    artifact_store::ensure_artifact_root(&config.artifact_root).await?;

    let ffmpeg = frames::detect_ffmpeg(&config.ffmpeg_bin).await;
    if !ffmpeg {
        warn!(
            "{} not found; video uploads will fail until it is installed",
            config.ffmpeg_bin
        );
    }

    let models = AnthropicProvider::new(config.model_base_url.clone(), config.request_timeout())?;
    let state = AppState {
        config: config.clone(),
        registry: TaskRegistry::new(),
        models: Arc::new(models),
        frames: Arc::new(FfmpegFrameSource::new(
            config.ffmpeg_bin.clone(),
            config.ffprobe_bin.clone(),
        )),
        ffmpeg,
    };

    worker::spawn_cleanup_worker(state.clone());

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("design2code-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
