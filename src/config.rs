use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;

use crate::{frames::SamplerConfig, retry::RetryPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub artifact_root: PathBuf,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub max_image_bytes: usize,
    pub max_video_bytes: usize,
    pub model_base_url: String,
    pub default_model: String,
    pub max_tokens: u32,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub sampler_max_frames: usize,
    pub sampler_min_interval: f64,
    pub sampler_motion_threshold: f64,
    pub refine_max_frames: usize,
    pub refine_max_iterations: u32,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            artifact_root: PathBuf::from("generated"),
            retention_seconds: 60 * 60,
            sweep_interval_seconds: 60 * 60,
            max_image_bytes: 20 * 1024 * 1024,
            max_video_bytes: 100 * 1024 * 1024,
            model_base_url: "https://api.anthropic.com".to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            request_timeout_seconds: 300,
            max_retries: 3,
            retry_initial_delay_ms: 1000,
            sampler_max_frames: 20,
            sampler_min_interval: 0.3,
            sampler_motion_threshold: 0.1,
            refine_max_frames: 6,
            refine_max_iterations: 3,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_raw = env::var("DESIGN2CODE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or(defaults.bind_addr);

        let artifact_root = env::var("DESIGN2CODE_ARTIFACT_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.artifact_root);

        let model_base_url = env::var("DESIGN2CODE_MODEL_BASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.model_base_url);

        let default_model = env::var("DESIGN2CODE_DEFAULT_MODEL")
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.default_model);

        Ok(Self {
            bind_addr,
            artifact_root,
            retention_seconds: parse_env("DESIGN2CODE_RETENTION_SECONDS", defaults.retention_seconds),
            sweep_interval_seconds: parse_env(
                "DESIGN2CODE_SWEEP_INTERVAL_SECONDS",
                defaults.sweep_interval_seconds,
            )
            .max(1),
            max_image_bytes: parse_env("DESIGN2CODE_MAX_IMAGE_BYTES", defaults.max_image_bytes),
            max_video_bytes: parse_env("DESIGN2CODE_MAX_VIDEO_BYTES", defaults.max_video_bytes),
            model_base_url,
            default_model,
            max_tokens: parse_env("DESIGN2CODE_MAX_TOKENS", defaults.max_tokens),
            request_timeout_seconds: parse_env(
                "DESIGN2CODE_REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            )
            .max(1),
            max_retries: parse_env("DESIGN2CODE_MAX_RETRIES", defaults.max_retries),
            retry_initial_delay_ms: parse_env(
                "DESIGN2CODE_RETRY_INITIAL_DELAY_MS",
                defaults.retry_initial_delay_ms,
            ),
            sampler_max_frames: parse_env("DESIGN2CODE_MAX_FRAMES", defaults.sampler_max_frames).max(1),
            sampler_min_interval: parse_env(
                "DESIGN2CODE_MIN_FRAME_INTERVAL",
                defaults.sampler_min_interval,
            ),
            sampler_motion_threshold: parse_env(
                "DESIGN2CODE_MOTION_THRESHOLD",
                defaults.sampler_motion_threshold,
            ),
            refine_max_frames: parse_env("DESIGN2CODE_REFINE_MAX_FRAMES", defaults.refine_max_frames)
                .max(1),
            refine_max_iterations: parse_env(
                "DESIGN2CODE_REFINE_MAX_ITERATIONS",
                defaults.refine_max_iterations,
            )
            .max(1),
            ffmpeg_bin: env::var("DESIGN2CODE_FFMPEG").unwrap_or(defaults.ffmpeg_bin),
            ffprobe_bin: env::var("DESIGN2CODE_FFPROBE").unwrap_or(defaults.ffprobe_bin),
        })
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
        }
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            max_frames: self.sampler_max_frames,
            min_interval: self.sampler_min_interval,
            motion_threshold: self.sampler_motion_threshold,
        }
    }

    /// Sampling used when a video is only reference material for a critique.
    pub fn refine_sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            max_frames: self.refine_max_frames.min(self.sampler_max_frames),
            ..self.sampler_config()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refine_sampling_never_exceeds_generation_sampling() {
        let config = Config {
            sampler_max_frames: 4,
            ..Config::default()
        };
        assert_eq!(config.refine_sampler_config().max_frames, 4);
        assert_eq!(Config::default().refine_sampler_config().max_frames, 6);
        assert_eq!(config.retry_policy().initial_delay, Duration::from_millis(1000));
    }
}
