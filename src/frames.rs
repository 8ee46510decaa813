//! Still-frame sampling for screen recordings.
//!
//! Timestamp selection is pure and lives in [`frame_timestamps`]; probing and
//! extraction shell out to `ffprobe`/`ffmpeg` behind the [`FrameSource`] trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{debug, info};

pub const FRAME_WIDTH: u32 = 1280;
pub const FRAME_HEIGHT: u32 = 720;

const SHORT_CLIP_SECONDS: f64 = 5.0;
const MEDIUM_CLIP_SECONDS: f64 = 15.0;
const SHORT_CLIP_SPACING: f64 = 0.3;
const MEDIUM_CLIP_SPACING: f64 = 0.5;
const END_MARGIN_SECONDS: f64 = 0.1;
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    pub max_frames: usize,
    /// Lower bound on the spacing between consecutive timestamps, in seconds.
    pub min_interval: f64,
    /// Accepted for configuration compatibility. Sampling is purely
    /// time-based and never reads this value.
    pub motion_threshold: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_frames: 20,
            min_interval: 0.3,
            motion_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub index: usize,
    pub timestamp: f64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SampledVideo {
    pub frames: Vec<SampledFrame>,
    pub duration: f64,
    pub fps: f64,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Failed to probe video: {0}")]
    Probe(String),

    #[error("Failed to extract frame at {timestamp:.2}s: {message}")]
    Extract { timestamp: f64, message: String },

    #[error("Frame sampling I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How many stills a clip of `duration` seconds gets.
pub fn frame_count(duration: f64, config: &SamplerConfig) -> usize {
    if !(duration > 0.0) {
        return 1;
    }

    let max_frames = config.max_frames.max(1);
    let target = if duration <= SHORT_CLIP_SECONDS {
        (duration / SHORT_CLIP_SPACING - EPSILON).ceil() as usize
    } else if duration <= MEDIUM_CLIP_SECONDS {
        (duration / MEDIUM_CLIP_SPACING - EPSILON).ceil() as usize
    } else {
        max_frames
    };

    let spacing_cap = if config.min_interval > 0.0 {
        (duration / config.min_interval + EPSILON).floor() as usize + 1
    } else {
        usize::MAX
    };

    target.min(max_frames).min(spacing_cap).max(1)
}

/// Timestamps to extract: always 0, then evenly spaced across the clip,
/// each kept strictly inside it.
///
/// The final timestamp is pulled back to `duration - 0.1` so ffmpeg still
/// finds a frame there. That can leave the last gap shorter than
/// `min_interval` on very short clips (0.35 s gives `[0, 0.25]`); the frame
/// count wins over the spacing floor.
pub fn frame_timestamps(duration: f64, config: &SamplerConfig) -> Vec<f64> {
    let count = frame_count(duration, config);
    if count <= 1 {
        return vec![0.0];
    }

    let step = duration / (count - 1) as f64;
    let last_allowed = (duration - END_MARGIN_SECONDS).max(0.0);
    (0..count)
        .map(|i| (i as f64 * step).min(last_allowed).max(0.0))
        .collect()
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Samples `video`, using `work_dir` for intermediate files.
    async fn sample(
        &self,
        video: &Path,
        work_dir: &Path,
        config: &SamplerConfig,
    ) -> Result<SampledVideo, SamplerError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegFrameSource {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl FfmpegFrameSource {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    async fn probe(&self, video: &Path) -> Result<(f64, f64), SamplerError> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "format=duration:stream=r_frame_rate,duration"])
            .args(["-of", "json"])
            .arg(video)
            .output()
            .await
            .map_err(|e| SamplerError::Probe(format!("failed to run {}: {e}", self.ffprobe_bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SamplerError::Probe(stderr.trim().to_string()));
        }

        parse_probe_output(&output.stdout)
    }

    async fn extract(
        &self,
        video: &Path,
        out_dir: &Path,
        index: usize,
        timestamp: f64,
    ) -> Result<SampledFrame, SamplerError> {
        let out_path = out_dir.join(frame_file_name(index));
        let filter = format!(
            "scale={FRAME_WIDTH}:{FRAME_HEIGHT}:force_original_aspect_ratio=decrease,\
             pad={FRAME_WIDTH}:{FRAME_HEIGHT}:(ow-iw)/2:(oh-ih)/2"
        );

        let output = Command::new(&self.ffmpeg_bin)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .arg("-ss")
            .arg(format!("{timestamp:.3}"))
            .arg("-i")
            .arg(video)
            .args(["-frames:v", "1", "-q:v", "2"])
            .arg("-vf")
            .arg(filter)
            .arg(&out_path)
            .output()
            .await
            .map_err(|e| SamplerError::Extract {
                timestamp,
                message: format!("failed to run {}: {e}", self.ffmpeg_bin),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SamplerError::Extract {
                timestamp,
                message: stderr.trim().to_string(),
            });
        }

        let bytes = fs::read(&out_path).await.map_err(|e| SamplerError::Extract {
            timestamp,
            message: format!("no frame written to {}: {e}", out_path.display()),
        })?;

        debug!(index, timestamp, size_bytes = bytes.len(), "Extracted frame");
        Ok(SampledFrame {
            index,
            timestamp,
            bytes,
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn sample(
        &self,
        video: &Path,
        work_dir: &Path,
        config: &SamplerConfig,
    ) -> Result<SampledVideo, SamplerError> {
        let (duration, fps) = self.probe(video).await?;
        if !(duration > 0.0) {
            return Err(SamplerError::Probe("video reports no duration".to_string()));
        }

        let timestamps = frame_timestamps(duration, config);
        info!(
            duration,
            fps,
            frames = timestamps.len(),
            max_frames = config.max_frames,
            min_interval = config.min_interval,
            motion_threshold = config.motion_threshold,
            "Sampling video frames"
        );

        let out_dir = frames_dir(work_dir);
        fs::create_dir_all(&out_dir).await?;

        let frames = try_join_all(
            timestamps
                .iter()
                .enumerate()
                .map(|(index, &timestamp)| self.extract(video, &out_dir, index, timestamp)),
        )
        .await?;

        Ok(SampledVideo {
            frames,
            duration,
            fps,
        })
    }
}

pub fn frames_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("frames")
}

pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:03}.jpg")
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_probe_output(stdout: &[u8]) -> Result<(f64, f64), SamplerError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| SamplerError::Probe(format!("unreadable ffprobe output: {e}")))?;

    let stream = probe
        .streams
        .first()
        .ok_or_else(|| SamplerError::Probe("no video stream found".to_string()))?;

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .ok_or_else(|| SamplerError::Probe("duration unavailable".to_string()))?;

    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(0.0);

    Ok((duration, fps))
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => raw.trim().parse::<f64>().ok(),
    }
}

pub async fn detect_ffmpeg(ffmpeg_bin: &str) -> bool {
    match Command::new(ffmpeg_bin).arg("-version").output().await {
        Ok(out) => out.status.success(),
        Err(_) => false,
    }
}
