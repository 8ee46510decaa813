use std::{
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    frames::{frame_file_name, SampledFrame},
    models::TaskKind,
    postprocess::{ExtractedCode, SCRIPT_FILE, STYLESHEET_FILE},
};

pub const DOCUMENT_FILE: &str = "index.html";
pub const README_FILE: &str = "README.md";
pub const BUNDLE_FILE: &str = "ui-bundle.zip";
const FRAMES_DIR: &str = "frames";

pub async fn ensure_artifact_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create artifact root at {}", path.display()))
}

pub fn task_dir(artifact_root: &Path, task_id: &str) -> PathBuf {
    artifact_root.join(task_id)
}

pub fn download_url(task_id: &str, file_name: &str) -> String {
    format!("/download/{task_id}/{file_name}")
}

/// Maps a download request onto the artifact tree. Only single, plain path
/// components are accepted for either part.
pub fn resolve_artifact(artifact_root: &Path, task_id: &str, file_name: &str) -> Option<PathBuf> {
    if !is_plain_component(task_id) {
        return None;
    }
    if let Some(frame) = file_name.strip_prefix("frames/") {
        return is_plain_component(frame)
            .then(|| task_dir(artifact_root, task_id).join(FRAMES_DIR).join(frame));
    }
    is_plain_component(file_name).then(|| task_dir(artifact_root, task_id).join(file_name))
}

fn is_plain_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

pub async fn ensure_task_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create task directory {}", path.display()))
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

pub async fn delete_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

#[derive(Debug)]
pub struct BundleSpec<'a> {
    pub task_id: &'a str,
    pub kind: TaskKind,
    pub model: &'a str,
    pub code: &'a ExtractedCode,
    pub document: &'a str,
    pub frames: &'a [SampledFrame],
    pub iterations: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub dir: PathBuf,
    /// Paths relative to the task directory, zip excluded.
    pub files: Vec<String>,
    pub zip_path: PathBuf,
}

/// Writes the generated files for one task and zips them next to each other.
pub async fn write_bundle(artifact_root: &Path, spec: BundleSpec<'_>) -> Result<Bundle> {
    let dir = task_dir(artifact_root, spec.task_id);
    ensure_task_dir(&dir).await?;

    let mut entries: Vec<(String, Vec<u8>)> = vec![
        (DOCUMENT_FILE.to_string(), spec.document.as_bytes().to_vec()),
        (STYLESHEET_FILE.to_string(), spec.code.css.as_bytes().to_vec()),
    ];
    if let Some(js) = &spec.code.js {
        entries.push((SCRIPT_FILE.to_string(), js.as_bytes().to_vec()));
    }
    for frame in spec.frames {
        entries.push((
            format!("{FRAMES_DIR}/{}", frame_file_name(frame.index)),
            frame.bytes.clone(),
        ));
    }
    let readme = render_readme(&spec, &entries);
    entries.insert(2, (README_FILE.to_string(), readme.into_bytes()));

    if !spec.frames.is_empty() {
        ensure_task_dir(&dir.join(FRAMES_DIR)).await?;
    }
    for (name, bytes) in &entries {
        let path = dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let zip_path = dir.join(BUNDLE_FILE);
    let zip_target = zip_path.clone();
    let files = entries.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
    tokio::task::spawn_blocking(move || write_zip(&zip_target, &entries))
        .await
        .context("Zip task failed")??;

    info!(
        task_id = %spec.task_id,
        files = files.len(),
        zip = %zip_path.display(),
        "Artifact bundle written"
    );

    Ok(Bundle {
        dir,
        files,
        zip_path,
    })
}

fn write_zip(path: &Path, entries: &[(String, Vec<u8>)]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("Failed to add {name} to bundle"))?;
        writer.write_all(bytes)?;
    }
    writer.finish().context("Failed to finalize bundle")?;
    Ok(())
}

fn render_readme(spec: &BundleSpec<'_>, entries: &[(String, Vec<u8>)]) -> String {
    let source = match spec.kind {
        TaskKind::Image => "a UI screenshot",
        TaskKind::Video => "a screen recording",
        TaskKind::Refine => "existing markup refined against the original design",
    };

    let mut readme = format!(
        "# Generated UI\n\n\
         Generated from {source} with model `{}` on {}.\n\n\
         ## Files\n\n\
         - `{DOCUMENT_FILE}`: the page; open it in a browser\n\
         - `{STYLESHEET_FILE}`: extracted styles, linked from the page\n",
        spec.model,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    );
    if spec.code.js.is_some() {
        readme.push_str(&format!(
            "- `{SCRIPT_FILE}`: interaction logic, loaded at the end of the page\n"
        ));
    }
    readme.push_str(&format!("- `{README_FILE}`: this file\n"));
    if !spec.frames.is_empty() {
        readme.push_str(&format!(
            "- `{FRAMES_DIR}/`: {} frames sampled from the recording\n",
            spec.frames.len()
        ));
    }
    if let Some(iterations) = spec.iterations {
        readme.push_str(&format!("\nRefinement passes: {iterations}\n"));
    }
    readme.push_str(&format!(
        "\nThe page loads Tailwind from its CDN, so it needs network access to render as intended.\n\
         Bundle contents: {} files.\n",
        entries.len() + 1
    ));
    readme
}

/// Removes task directories created more than `retention` before `now`.
pub async fn sweep_expired(artifact_root: &Path, retention: Duration, now: SystemTime) -> Result<usize> {
    let mut entries = match fs::read_dir(artifact_root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to scan {}", artifact_root.display()))
        }
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Failed to stat {}: {err}", entry.path().display());
                continue;
            }
        };
        if !metadata.is_dir() {
            continue;
        }

        let Ok(created) = metadata.created().or_else(|_| metadata.modified()) else {
            continue;
        };
        let age = now.duration_since(created).unwrap_or(Duration::ZERO);
        if age <= retention {
            continue;
        }

        let path = entry.path();
        match delete_dir_if_exists(&path).await {
            Ok(()) => {
                info!(path = %path.display(), age_secs = age.as_secs(), "Removed expired artifacts");
                removed += 1;
            }
            Err(err) => warn!("Failed to remove expired artifacts {}: {err:#}", path.display()),
        }
    }

    Ok(removed)
}
