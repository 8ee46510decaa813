use axum::extract::Multipart;
use thiserror::Error;
use tracing::debug;

use crate::{config::Config, models::TaskKind};

const MEDIA_FIELDS: [&str; 4] = ["media", "file", "image", "video"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_mime(content_type: &str) -> Option<Self> {
        let mime = content_type.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(Self::Image)
        } else if mime.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn task_kind(self) -> TaskKind {
        match self {
            Self::Image => TaskKind::Image,
            Self::Video => TaskKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaLimits {
    pub max_image_bytes: usize,
    pub max_video_bytes: usize,
}

impl MediaLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_image_bytes: config.max_image_bytes,
            max_video_bytes: config.max_video_bytes,
        }
    }

    pub fn ceiling(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
        }
    }

    /// Largest body any upload can legitimately need.
    pub fn body_limit(&self) -> usize {
        self.max_image_bytes
            .max(self.max_video_bytes)
            .saturating_add(1024 * 1024)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("No media file was uploaded")]
    Missing,

    #[error("Unsupported media type `{0}`. Only image/* and video/* uploads are accepted.")]
    UnsupportedType(String),

    #[error("{kind} upload is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge {
        kind: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("Malformed upload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct UploadedMedia {
    pub kind: MediaKind,
    pub content_type: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadedMedia {
    /// File extension used when the upload has to be written to disk.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| {
                self.content_type
                    .split('/')
                    .nth(1)
                    .unwrap_or("bin")
                    .trim_start_matches("x-")
                    .to_string()
            })
    }
}

/// Fields shared by the generation and refinement forms.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub media: Option<UploadedMedia>,
    pub model: Option<String>,
    pub html: Option<String>,
}

pub fn validate(content_type: &str, size: usize, limits: &MediaLimits) -> Result<MediaKind, MediaError> {
    let kind = MediaKind::from_mime(content_type)
        .ok_or_else(|| MediaError::UnsupportedType(content_type.to_string()))?;
    let limit = limits.ceiling(kind);
    if size > limit {
        return Err(MediaError::TooLarge {
            kind: kind.as_str(),
            size,
            limit,
        });
    }
    Ok(kind)
}

pub async fn read_upload_form(
    mut multipart: Multipart,
    limits: &MediaLimits,
) -> Result<UploadForm, MediaError> {
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| MediaError::Malformed(format!("failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if MEDIA_FIELDS.contains(&name.as_str()) {
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let kind = validate(&content_type, 0, limits)?;
            let limit = limits.ceiling(kind);

            let mut bytes = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| MediaError::Malformed(format!("failed to read file chunk: {e}")))?
            {
                bytes.extend_from_slice(&chunk);
                if bytes.len() > limit {
                    return Err(MediaError::TooLarge {
                        kind: kind.as_str(),
                        size: bytes.len(),
                        limit,
                    });
                }
            }

            debug!(
                file_name = %file_name,
                content_type = %content_type,
                size_bytes = bytes.len(),
                "Received media upload"
            );

            form.media = Some(UploadedMedia {
                kind,
                content_type,
                file_name,
                bytes,
            });
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| MediaError::Malformed(format!("failed to read field `{name}`: {e}")))?;
        match name.as_str() {
            "model" => form.model = Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            "html" | "currentHtml" | "current_html" => {
                form.html = Some(value).filter(|v| !v.trim().is_empty())
            }
            _ => {}
        }
    }

    if let Some(media) = &form.media {
        if media.bytes.is_empty() {
            return Err(MediaError::Missing);
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MediaLimits {
        MediaLimits {
            max_image_bytes: 10,
            max_video_bytes: 100,
        }
    }

    #[test]
    fn kind_follows_mime_prefix() {
        assert_eq!(MediaKind::from_mime("image/png"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_mime("Video/MP4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime("application/pdf"), None);
    }

    #[test]
    fn rejects_types_outside_allow_list() {
        assert_eq!(
            validate("text/html", 1, &limits()),
            Err(MediaError::UnsupportedType("text/html".into()))
        );
    }

    #[test]
    fn image_and_video_have_distinct_ceilings() {
        assert_eq!(validate("image/png", 10, &limits()), Ok(MediaKind::Image));
        assert!(matches!(
            validate("image/png", 11, &limits()),
            Err(MediaError::TooLarge { kind: "image", .. })
        ));
        assert_eq!(validate("video/mp4", 50, &limits()), Ok(MediaKind::Video));
        assert!(matches!(
            validate("video/mp4", 101, &limits()),
            Err(MediaError::TooLarge { kind: "video", .. })
        ));
    }

    #[test]
    fn body_limit_leaves_room_for_form_fields_without_overflowing() {
        assert_eq!(limits().body_limit(), 100 + 1024 * 1024);
        let huge = MediaLimits {
            max_image_bytes: 10,
            max_video_bytes: usize::MAX - 1,
        };
        assert_eq!(huge.body_limit(), usize::MAX);
    }

    #[test]
    fn extension_falls_back_to_mime_subtype() {
        let mut media = UploadedMedia {
            kind: MediaKind::Video,
            content_type: "video/webm".into(),
            file_name: "clip.MOV".into(),
            bytes: vec![1],
        };
        assert_eq!(media.extension(), "mov");
        media.file_name = "upload".into();
        assert_eq!(media.extension(), "webm");
        media.content_type = "video/x-matroska".into();
        assert_eq!(media.extension(), "matroska");
    }
}
