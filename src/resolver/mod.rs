//! The extraction capability the HTTP layer delegates to.
//!
//! Backends decide how metadata and media bytes are obtained; handlers only
//! see [`RawHit`] lists and [`ResolvedMedia`] values. A download lookup
//! resolves to `Ok(Some(_))` when a matching stream exists, `Ok(None)` when
//! the video has no stream of the requested kind, and `Err(_)` when the
//! backend itself failed.

mod error;
pub mod piped;
pub mod ytdlp;

use std::{path::Path, path::PathBuf, sync::Arc};

use async_trait::async_trait;

pub use error::ResolverError;

use crate::config::{ResolverBackend, Settings};
use piped::PipedResolver;
use ytdlp::YtDlpResolver;

/// Search result as reported by a backend, before display defaults apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHit {
    pub id: String,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub channel: Option<String>,
    pub duration_seconds: Option<f64>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    P360,
    P720,
}

impl Quality {
    /// Unknown or missing hints fall back to 360p instead of being rejected.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(str::trim) {
            Some("720p") => Self::P720,
            _ => Self::P360,
        }
    }

    pub fn max_height(self) -> u32 {
        match self {
            Self::P360 => 360,
            Self::P720 => 720,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::P360 => "360p",
            Self::P720 => "720p",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video(Quality),
}

impl MediaKind {
    pub fn noun(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video(_) => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub video_url: String,
    pub kind: MediaKind,
}

#[derive(Debug)]
pub enum ByteSource {
    Memory(Vec<u8>),
    /// A file the resolver wrote inside the request's scratch path.
    File(PathBuf),
    Http(reqwest::Response),
}

#[derive(Debug)]
pub struct ResolvedMedia {
    pub title: String,
    pub mime_type: String,
    pub file_extension: String,
    pub source: ByteSource,
}

impl ResolvedMedia {
    /// Buffers the whole payload, refusing anything larger than `limit` bytes.
    pub async fn read_all(self, limit: u64) -> Result<Vec<u8>, ResolverError> {
        match self.source {
            ByteSource::Memory(bytes) => {
                if bytes.len() as u64 > limit {
                    return Err(ResolverError::TooLarge { limit });
                }
                Ok(bytes)
            }
            ByteSource::File(path) => {
                let metadata = tokio::fs::metadata(&path).await?;
                if metadata.len() > limit {
                    return Err(ResolverError::TooLarge { limit });
                }
                Ok(tokio::fs::read(&path).await?)
            }
            ByteSource::Http(mut response) => {
                if response.content_length().is_some_and(|length| length > limit) {
                    return Err(ResolverError::TooLarge { limit });
                }

                let mut buffer = Vec::new();
                while let Some(chunk) = response.chunk().await? {
                    if (buffer.len() + chunk.len()) as u64 > limit {
                        return Err(ResolverError::TooLarge { limit });
                    }
                    buffer.extend_from_slice(&chunk);
                }
                Ok(buffer)
            }
        }
    }
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Backend name for logs and the health endpoint.
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawHit>, ResolverError>;

    /// Finds an audio-only stream. Backends that produce files write them
    /// below `scratch`, which the caller deletes afterwards.
    async fn resolve_audio(
        &self,
        url: &str,
        scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError>;

    /// Finds a progressive (audio and video) stream no taller than `quality`.
    async fn resolve_video(
        &self,
        url: &str,
        quality: Quality,
        scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError>;

    async fn resolve(
        &self,
        request: &DownloadRequest,
        scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError> {
        match request.kind {
            MediaKind::Audio => self.resolve_audio(&request.video_url, scratch).await,
            MediaKind::Video(quality) => {
                self.resolve_video(&request.video_url, quality, scratch)
                    .await
            }
        }
    }
}

pub fn build_resolver(settings: &Settings) -> Result<Arc<dyn MediaResolver>, ResolverError> {
    let resolver: Arc<dyn MediaResolver> = match settings.resolver_backend {
        ResolverBackend::YtDlp => Arc::new(YtDlpResolver::new(
            settings.yt_dlp_bin.clone(),
            settings.audio_format.clone(),
            settings.cookies_file.clone(),
        )),
        ResolverBackend::Piped => Arc::new(PipedResolver::new(
            &settings.piped_api_url,
            settings.resolver_timeout,
        )?),
    };

    Ok(resolver)
}
