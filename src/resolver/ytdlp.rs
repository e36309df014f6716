//! Backend that shells out to the `yt-dlp` executable.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ByteSource, MediaResolver, Quality, RawHit, ResolvedMedia, ResolverError};
use crate::{config::AudioFormat, filename::content_type_for_extension};

pub struct YtDlpResolver {
    program: String,
    leading_args: Vec<String>,
    audio_format: AudioFormat,
    cookies_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct YtDlpSearchResult {
    #[serde(default)]
    entries: Vec<YtDlpEntry>,
}

#[derive(Debug, Deserialize)]
struct YtDlpEntry {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    thumbnails: Vec<YtDlpThumbnail>,
    thumbnail: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    upload_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: Option<String>,
}

/// The JSON object printed after yt-dlp moved the finished file into place.
#[derive(Debug, Deserialize)]
struct PrintedMedia {
    title: Option<String>,
    ext: Option<String>,
    filepath: Option<String>,
}

impl YtDlpResolver {
    /// `command` may carry leading arguments, e.g. `python3 -m yt_dlp`.
    pub fn new(command: String, audio_format: AudioFormat, cookies_file: Option<PathBuf>) -> Self {
        let mut parts = command.split_whitespace().map(ToString::to_string);
        let program = parts.next().unwrap_or_else(|| "yt-dlp".to_string());

        Self {
            program,
            leading_args: parts.collect(),
            audio_format,
            cookies_file,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ResolverError> {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);

        if let Some(path) = self.cookies_file.as_deref().filter(|path| path.is_file()) {
            command.arg("--cookies").arg(path);
        }

        debug!("Running {} with {:?}", self.program, args);

        command
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ResolverError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    async fn download(
        &self,
        url: &str,
        scratch: &Path,
        selector: String,
        extra_args: Vec<String>,
    ) -> Result<Option<ResolvedMedia>, ResolverError> {
        tokio::fs::create_dir_all(scratch).await?;

        let output_template = format!("{}/%(id)s.%(ext)s", scratch.to_string_lossy());
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
            "--print".to_string(),
            "after_move:%(.{title,ext,filepath})j".to_string(),
            "-f".to_string(),
            selector,
            "-o".to_string(),
            output_template,
        ];
        args.extend(extra_args);
        args.push("--".to_string());
        args.push(url.to_string());

        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if reports_no_matching_format(&stderr) {
                debug!("yt-dlp found no matching format for {url}");
                return Ok(None);
            }
            return Err(classify_failure(&stderr));
        }

        let printed = parse_printed_media(&output.stdout);
        let printed_path = printed.as_ref().and_then(|media| media.filepath.as_deref());
        let path = resolve_downloaded_file(scratch, printed_path).await?;

        let file_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .or_else(|| printed.as_ref().and_then(|media| media.ext.clone()))
            .unwrap_or_else(|| "bin".to_string());
        let title = printed
            .and_then(|media| media.title)
            .unwrap_or_else(|| "download".to_string());

        Ok(Some(ResolvedMedia {
            title,
            mime_type: content_type_for_extension(&file_extension).to_string(),
            file_extension,
            source: ByteSource::File(path),
        }))
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawHit>, ResolverError> {
        let output = self
            .run(vec![
                "--flat-playlist".to_string(),
                "--dump-single-json".to_string(),
                "--no-warnings".to_string(),
                "--".to_string(),
                format!("ytsearch{limit}:{query}"),
            ])
            .await?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }

        let mut hits = parse_search_output(&output.stdout)?;
        hits.truncate(limit);
        Ok(hits)
    }

    async fn resolve_audio(
        &self,
        url: &str,
        scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError> {
        match &self.audio_format {
            AudioFormat::Native => {
                self.download(
                    url,
                    scratch,
                    "bestaudio[ext=m4a]/bestaudio".to_string(),
                    Vec::new(),
                )
                .await
            }
            AudioFormat::Transcode(codec) => {
                self.download(
                    url,
                    scratch,
                    "bestaudio/best".to_string(),
                    vec![
                        "-x".to_string(),
                        "--audio-format".to_string(),
                        codec.clone(),
                        "--audio-quality".to_string(),
                        "0".to_string(),
                    ],
                )
                .await
            }
        }
    }

    async fn resolve_video(
        &self,
        url: &str,
        quality: Quality,
        scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError> {
        self.download(url, scratch, progressive_selector(quality), Vec::new())
            .await
    }
}

fn progressive_selector(quality: Quality) -> String {
    let height = quality.max_height();
    format!(
        "best[height<={height}][ext=mp4][vcodec!=none][acodec!=none]/best[height<={height}][vcodec!=none][acodec!=none]"
    )
}

fn parse_search_output(stdout: &[u8]) -> Result<Vec<RawHit>, ResolverError> {
    let result: YtDlpSearchResult = serde_json::from_slice(stdout)?;

    Ok(result
        .entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.id.filter(|id| !id.trim().is_empty())?;
            let thumbnail_url = entry
                .thumbnails
                .into_iter()
                .find_map(|thumbnail| thumbnail.url)
                .or(entry.thumbnail);

            Some(RawHit {
                id,
                title: entry.title,
                thumbnail_url,
                channel: entry.channel.or(entry.uploader),
                duration_seconds: entry.duration,
                view_count: entry.view_count,
                upload_date: entry.upload_date,
            })
        })
        .collect())
}

fn parse_printed_media(stdout: &[u8]) -> Option<PrintedMedia> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()?;

    match serde_json::from_str(line) {
        Ok(media) => Some(media),
        Err(error) => {
            warn!("Could not parse yt-dlp output line {:?}: {error}", line);
            None
        }
    }
}

fn reports_no_matching_format(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("requested format is not available") || lower.contains("no video formats found")
}

fn classify_failure(stderr: &str) -> ResolverError {
    let message = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .trim_start_matches("ERROR:")
        .trim()
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        ResolverError::InvalidUrl(message)
    } else {
        ResolverError::Failed(message)
    }
}

/// Locates the finished file, accepting only paths inside `scratch`.
async fn resolve_downloaded_file(
    scratch: &Path,
    printed_path: Option<&str>,
) -> Result<PathBuf, ResolverError> {
    let canonical_scratch = tokio::fs::canonicalize(scratch).await?;

    if let Some(path_value) = printed_path {
        for candidate in [PathBuf::from(path_value), scratch.join(path_value)] {
            if let Some(valid_path) = resolve_candidate(&canonical_scratch, &candidate).await? {
                return Ok(valid_path);
            }
        }
    }

    let mut entries = tokio::fs::read_dir(scratch).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(valid_path) = resolve_candidate(&canonical_scratch, &entry.path()).await? {
            return Ok(valid_path);
        }
    }

    Err(ResolverError::Failed(
        "yt-dlp finished without producing a file".to_string(),
    ))
}

async fn resolve_candidate(
    canonical_scratch: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ResolverError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_scratch) {
        warn!("Ignoring file outside the scratch directory: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}
