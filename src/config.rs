use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::error::ApiError;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_RESOLVER_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 250 * 1024 * 1024;
const DEFAULT_PIPED_API_URL: &str = "https://pipedapi.kavin.rocks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverBackend {
    YtDlp,
    Piped,
}

impl ResolverBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yt-dlp" | "ytdlp" => Some(Self::YtDlp),
            "piped" => Some(Self::Piped),
            _ => None,
        }
    }
}

/// How yt-dlp delivers audio: the stream as published, or transcoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    Native,
    Transcode(String),
}

impl AudioFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "native" | "best" => Self::Native,
            codec => Self::Transcode(codec.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub resolver_backend: ResolverBackend,
    pub yt_dlp_bin: String,
    pub audio_format: AudioFormat,
    pub piped_api_url: String,
    pub cookies_file: Option<PathBuf>,
    pub max_concurrent_downloads: usize,
    pub resolver_timeout: Duration,
    pub max_download_bytes: u64,
    pub transfer_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self, ApiError> {
        let resolver_backend = match std::env::var("RESOLVER_BACKEND").ok() {
            Some(value) if non_empty(&value).is_some() => ResolverBackend::parse(&value)
                .ok_or_else(|| {
                    ApiError::internal(format!(
                        "Unknown RESOLVER_BACKEND {value:?}. Use yt-dlp or piped."
                    ))
                })?,
            _ => ResolverBackend::YtDlp,
        };

        let cookies_file = read_string_env("COOKIES_FILE").map(PathBuf::from);
        if let Some(path) = &cookies_file
            && !path.is_file()
        {
            warn!("COOKIES_FILE {:?} does not exist yet; it is used once present.", path);
        }

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins: read_list_env("ALLOWED_ORIGINS"),
            resolver_backend,
            yt_dlp_bin: read_string_env("YT_DLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            audio_format: read_string_env("AUDIO_FORMAT")
                .map(|value| AudioFormat::parse(&value))
                .unwrap_or(AudioFormat::Native),
            piped_api_url: read_string_env("PIPED_API_URL")
                .unwrap_or_else(|| DEFAULT_PIPED_API_URL.to_string()),
            cookies_file,
            max_concurrent_downloads: read_u64_env("MAX_CONCURRENT_DOWNLOADS")
                .map(|value| value as usize)
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            resolver_timeout: Duration::from_secs(
                read_u64_env("RESOLVER_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_RESOLVER_TIMEOUT_SECONDS),
            ),
            max_download_bytes: read_u64_env("MAX_DOWNLOAD_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_BYTES),
            transfer_dir: read_string_env("TRANSFER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("tubefetch")),
            static_dir: read_string_env("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public")),
        })
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
