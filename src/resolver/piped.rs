//! Backend for a Piped API instance: metadata and stream URLs come from the
//! instance, media bytes are fetched straight from the returned URL.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{ByteSource, MediaResolver, Quality, RawHit, ResolvedMedia, ResolverError};
use crate::filename::extension_for_mime;

const VIDEO_ID_LEN: usize = 11;

pub struct PipedResolver {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct PipedSearchResponse {
    #[serde(default)]
    items: Vec<PipedSearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedSearchItem {
    url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<String>,
    thumbnail: Option<String>,
    uploader_name: Option<String>,
    uploaded_date: Option<String>,
    duration: Option<f64>,
    views: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStreams {
    title: Option<String>,
    #[serde(default)]
    audio_streams: Vec<PipedStream>,
    #[serde(default)]
    video_streams: Vec<PipedStream>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStream {
    url: String,
    mime_type: Option<String>,
    quality: Option<String>,
    height: Option<u32>,
    bitrate: Option<u64>,
    #[serde(default)]
    video_only: bool,
}

#[derive(Debug, Deserialize)]
struct PipedErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl PipedResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ResolverError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|error| ResolverError::Failed(format!("invalid PIPED_API_URL: {error}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ResolverError> {
        self.base_url
            .join(path)
            .map_err(|error| ResolverError::Failed(format!("invalid Piped endpoint: {error}")))
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<T, ResolverError> {
        debug!("Requesting {url}");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<PipedErrorBody>(&body)
                .ok()
                .and_then(|error| error.message.or(error.error))
                .unwrap_or_else(|| format!("Piped responded with HTTP {status}"));
            return Err(ResolverError::Failed(detail));
        }

        Ok(serde_json::from_slice(&body)?)
    }

    async fn streams(&self, url: &str) -> Result<PipedStreams, ResolverError> {
        let video_id = extract_video_id(url)
            .ok_or_else(|| ResolverError::InvalidUrl(url.to_string()))?;
        self.fetch_json(self.endpoint(&format!("streams/{video_id}"))?)
            .await
    }

    async fn open(
        &self,
        title: Option<String>,
        stream: PipedStream,
    ) -> Result<ResolvedMedia, ResolverError> {
        let response = self
            .client
            .get(&stream.url)
            .send()
            .await?
            .error_for_status()?;

        let mime_type = stream
            .mime_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(ResolvedMedia {
            title: title.unwrap_or_else(|| "download".to_string()),
            file_extension: extension_for_mime(&mime_type).to_string(),
            mime_type,
            source: ByteSource::Http(response),
        })
    }
}

#[async_trait]
impl MediaResolver for PipedResolver {
    fn name(&self) -> &'static str {
        "piped"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawHit>, ResolverError> {
        let mut url = self.endpoint("search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("filter", "videos");

        let response: PipedSearchResponse = self.fetch_json(url).await?;

        Ok(response
            .items
            .into_iter()
            .filter(|item| item.kind.as_deref().is_none_or(|kind| kind == "stream"))
            .filter_map(search_item_to_hit)
            .take(limit)
            .collect())
    }

    async fn resolve_audio(
        &self,
        url: &str,
        _scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError> {
        let streams = self.streams(url).await?;
        let Some(stream) = select_audio(&streams.audio_streams).cloned() else {
            return Ok(None);
        };

        self.open(streams.title, stream).await.map(Some)
    }

    async fn resolve_video(
        &self,
        url: &str,
        quality: Quality,
        _scratch: &Path,
    ) -> Result<Option<ResolvedMedia>, ResolverError> {
        let streams = self.streams(url).await?;
        let Some(stream) = select_progressive(&streams.video_streams, quality).cloned() else {
            return Ok(None);
        };

        self.open(streams.title, stream).await.map(Some)
    }
}

fn search_item_to_hit(item: PipedSearchItem) -> Option<RawHit> {
    let id = item.url.as_deref().and_then(extract_video_id)?;

    Some(RawHit {
        id,
        title: item.title,
        thumbnail_url: item.thumbnail,
        channel: item.uploader_name,
        duration_seconds: item.duration,
        view_count: item.views.and_then(|views| u64::try_from(views).ok()),
        upload_date: item.uploaded_date,
    })
}

fn stream_height(stream: &PipedStream) -> Option<u32> {
    stream.height.filter(|height| *height > 0).or_else(|| {
        stream
            .quality
            .as_deref()?
            .split('p')
            .next()?
            .parse()
            .ok()
    })
}

fn is_mp4(stream: &PipedStream) -> bool {
    stream
        .mime_type
        .as_deref()
        .is_some_and(|mime| mime.starts_with("video/mp4"))
}

fn select_audio(streams: &[PipedStream]) -> Option<&PipedStream> {
    streams
        .iter()
        .filter(|stream| !stream.url.is_empty())
        .max_by_key(|stream| stream.bitrate.unwrap_or_default())
}

/// Highest progressive stream within the quality cap, preferring MP4.
fn select_progressive(streams: &[PipedStream], quality: Quality) -> Option<&PipedStream> {
    streams
        .iter()
        .filter(|stream| !stream.video_only && !stream.url.is_empty())
        .filter_map(|stream| {
            let height = stream_height(stream)?;
            (height <= quality.max_height()).then_some((stream, height))
        })
        .max_by_key(|(stream, height)| {
            (is_mp4(stream), *height, stream.bitrate.unwrap_or_default())
        })
        .map(|(stream, _)| stream)
}

/// Pulls the 11-character video id out of watch, short, embed and
/// `youtu.be` links, or `/watch?v=` paths as Piped returns them.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if is_video_id(input) {
        return Some(input.to_string());
    }

    let parsed = Url::parse(input)
        .or_else(|_| Url::parse("https://www.youtube.com/").and_then(|base| base.join(input)))
        .ok()?;

    if let Some((_, value)) = parsed.query_pairs().find(|(key, _)| key == "v")
        && is_video_id(&value)
    {
        return Some(value.into_owned());
    }

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let mut segments = parsed.path_segments()?.filter(|segment| !segment.is_empty());

    let candidate = if host == "youtu.be" || host.ends_with(".youtu.be") {
        segments.next()
    } else {
        match segments.next() {
            Some("shorts" | "embed" | "live" | "v") => segments.next(),
            _ => None,
        }
    }?;

    is_video_id(candidate).then(|| candidate.to_string())
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_'))
}
