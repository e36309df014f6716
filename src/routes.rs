use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, time::timeout};
use tracing::{error, info, warn};

use crate::{
    config::non_empty,
    error::ApiError,
    filename::{build_content_disposition, sanitize_stem},
    hits::SearchHit,
    resolver::{DownloadRequest, MediaKind, MediaResolver, Quality, ResolverError},
    temp::TempResourceGuard,
};

pub const SEARCH_RESULT_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<dyn MediaResolver>,
    pub download_semaphore: Arc<Semaphore>,
    pub transfer_dir: PathBuf,
    pub resolver_timeout: Duration,
    pub max_download_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    success: bool,
    videos: Vec<SearchHit>,
}

struct PreparedDownload {
    bytes: Vec<u8>,
    filename_stem: String,
    file_extension: String,
    mime_type: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/search", get(search))
        .route("/api/download/audio", get(download_audio))
        .route("/api/download/video", get(download_video))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "resolver": state.resolver.name(),
    }))
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = params
        .q
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Search query is required"))?;

    let outcome = timeout(
        state.resolver_timeout,
        state.resolver.search(query, SEARCH_RESULT_LIMIT),
    )
    .await
    .unwrap_or(Err(ResolverError::Timeout(state.resolver_timeout)));

    let hits = outcome.map_err(|error| {
        error!("Search error for {:?}: {error}", query);
        ApiError::internal("Failed to search videos")
    })?;

    info!("Search {:?} returned {} result(s)", query, hits.len());

    Ok(Json(SearchResponse {
        success: true,
        videos: hits.into_iter().map(SearchHit::from_raw).collect(),
    }))
}

async fn download_audio(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let video_url = required_url(&params)?;
    deliver(
        &state,
        DownloadRequest {
            video_url,
            kind: MediaKind::Audio,
        },
    )
    .await
}

async fn download_video(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let video_url = required_url(&params)?;
    let quality = Quality::from_hint(params.quality.as_deref());
    deliver(
        &state,
        DownloadRequest {
            video_url,
            kind: MediaKind::Video(quality),
        },
    )
    .await
}

fn required_url(params: &DownloadParams) -> Result<String, ApiError> {
    params
        .url
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
        .ok_or_else(|| ApiError::bad_request("Video URL is required"))
}

/// Resolves, buffers and answers one download. The scratch path is removed
/// once the bytes are in memory, or as soon as any step fails.
async fn deliver(state: &AppState, request: DownloadRequest) -> Result<Response, ApiError> {
    let noun = request.kind.noun();
    let permit = timeout(
        state.resolver_timeout,
        state.download_semaphore.clone().acquire_owned(),
    )
    .await;
    let _download_permit = match permit {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return Err(ApiError::internal("Could not reserve download capacity.")),
        Err(_) => {
            warn!("No download slot freed up for {}", request.video_url);
            return Err(download_error(
                noun,
                ResolverError::Timeout(state.resolver_timeout),
            ));
        }
    };

    let scratch = TempResourceGuard::unique_in(&state.transfer_dir);
    if let MediaKind::Video(quality) = request.kind {
        info!("Video download requested for {} at {}", request.video_url, quality.label());
    } else {
        info!("Audio download requested for {}", request.video_url);
    }

    let preparation: Result<Option<PreparedDownload>, ResolverError> = timeout(
        state.resolver_timeout,
        async {
            let Some(media) = state.resolver.resolve(&request, scratch.path()).await? else {
                return Ok(None);
            };

            let filename_stem = sanitize_stem(&media.title);
            let file_extension = media.file_extension.clone();
            let mime_type = media.mime_type.clone();
            let bytes = media.read_all(state.max_download_bytes).await?;

            Ok::<_, ResolverError>(Some(PreparedDownload {
                bytes,
                filename_stem,
                file_extension,
                mime_type,
            }))
        },
    )
    .await
    .unwrap_or(Err(ResolverError::Timeout(state.resolver_timeout)));

    scratch.close().await;

    match preparation {
        Ok(Some(prepared)) => {
            info!(
                "Serving {} bytes of {noun} as {}.{}",
                prepared.bytes.len(),
                prepared.filename_stem,
                prepared.file_extension
            );
            build_download_response(prepared)
        }
        Ok(None) => {
            warn!("No {noun} stream available for {}", request.video_url);
            Err(ApiError::not_found(format!("No {noun} stream available")))
        }
        Err(error) => {
            error!("{noun} download error for {}: {error}", request.video_url);
            Err(download_error(noun, error))
        }
    }
}

fn download_error(noun: &str, error: ResolverError) -> ApiError {
    match error {
        ResolverError::InvalidUrl(_) => ApiError::bad_request("Invalid video URL"),
        ResolverError::TooLarge { .. } => {
            ApiError::bad_request(format!("Failed to download {noun}: {error}"))
        }
        other => ApiError::internal(format!("Failed to download {noun}: {other}")),
    }
}

fn build_download_response(prepared: PreparedDownload) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&prepared.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(prepared.bytes.len()));

    let content_disposition =
        build_content_disposition(&prepared.filename_stem, &prepared.file_extension);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_bytes(content_disposition.as_bytes())
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, Body::from(prepared.bytes)).into_response())
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Mutex};

    use async_trait::async_trait;
    use axum::{body::to_bytes, http::StatusCode};
    use serde_json::Value;

    use super::*;
    use crate::resolver::{ByteSource, RawHit, ResolvedMedia};

    #[derive(Clone)]
    enum Behavior {
        /// Writes the request URL into a file under the scratch path.
        EchoUrlToFile { title: &'static str, ext: &'static str },
        Memory { title: &'static str, mime: &'static str, ext: &'static str },
        Missing,
        /// Writes a partial file, then fails.
        FailAfterWrite(&'static str),
        Hang,
    }

    struct FakeResolver {
        hits: Vec<RawHit>,
        search_error: Option<&'static str>,
        behavior: Behavior,
        seen: Mutex<Vec<(MediaKind, PathBuf)>>,
    }

    impl FakeResolver {
        fn new(behavior: Behavior) -> Self {
            Self {
                hits: Vec::new(),
                search_error: None,
                behavior,
                seen: Mutex::new(Vec::new()),
            }
        }

        async fn act(
            &self,
            url: &str,
            kind: MediaKind,
            scratch: &Path,
        ) -> Result<Option<ResolvedMedia>, ResolverError> {
            self.seen
                .lock()
                .unwrap()
                .push((kind, scratch.to_path_buf()));

            match self.behavior.clone() {
                Behavior::EchoUrlToFile { title, ext } => {
                    tokio::fs::create_dir_all(scratch).await?;
                    let path = scratch.join(format!("media.{ext}"));
                    tokio::fs::write(&path, url.as_bytes()).await?;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Some(ResolvedMedia {
                        title: title.to_string(),
                        mime_type: crate::filename::content_type_for_extension(ext).to_string(),
                        file_extension: ext.to_string(),
                        source: ByteSource::File(path),
                    }))
                }
                Behavior::Memory { title, mime, ext } => Ok(Some(ResolvedMedia {
                    title: title.to_string(),
                    mime_type: mime.to_string(),
                    file_extension: ext.to_string(),
                    source: ByteSource::Memory(url.as_bytes().to_vec()),
                })),
                Behavior::Missing => Ok(None),
                Behavior::FailAfterWrite(message) => {
                    tokio::fs::create_dir_all(scratch).await?;
                    tokio::fs::write(scratch.join("partial.part"), b"half").await?;
                    Err(ResolverError::Failed(message.to_string()))
                }
                Behavior::Hang => {
                    tokio::fs::create_dir_all(scratch).await?;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(None)
                }
            }
        }

        fn seen(&self) -> Vec<(MediaKind, PathBuf)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaResolver for FakeResolver {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn search(&self, _query: &str, limit: usize) -> Result<Vec<RawHit>, ResolverError> {
            assert_eq!(limit, SEARCH_RESULT_LIMIT);
            match self.search_error {
                Some(message) => Err(ResolverError::Failed(message.to_string())),
                None => Ok(self.hits.clone()),
            }
        }

        async fn resolve_audio(
            &self,
            url: &str,
            scratch: &Path,
        ) -> Result<Option<ResolvedMedia>, ResolverError> {
            self.act(url, MediaKind::Audio, scratch).await
        }

        async fn resolve_video(
            &self,
            url: &str,
            quality: Quality,
            scratch: &Path,
        ) -> Result<Option<ResolvedMedia>, ResolverError> {
            self.act(url, MediaKind::Video(quality), scratch).await
        }
    }

    struct TestContext {
        state: AppState,
        resolver: Arc<FakeResolver>,
        transfer_dir: tempfile::TempDir,
    }

    impl TestContext {
        fn new(resolver: FakeResolver) -> Self {
            let transfer_dir = tempfile::tempdir().unwrap();
            let resolver = Arc::new(resolver);
            let state = AppState {
                resolver: resolver.clone(),
                download_semaphore: Arc::new(Semaphore::new(4)),
                transfer_dir: transfer_dir.path().to_path_buf(),
                resolver_timeout: Duration::from_secs(5),
                max_download_bytes: 1024,
            };

            Self {
                state,
                resolver,
                transfer_dir,
            }
        }

        fn transfer_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.transfer_dir.path())
                .unwrap()
                .next()
                .is_none()
        }
    }

    fn download_params(url: Option<&str>, quality: Option<&str>) -> DownloadParams {
        DownloadParams {
            url: url.map(ToString::to_string),
            quality: quality.map(ToString::to_string),
        }
    }

    async fn error_json(error: ApiError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn search_requires_query() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Missing));

        for q in [None, Some("   ".to_string())] {
            let error = search(State(ctx.state.clone()), Query(SearchParams { q }))
                .await
                .err()
                .unwrap();
            let (status, body) = error_json(error).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, serde_json::json!({"error": "Search query is required"}));
        }
    }

    #[tokio::test]
    async fn search_maps_hits() {
        let mut resolver = FakeResolver::new(Behavior::Missing);
        resolver.hits = vec![RawHit {
            id: "dQw4w9WgXcQ".to_string(),
            title: Some("Never Gonna Give You Up".to_string()),
            channel: Some("Rick Astley".to_string()),
            duration_seconds: Some(212.0),
            view_count: Some(1_500_000),
            ..RawHit::default()
        }];
        let ctx = TestContext::new(resolver);

        let Json(response) = search(
            State(ctx.state.clone()),
            Query(SearchParams {
                q: Some("rick".to_string()),
            }),
        )
        .await
        .unwrap();

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["videos"][0]["duration"], "3:32");
        assert_eq!(json["videos"][0]["views"], "1.5M views");
        assert_eq!(
            json["videos"][0]["thumbnail"],
            "https://i.ytimg.com/vi/dQw4w9WgXcQ/mqdefault.jpg"
        );
        assert_eq!(json["videos"][0]["uploadDate"], "N/A");
    }

    #[tokio::test]
    async fn search_with_no_results_is_success() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Missing));

        let Json(response) = search(
            State(ctx.state.clone()),
            Query(SearchParams {
                q: Some("nothing matches".to_string()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"success": true, "videos": []})
        );
    }

    #[tokio::test]
    async fn search_failure_hides_details() {
        let mut resolver = FakeResolver::new(Behavior::Missing);
        resolver.search_error = Some("HTTP Error 429: secret internals");
        let ctx = TestContext::new(resolver);

        let error = search(
            State(ctx.state.clone()),
            Query(SearchParams {
                q: Some("rick".to_string()),
            }),
        )
        .await
        .err()
        .unwrap();

        let (status, body) = error_json(error).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, serde_json::json!({"error": "Failed to search videos"}));
    }

    #[tokio::test]
    async fn downloads_require_url() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Missing));

        let audio = download_audio(State(ctx.state.clone()), Query(download_params(None, None)))
            .await
            .err()
            .unwrap();
        let video = download_video(
            State(ctx.state.clone()),
            Query(download_params(Some(" "), Some("720p"))),
        )
        .await
        .err()
        .unwrap();

        for error in [audio, video] {
            let (status, body) = error_json(error).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, serde_json::json!({"error": "Video URL is required"}));
        }
        assert!(ctx.resolver.seen().is_empty());
    }

    #[tokio::test]
    async fn audio_download_returns_attachment_and_cleans_up() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::EchoUrlToFile {
            title: "Song: Live! (2024)",
            ext: "m4a",
        }));

        let response = download_audio(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/abc"), None)),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "audio/mp4");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"Song Live 2024.m4a\""
        );
        assert_eq!(response.headers()[CONTENT_LENGTH], "20");
        assert_eq!(body_bytes(response).await, b"https://youtu.be/abc");

        let seen = ctx.resolver.seen();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].1.exists());
        assert!(ctx.transfer_dir_is_empty());
    }

    #[tokio::test]
    async fn missing_stream_is_not_found() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Missing));

        let audio = download_audio(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/abc"), None)),
        )
        .await
        .err()
        .unwrap();
        let (status, body) = error_json(audio).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, serde_json::json!({"error": "No audio stream available"}));

        let video = download_video(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/abc"), None)),
        )
        .await
        .err()
        .unwrap();
        let (status, body) = error_json(video).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, serde_json::json!({"error": "No video stream available"}));
    }

    #[tokio::test]
    async fn resolver_failure_embeds_message_and_cleans_up() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::FailAfterWrite(
            "Sign in to confirm your age",
        )));

        let error = download_audio(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/abc"), None)),
        )
        .await
        .err()
        .unwrap();

        let (status, body) = error_json(error).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            serde_json::json!({"error": "Failed to download audio: Sign in to confirm your age"})
        );

        let seen = ctx.resolver.seen();
        assert!(!seen[0].1.exists());
        assert!(ctx.transfer_dir_is_empty());
    }

    #[tokio::test]
    async fn oversized_media_is_rejected_and_cleaned_up() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::EchoUrlToFile {
            title: "Big",
            ext: "mp4",
        }));
        let long_url = format!("https://youtu.be/{}", "a".repeat(2048));

        let error = download_video(
            State(ctx.state.clone()),
            Query(download_params(Some(long_url.as_str()), None)),
        )
        .await
        .err()
        .unwrap();

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.starts_with("Failed to download video:"));
        assert!(ctx.transfer_dir_is_empty());
    }

    #[tokio::test]
    async fn invalid_quality_behaves_like_360p() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Memory {
            title: "Clip",
            mime: "video/mp4",
            ext: "mp4",
        }));

        let mut bodies = Vec::new();
        for quality in [Some("999p"), Some("360p"), None] {
            let response = download_video(
                State(ctx.state.clone()),
                Query(download_params(Some("https://youtu.be/abc"), quality)),
            )
            .await
            .unwrap();
            assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
            assert_eq!(
                response.headers()[CONTENT_DISPOSITION],
                "attachment; filename=\"Clip.mp4\""
            );
            bodies.push(body_bytes(response).await);
        }

        assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
        let kinds: Vec<MediaKind> = ctx.resolver.seen().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![MediaKind::Video(Quality::P360); 3]);
    }

    #[tokio::test]
    async fn high_quality_hint_reaches_resolver() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Memory {
            title: "Clip",
            mime: "video/mp4",
            ext: "mp4",
        }));

        download_video(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/abc"), Some("720p"))),
        )
        .await
        .unwrap();

        assert_eq!(ctx.resolver.seen()[0].0, MediaKind::Video(Quality::P720));
    }

    #[tokio::test]
    async fn invalid_url_maps_to_bad_request() {
        let error = download_error("audio", ResolverError::InvalidUrl("x".to_string()));
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.message, "Invalid video URL");
    }

    #[tokio::test]
    async fn resolver_timeout_is_reported_and_cleaned_up() {
        let mut ctx = TestContext::new(FakeResolver::new(Behavior::Hang));
        ctx.state.resolver_timeout = Duration::from_millis(50);

        let error = download_audio(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/abc"), None)),
        )
        .await
        .err()
        .unwrap();

        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error.message.contains("timed out"));
        assert!(ctx.transfer_dir_is_empty());
    }

    #[tokio::test]
    async fn waiting_for_a_download_slot_is_bounded() {
        let mut ctx = TestContext::new(FakeResolver::new(Behavior::Memory {
            title: "Clip",
            mime: "audio/mp4",
            ext: "m4a",
        }));
        ctx.state.download_semaphore = Arc::new(Semaphore::new(1));
        ctx.state.resolver_timeout = Duration::from_millis(50);
        let _held = ctx.state.download_semaphore.clone().try_acquire_owned().unwrap();

        let outcome = timeout(
            Duration::from_secs(2),
            download_audio(
                State(ctx.state.clone()),
                Query(download_params(Some("https://youtu.be/abc"), None)),
            ),
        )
        .await
        .expect("handler must give up waiting for a slot");

        let error = outcome.err().unwrap();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error.message.contains("timed out"));
        assert!(ctx.resolver.seen().is_empty());
        assert!(ctx.transfer_dir_is_empty());
    }

    #[tokio::test]
    async fn concurrent_downloads_do_not_share_scratch() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::EchoUrlToFile {
            title: "Track",
            ext: "mp3",
        }));

        let first = download_audio(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/first"), None)),
        );
        let second = download_audio(
            State(ctx.state.clone()),
            Query(download_params(Some("https://youtu.be/second"), None)),
        );
        let (first, second) = tokio::join!(first, second);

        assert_eq!(body_bytes(first.unwrap()).await, b"https://youtu.be/first");
        assert_eq!(body_bytes(second.unwrap()).await, b"https://youtu.be/second");

        let seen = ctx.resolver.seen();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].1, seen[1].1);
        assert!(ctx.transfer_dir_is_empty());
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let ctx = TestContext::new(FakeResolver::new(Behavior::Missing));
        let Json(body) = health(State(ctx.state.clone())).await;
        assert_eq!(body, serde_json::json!({"status": "ok", "resolver": "fake"}));
    }
}
