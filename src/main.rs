mod config;
mod error;
mod filename;
mod hits;
mod resolver;
mod routes;
mod temp;

use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{ResolverBackend, Settings},
    error::ApiError,
    routes::AppState,
};

const STALE_TRANSFER_SECONDS: u64 = 2 * 60 * 60;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tubefetch=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let settings = Settings::from_env()?;

    tokio::fs::create_dir_all(&settings.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create transfer directory {:?}: {error}",
                settings.transfer_dir
            ))
        })?;
    temp::cleanup_stale_transfers(
        &settings.transfer_dir,
        Duration::from_secs(STALE_TRANSFER_SECONDS),
    )
    .await;

    let resolver = resolver::build_resolver(&settings)
        .map_err(|error| ApiError::internal(format!("Could not set up resolver: {error}")))?;
    match settings.resolver_backend {
        ResolverBackend::YtDlp => info!(
            "Using yt-dlp resolver ({}), audio format {:?}",
            settings.yt_dlp_bin, settings.audio_format
        ),
        ResolverBackend::Piped => {
            info!("Using Piped resolver at {}", settings.piped_api_url)
        }
    }

    let state = AppState {
        resolver,
        download_semaphore: Arc::new(Semaphore::new(settings.max_concurrent_downloads)),
        transfer_dir: settings.transfer_dir.clone(),
        resolver_timeout: settings.resolver_timeout,
        max_download_bytes: settings.max_download_bytes,
    };

    let cors = build_cors_layer(&settings.allowed_origins)?;

    let mut app = routes::router(state);
    if settings.static_dir.is_dir() {
        info!("Serving static files from {:?}", settings.static_dir);
        app = app.fallback_service(ServeDir::new(&settings.static_dir));
    } else {
        warn!(
            "Static directory {:?} not found; only the API is served.",
            settings.static_dir
        );
    }
    let app = app.layer(TraceLayer::new_for_http()).layer(cors);

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not bind {}: {error}",
                settings.bind_addr
            ))
        })?;

    info!("Server running on http://{}", settings.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() || configured.iter().any(|origin| origin == "*") {
        info!("CORS allows any origin.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!("CORS origin {:?} allowed={}", origin, allowed);
        allowed
    });

    Ok(layer.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
