use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("invalid video URL: {0}")]
    InvalidUrl(String),

    #[error("resolver timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("media exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("temporary file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request to resolver failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected resolver output: {0}")]
    Decode(#[from] serde_json::Error),
}
