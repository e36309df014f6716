use serde::Serialize;

use crate::resolver::RawHit;

const UNKNOWN: &str = "Unknown";
const NOT_AVAILABLE: &str = "N/A";

/// One search result as served to the front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub channel: String,
    pub duration: String,
    pub views: String,
    pub upload_date: String,
}

impl SearchHit {
    pub fn from_raw(raw: RawHit) -> Self {
        let thumbnail = raw
            .thumbnail_url
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| fallback_thumbnail(&raw.id));

        Self {
            title: non_blank(raw.title).unwrap_or_else(|| UNKNOWN.to_string()),
            channel: non_blank(raw.channel).unwrap_or_else(|| UNKNOWN.to_string()),
            duration: format_duration(raw.duration_seconds),
            views: format_views(raw.view_count),
            upload_date: format_upload_date(raw.upload_date.as_deref()),
            thumbnail,
            id: raw.id,
        }
    }
}

fn fallback_thumbnail(id: &str) -> String {
    if id.is_empty() {
        String::new()
    } else {
        format!("https://i.ytimg.com/vi/{id}/mqdefault.jpg")
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// `H:MM:SS` for an hour or more, `M:SS` below that, `N/A` for zero or
/// unknown lengths.
pub fn format_duration(seconds: Option<f64>) -> String {
    let total = match seconds {
        Some(value) if value.is_finite() && value >= 1.0 => value as u64,
        _ => return NOT_AVAILABLE.to_string(),
    };

    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

pub fn format_views(count: Option<u64>) -> String {
    match count {
        None | Some(0) => NOT_AVAILABLE.to_string(),
        Some(value) if value >= 1_000_000 => format!("{:.1}M views", value as f64 / 1e6),
        Some(value) if value >= 1_000 => format!("{:.1}K views", value as f64 / 1e3),
        Some(value) => format!("{value} views"),
    }
}

/// Turns yt-dlp's compact `YYYYMMDD` into `YYYY-MM-DD`; other non-empty text
/// (for example "3 years ago") is shown unchanged.
pub fn format_upload_date(value: Option<&str>) -> String {
    let Some(text) = value.map(str::trim).filter(|text| !text.is_empty()) else {
        return NOT_AVAILABLE.to_string();
    };

    if text.len() == 8 && text.bytes().all(|byte| byte.is_ascii_digit()) {
        format!("{}-{}-{}", &text[..4], &text[4..6], &text[6..])
    } else {
        text.to_string()
    }
}
