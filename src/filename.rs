//! Attachment naming: title sanitizing, MIME lookup and the
//! `Content-Disposition` value served with every download.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_STEM_CHARS: usize = 100;

/// Everything that is not a letter, a number, `_`, `-` or whitespace.
/// Combining marks count as removable even when they are alphabetic.
static NON_STEM_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{L}\p{N}_\s-]").expect("stem filter regex is valid") // Static pattern, safe to panic
});

/// Reduces an arbitrary media title to a filename stem made of word
/// characters, spaces and hyphens, capped at [`MAX_STEM_CHARS`] characters.
///
/// Any whitespace is emitted as a plain space so the stem is always safe to
/// embed in a header.
pub fn sanitize_stem(title: &str) -> String {
    NON_STEM_CHARS
        .replace_all(title, "")
        .chars()
        .map(|character| if character.is_whitespace() { ' ' } else { character })
        .take(MAX_STEM_CHARS)
        .collect()
}

pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "weba" => "audio/webm",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Picks the container extension for a MIME type reported by a resolver.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        "audio/mp4" => "m4a",
        "audio/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/3gpp" => "3gp",
        _ => "bin",
    }
}

pub fn build_content_disposition(stem: &str, extension: &str) -> String {
    let filename = format!("{stem}.{extension}");
    if filename.is_ascii() {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!(
            "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
            urlencoding::encode(&filename)
        )
    }
}
