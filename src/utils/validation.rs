use crate::config::{Config, FilterMode};
use std::path::Path;

/// Compound extensions that must survive as a unit.
const DOUBLE_EXTENSIONS: [&str; 4] = [".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst"];

/// Extract the extension from a file name, lowercased and including the
/// leading dot. Compound archive extensions are kept whole; a name with no
/// dot yields an empty string.
pub fn extname(filename: &str) -> String {
    let lower = filename.to_lowercase();
    for double in DOUBLE_EXTENSIONS {
        if lower.ends_with(double) {
            return double.to_string();
        }
    }
    match lower.rfind('.') {
        // A leading dot is a hidden file, not an extension.
        Some(0) | None => String::new(),
        Some(idx) => lower[idx..].to_string(),
    }
}

fn filtered_by(mode: FilterMode, list: &[String], ext: &str) -> bool {
    match mode {
        FilterMode::None => false,
        FilterMode::Blacklist => list.iter().any(|e| e == ext),
        FilterMode::Whitelist => !list.iter().any(|e| e == ext),
    }
}

/// Whether the main extension filter rejects this extension.
pub fn is_extension_filtered(config: &Config, ext: &str) -> bool {
    filtered_by(config.extension_filter_mode, &config.extension_filter, ext)
}

/// Whether a URL-upload extension is rejected. Uses the dedicated URL filter
/// when one is configured, otherwise falls back to the main filter.
pub fn is_url_extension_filtered(config: &Config, ext: &str) -> bool {
    if config.url_extension_filter_mode != FilterMode::None {
        filtered_by(
            config.url_extension_filter_mode,
            &config.url_extension_filter,
            ext,
        )
    } else {
        is_extension_filtered(config, ext)
    }
}

/// Reduce a client-reported name to its base component and cap its length.
/// The result is only ever stored and echoed back, never used as a path.
pub fn sanitize_original(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(255)
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Extensions the `is:` search keys map onto.
pub const IMAGE_EXTENSIONS: [&str; 8] = [
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".tiff", ".svg",
];
pub const VIDEO_EXTENSIONS: [&str; 6] = [".mp4", ".webm", ".mkv", ".mov", ".avi", ".m4v"];
pub const AUDIO_EXTENSIONS: [&str; 6] = [".mp3", ".flac", ".ogg", ".wav", ".m4a", ".opus"];
