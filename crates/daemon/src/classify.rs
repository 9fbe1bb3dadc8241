//! Classifier module for deciding where a finished rip belongs.
//!
//! A source directory is routed to `audio/`, `tv/`, or `movies/` in the
//! completed tree: standalone audio files mean a music rip, a
//! season/episode token in the name means television, everything else is a
//! movie. Also hosts the filesystem-safe title cleaner used when naming
//! published artifacts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Video container extensions recognized as transcode input.
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv"];

/// Audio extensions that mark a source directory as a music rip.
pub const AUDIO_EXTENSIONS: &[&str] = &["flac", "mp3", "wav", "ogg"];

/// Longest cleaned title, leaving headroom for an extension under the usual
/// 255-byte filename limit.
const MAX_CLEAN_TITLE_LEN: usize = 240;

/// Destination classification for a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Movie,
    Tv,
    Audio,
}

impl Default for Classification {
    fn default() -> Self {
        Self::Movie
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Movie => write!(f, "movie"),
            Classification::Tv => write!(f, "tv"),
            Classification::Audio => write!(f, "audio"),
        }
    }
}

impl Classification {
    /// Parse the stored string form back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(Self::Movie),
            "tv" => Some(Self::Tv),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

fn has_extension_in(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Finds audio files directly inside the source directory, sorted by name.
pub fn discover_audio_files(source_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(source_dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension_in(p, AUDIO_EXTENSIONS))
        .collect();
    files.sort();
    files
}

/// Finds video files directly inside the source directory, largest first.
///
/// Disc rips produce one large main feature plus smaller extras; callers
/// treat the first entry as the main feature.
pub fn discover_video_files(source_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(u64, PathBuf)> = std::fs::read_dir(source_dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension_in(p, VIDEO_EXTENSIONS))
        .map(|p| {
            let size = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
            (size, p)
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    files.into_iter().map(|(_, p)| p).collect()
}

/// Season/episode token, e.g. `S01E02` or `s1e113`.
fn episode_regex() -> Regex {
    Regex::new(r"(?i)S\d{1,2}E\d{1,3}").expect("static regex")
}

/// Classifies a source directory for output routing.
///
/// Rules, in order:
/// 1. Any standalone audio file in the directory -> `Audio`
/// 2. A season/episode token in the directory name or title -> `Tv`
/// 3. Otherwise -> `Movie`
///
/// The television heuristic is purely lexical; an ambiguous movie title
/// containing an episode-shaped token classifies as TV, and a series rip
/// without one classifies as movie.
pub fn classify_source(source_dir: &Path, title: &str) -> Classification {
    if !discover_audio_files(source_dir).is_empty() {
        return Classification::Audio;
    }

    let episode = episode_regex();
    let dir_name = source_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if episode.is_match(&dir_name) || episode.is_match(title) {
        return Classification::Tv;
    }

    Classification::Movie
}

/// Cleans a display title into a filesystem-safe path component.
///
/// Control characters are stripped, reserved characters (`<>:"/\|?*`) become
/// underscores, runs of whitespace collapse to one space, and the result is
/// trimmed to 240 characters. An empty result falls back to "untitled".
pub fn clean_title(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    for c in title.chars() {
        if (c as u32) < 0x20 {
            continue;
        }
        match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => cleaned.push('_'),
            _ => cleaned.push(c),
        }
    }

    let mut collapsed = String::with_capacity(cleaned.len());
    let mut last_was_space = false;
    for c in cleaned.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(c);
            last_was_space = false;
        }
    }

    let mut result: String = collapsed.trim().to_string();
    if result.len() > MAX_CLEAN_TITLE_LEN {
        // Trim on a char boundary
        let mut end = MAX_CLEAN_TITLE_LEN;
        while !result.is_char_boundary(end) {
            end -= 1;
        }
        result.truncate(end);
        result = result.trim_end().to_string();
    }

    if result.is_empty() {
        result = "untitled".to_string();
    }
    result
}
