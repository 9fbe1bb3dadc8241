//! Allowlist validation for everything that ends up on an encoder command line.
//!
//! User-tunable settings (encoder names, quality, presets, subtitle modes) are
//! checked against fixed allowlists before any argv is assembled, and the
//! encoder executables are resolved to absolute paths once at startup. Argv is
//! always built as a vector of discrete strings; nothing here ever produces a
//! shell line.

use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for command validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandGuardError {
    #[error("invalid video encoder: {0}")]
    InvalidVideoEncoder(String),

    #[error("invalid audio encoder: {0}")]
    InvalidAudioEncoder(String),

    #[error("invalid subtitle mode: {0}")]
    InvalidSubtitleMode(String),

    #[error("video quality {0} out of range 0-51")]
    InvalidQuality(u8),

    #[error("invalid preset name: {0}")]
    InvalidPreset(String),

    #[error("executable not found in PATH: {0}")]
    ExecutableNotFound(String),
}

/// Canonical video encoder names, short form.
pub const VALID_VIDEO_ENCODERS: &[&str] = &[
    "nvenc_h265",
    "nvenc_h264",
    "vaapi_h265",
    "vaapi_h264",
    "amf_h265",
    "amf_h264",
    "qsv_h265",
    "qsv_h264",
    "x265",
    "x264",
];

/// FFmpeg-style aliases accepted and normalized to the short form.
const VIDEO_ENCODER_ALIASES: &[(&str, &str)] = &[
    ("hevc_nvenc", "nvenc_h265"),
    ("h264_nvenc", "nvenc_h264"),
    ("hevc_vaapi", "vaapi_h265"),
    ("h264_vaapi", "vaapi_h264"),
    ("hevc_amf", "amf_h265"),
    ("h264_amf", "amf_h264"),
    ("hevc_qsv", "qsv_h265"),
    ("h264_qsv", "qsv_h264"),
    ("libx265", "x265"),
    ("libx264", "x264"),
];

/// Valid audio encoders ("copy" passes streams through).
pub const VALID_AUDIO_ENCODERS: &[&str] = &["copy", "aac", "ac3", "eac3", "flac", "mp3"];

/// Built-in HandBrake preset names accepted for the preset-driven backend.
///
/// Presets installed on the host but absent from this list are refused; the
/// allowlist is deliberately static so admission behavior does not depend on
/// the host's HandBrake build.
pub const VALID_HANDBRAKE_PRESETS: &[&str] = &[
    "Very Fast 2160p60 4K HEVC",
    "Very Fast 1080p30",
    "Very Fast 720p30",
    "Very Fast 576p25",
    "Very Fast 480p30",
    "Fast 2160p60 4K HEVC",
    "Fast 1080p30",
    "Fast 720p30",
    "Fast 576p25",
    "Fast 480p30",
    "HQ 2160p60 4K HEVC Surround",
    "HQ 1080p30 Surround",
    "HQ 720p30 Surround",
    "HQ 576p25 Surround",
    "HQ 480p30 Surround",
    "Super HQ 2160p60 4K HEVC Surround",
    "Super HQ 1080p30 Surround",
    "Super HQ 720p30 Surround",
    "H.265 NVENC 2160p 4K",
    "H.265 NVENC 1080p",
    "H.264 NVENC 2160p 4K",
    "H.264 NVENC 1080p",
    "H.265 MKV 2160p60",
    "H.265 MKV 1080p30",
    "H.264 MKV 1080p30",
];

/// Subtitle handling modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleMode {
    All,
    None,
    First,
}

impl SubtitleMode {
    pub fn parse(s: &str) -> Result<Self, CommandGuardError> {
        match s {
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            "first" => Ok(Self::First),
            other => Err(CommandGuardError::InvalidSubtitleMode(other.to_string())),
        }
    }
}

/// Validates a video encoder name, normalizing aliases to the short form.
pub fn validate_video_encoder(encoder: &str) -> Result<String, CommandGuardError> {
    if VALID_VIDEO_ENCODERS.contains(&encoder) {
        return Ok(encoder.to_string());
    }
    if let Some((_, canonical)) = VIDEO_ENCODER_ALIASES.iter().find(|(alias, _)| *alias == encoder)
    {
        return Ok(canonical.to_string());
    }
    Err(CommandGuardError::InvalidVideoEncoder(encoder.to_string()))
}

/// Validates an audio encoder name.
pub fn validate_audio_encoder(encoder: &str) -> Result<String, CommandGuardError> {
    if VALID_AUDIO_ENCODERS.contains(&encoder) {
        Ok(encoder.to_string())
    } else {
        Err(CommandGuardError::InvalidAudioEncoder(encoder.to_string()))
    }
}

/// Validates a constant-quality value.
pub fn validate_quality(quality: u8) -> Result<u8, CommandGuardError> {
    if quality <= 51 {
        Ok(quality)
    } else {
        Err(CommandGuardError::InvalidQuality(quality))
    }
}

/// Validates a HandBrake preset name against the baked allowlist.
///
/// The character screen runs first so a hostile name is reported without
/// echoing it into a list comparison of arbitrary length.
pub fn validate_preset(preset: &str) -> Result<String, CommandGuardError> {
    if preset.is_empty() || preset.len() > 100 {
        return Err(CommandGuardError::InvalidPreset(preset.to_string()));
    }
    if !preset
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
    {
        return Err(CommandGuardError::InvalidPreset(preset.to_string()));
    }
    if !VALID_HANDBRAKE_PRESETS.contains(&preset) {
        return Err(CommandGuardError::InvalidPreset(preset.to_string()));
    }
    Ok(preset.to_string())
}

/// Resolves an executable name to an absolute path by searching PATH.
pub fn resolve_executable(name: &str) -> Result<PathBuf, CommandGuardError> {
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(CommandGuardError::ExecutableNotFound(name.to_string()))
}

/// Absolute paths of the external tools, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Present only when HandBrakeCLI is installed.
    pub handbrake: Option<PathBuf>,
}

impl ToolPaths {
    /// Resolve the stream encoder and inspector; the preset transcoder is
    /// optional and its absence only disables the preset backend.
    pub fn resolve() -> Result<Self, CommandGuardError> {
        Ok(Self {
            ffmpeg: resolve_executable("ffmpeg")?,
            ffprobe: resolve_executable("ffprobe")?,
            handbrake: resolve_executable("HandBrakeCLI").ok(),
        })
    }
}

/// Encoder settings after allowlist validation.
#[derive(Debug, Clone)]
pub struct ValidatedEncoding {
    /// Canonical short-form encoder name.
    pub video_encoder: String,
    pub video_quality: u8,
    pub audio_encoder: String,
    pub subtitle_mode: SubtitleMode,
    pub handbrake_preset: String,
    pub handbrake_preset_4k: String,
    pub handbrake_preset_file: Option<PathBuf>,
    pub vaapi_device: PathBuf,
}

impl ValidatedEncoding {
    /// Validates the raw encoding settings.
    pub fn from_settings(
        encoding: &arm_transcoder_config::EncodingConfig,
    ) -> Result<Self, CommandGuardError> {
        let preset_file = if encoding.handbrake_preset_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&encoding.handbrake_preset_file))
        };

        Ok(Self {
            video_encoder: validate_video_encoder(&encoding.video_encoder)?,
            video_quality: validate_quality(encoding.video_quality)?,
            audio_encoder: validate_audio_encoder(&encoding.audio_encoder)?,
            subtitle_mode: SubtitleMode::parse(&encoding.subtitle_mode)?,
            handbrake_preset: validate_preset(&encoding.handbrake_preset)?,
            handbrake_preset_4k: validate_preset(&encoding.handbrake_preset_4k)?,
            handbrake_preset_file: preset_file,
            vaapi_device: encoding.vaapi_device.clone(),
        })
    }
}

/// Returns true when `path` is absolute and names an existing file.
///
/// Used for the optional preset import file at startup.
pub fn check_preset_file(path: &Path) -> bool {
    path.is_absolute() && path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonical_encoders_pass_unchanged() {
        for enc in VALID_VIDEO_ENCODERS {
            assert_eq!(validate_video_encoder(enc).unwrap(), *enc);
        }
    }

    #[test]
    fn test_aliases_normalize_to_short_form() {
        assert_eq!(validate_video_encoder("hevc_nvenc").unwrap(), "nvenc_h265");
        assert_eq!(validate_video_encoder("h264_nvenc").unwrap(), "nvenc_h264");
        assert_eq!(validate_video_encoder("hevc_vaapi").unwrap(), "vaapi_h265");
        assert_eq!(validate_video_encoder("hevc_qsv").unwrap(), "qsv_h265");
        assert_eq!(validate_video_encoder("libx265").unwrap(), "x265");
    }

    #[test]
    fn test_unknown_encoder_rejected() {
        assert!(matches!(
            validate_video_encoder("av1_nvenc; rm -rf /"),
            Err(CommandGuardError::InvalidVideoEncoder(_))
        ));
    }

    #[test]
    fn test_audio_encoders() {
        assert!(validate_audio_encoder("copy").is_ok());
        assert!(validate_audio_encoder("aac").is_ok());
        assert!(validate_audio_encoder("opus").is_err());
    }

    #[test]
    fn test_subtitle_modes() {
        assert_eq!(SubtitleMode::parse("all").unwrap(), SubtitleMode::All);
        assert_eq!(SubtitleMode::parse("none").unwrap(), SubtitleMode::None);
        assert_eq!(SubtitleMode::parse("first").unwrap(), SubtitleMode::First);
        assert!(SubtitleMode::parse("some").is_err());
    }

    #[test]
    fn test_quality_range() {
        assert_eq!(validate_quality(0).unwrap(), 0);
        assert_eq!(validate_quality(51).unwrap(), 51);
        assert!(validate_quality(52).is_err());
    }

    #[test]
    fn test_preset_allowlist_membership() {
        assert!(validate_preset("H.265 NVENC 1080p").is_ok());
        assert!(validate_preset("H.265 NVENC 2160p 4K").is_ok());
        assert!(validate_preset("My Custom Preset").is_err());
    }

    #[test]
    fn test_preset_rejects_hostile_names() {
        assert!(validate_preset("").is_err());
        assert!(validate_preset("preset;inject").is_err());
        assert!(validate_preset("preset`id`").is_err());
        assert!(validate_preset(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_resolve_executable_finds_sh() {
        // /bin/sh exists on any host these tests run on
        let path = resolve_executable("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_resolve_executable_missing() {
        assert!(matches!(
            resolve_executable("definitely-not-a-real-binary-name"),
            Err(CommandGuardError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_validated_encoding_from_default_settings() {
        let encoding = arm_transcoder_config::EncodingConfig::default();
        let validated = ValidatedEncoding::from_settings(&encoding).unwrap();
        assert_eq!(validated.video_encoder, "nvenc_h265");
        assert_eq!(validated.video_quality, 22);
        assert_eq!(validated.subtitle_mode, SubtitleMode::All);
        assert!(validated.handbrake_preset_file.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        // Whatever the input, a validated encoder is always canonical.
        #[test]
        fn prop_validated_encoder_is_canonical(input in "[a-z0-9_]{1,20}") {
            if let Ok(canonical) = validate_video_encoder(&input) {
                prop_assert!(VALID_VIDEO_ENCODERS.contains(&canonical.as_str()));
            }
        }

        // Preset validation never accepts names with shell metacharacters.
        #[test]
        fn prop_preset_rejects_metacharacters(
            prefix in "[A-Za-z0-9 .]{0,20}",
            meta in prop_oneof![
                Just(';'), Just('`'), Just('$'), Just('|'), Just('&'), Just('\''),
            ],
        ) {
            let name = format!("{}{}", prefix, meta);
            prop_assert!(validate_preset(&name).is_err());
        }
    }
}
