//! Media inspection and encoder-hardware detection.
//!
//! This module runs the container inspector (`ffprobe`) to collect resolution
//! and duration for a source file, classifies the result into UHD/HD/SD, and
//! probes once at startup for the hardware encoder families available on the
//! host (NVENC, VAAPI, AMF, QSV).

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Probed file has no video stream.
    #[error("no video stream in {0}")]
    NoVideoStream(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolution and duration of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
}

impl MediaInfo {
    pub fn resolution_class(&self) -> ResolutionClass {
        ResolutionClass::classify(self.width, self.height)
    }
}

/// Coarse resolution classes driving the resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionClass {
    /// Above 1080p in either dimension.
    Uhd,
    /// At least 720p in either dimension.
    Hd,
    /// Below 720p; upscaled during transcode.
    Sd,
}

impl ResolutionClass {
    pub fn classify(width: u32, height: u32) -> Self {
        if width > 1920 || height > 1080 {
            ResolutionClass::Uhd
        } else if width >= 1280 || height >= 720 {
            ResolutionClass::Hd
        } else {
            ResolutionClass::Sd
        }
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Probes a media file for resolution and duration.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format` and
/// takes the first video stream's dimensions plus the container duration.
pub async fn probe_media(ffprobe: &Path, file: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(file)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout, file)
}

/// Parses ffprobe JSON output into a MediaInfo.
pub fn parse_probe_output(json_str: &str, file: &Path) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::NoVideoStream(file.display().to_string()))?;

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
    })
}

/// Hardware encoder availability, detected once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuSupport {
    /// The preset transcoder was built with NVENC.
    pub handbrake_nvenc: bool,
    pub nvenc_h265: bool,
    pub nvenc_h264: bool,
    pub vaapi_h265: bool,
    pub vaapi_h264: bool,
    pub amf_h265: bool,
    pub amf_h264: bool,
    pub qsv_h265: bool,
    pub qsv_h264: bool,
    /// The configured render device node exists (needed by VAAPI and QSV).
    pub render_node: bool,
}

impl GpuSupport {
    /// Parses `ffmpeg -encoders` output into the encoder flags.
    pub fn from_encoder_listing(listing: &str) -> Self {
        Self {
            handbrake_nvenc: false,
            nvenc_h265: listing.contains("hevc_nvenc"),
            nvenc_h264: listing.contains("h264_nvenc"),
            vaapi_h265: listing.contains("hevc_vaapi"),
            vaapi_h264: listing.contains("h264_vaapi"),
            amf_h265: listing.contains("hevc_amf"),
            amf_h264: listing.contains("h264_amf"),
            qsv_h265: listing.contains("hevc_qsv"),
            qsv_h264: listing.contains("h264_qsv"),
            render_node: false,
        }
    }
}

/// Detects which hardware encoder families are usable on this host.
///
/// Results are advisory: the worker falls back to software x265 when the
/// configured family is missing, it never refuses the job.
pub async fn detect_gpu_support(
    ffmpeg: &Path,
    handbrake: Option<&Path>,
    vaapi_device: &Path,
) -> GpuSupport {
    let mut support = match Command::new(ffmpeg).arg("-encoders").output().await {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            GpuSupport::from_encoder_listing(&stdout)
        }
        Err(e) => {
            tracing::warn!("encoder listing failed: {e}");
            GpuSupport::default()
        }
    };

    // Cross-check: the preset transcoder advertises nvenc in its help text
    if let Some(handbrake) = handbrake {
        if let Ok(output) = Command::new(handbrake).arg("--help").output().await {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            support.handbrake_nvenc = combined.to_lowercase().contains("nvenc");
        }
    }

    support.render_node = vaapi_device.exists();

    tracing::info!(
        nvenc = support.nvenc_h265 || support.nvenc_h264,
        handbrake_nvenc = support.handbrake_nvenc,
        vaapi = support.vaapi_h265 || support.vaapi_h264,
        amf = support.amf_h265 || support.amf_h264,
        qsv = support.qsv_h265 || support.qsv_h264,
        render_node = support.render_node,
        "GPU support detected"
    );

    support
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_probe_output_basic() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "hevc",
                    "width": 1920,
                    "height": 1080
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "channels": 6
                }
            ],
            "format": {
                "duration": "7200.5"
            }
        }"#;

        let info = parse_probe_output(json, &PathBuf::from("x.mkv")).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert!((info.duration_secs - 7200.5).abs() < 0.001);
        assert_eq!(info.resolution_class(), ResolutionClass::Hd);
    }

    #[test]
    fn test_parse_probe_output_audio_only_is_error() {
        let json = r#"{
            "streams": [
                { "codec_type": "audio", "codec_name": "flac", "channels": 2 }
            ],
            "format": { "duration": "240.0" }
        }"#;

        let err = parse_probe_output(json, &PathBuf::from("track.flac")).unwrap_err();
        assert!(matches!(err, ProbeError::NoVideoStream(_)));
    }

    #[test]
    fn test_parse_probe_output_missing_duration_defaults_zero() {
        let json = r#"{
            "streams": [
                { "codec_type": "video", "width": 720, "height": 480 }
            ],
            "format": {}
        }"#;

        let info = parse_probe_output(json, &PathBuf::from("x.mkv")).unwrap();
        assert_eq!(info.duration_secs, 0.0);
        assert_eq!(info.resolution_class(), ResolutionClass::Sd);
    }

    #[test]
    fn test_parse_probe_output_invalid_json() {
        assert!(matches!(
            parse_probe_output("not json", &PathBuf::from("x.mkv")),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_resolution_class_boundaries() {
        assert_eq!(ResolutionClass::classify(3840, 2160), ResolutionClass::Uhd);
        assert_eq!(ResolutionClass::classify(1921, 1080), ResolutionClass::Uhd);
        assert_eq!(ResolutionClass::classify(1920, 1081), ResolutionClass::Uhd);
        assert_eq!(ResolutionClass::classify(1920, 1080), ResolutionClass::Hd);
        assert_eq!(ResolutionClass::classify(1280, 720), ResolutionClass::Hd);
        assert_eq!(ResolutionClass::classify(1280, 536), ResolutionClass::Hd);
        assert_eq!(ResolutionClass::classify(720, 480), ResolutionClass::Sd);
        assert_eq!(ResolutionClass::classify(1279, 719), ResolutionClass::Sd);
    }

    #[test]
    fn test_encoder_listing_parsing() {
        let listing = "\
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D hevc_vaapi           H.265/HEVC (VAAPI) (codec hevc)
";
        let support = GpuSupport::from_encoder_listing(listing);
        assert!(support.nvenc_h265);
        assert!(support.nvenc_h264);
        assert!(support.vaapi_h265);
        assert!(!support.vaapi_h264);
        assert!(!support.amf_h265);
        assert!(!support.qsv_h265);
    }

    #[test]
    fn test_encoder_listing_empty() {
        let support = GpuSupport::from_encoder_listing("");
        assert_eq!(support, GpuSupport::default());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        // The three classes partition the resolution space per the policy:
        // UHD strictly above 1080p, SD strictly below 720p, HD between.
        #[test]
        fn prop_resolution_classes_partition(width in 0u32..8192, height in 0u32..8192) {
            let class = ResolutionClass::classify(width, height);
            match class {
                ResolutionClass::Uhd => {
                    prop_assert!(width > 1920 || height > 1080);
                }
                ResolutionClass::Hd => {
                    prop_assert!(width <= 1920 && height <= 1080);
                    prop_assert!(width >= 1280 || height >= 720);
                }
                ResolutionClass::Sd => {
                    prop_assert!(width < 1280 && height < 720);
                }
            }
        }
    }
}
