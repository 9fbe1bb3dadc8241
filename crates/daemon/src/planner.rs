//! Transcode planning: encoder family resolution and argv assembly.
//!
//! Given the validated settings, the detected GPU support, and the probed
//! source, the planner picks the tool (the stream encoder or the preset
//! transcoder), maps the encoder family onto that tool's flags, applies the
//! resolution policy, and emits the full argv. Argv elements are discrete
//! strings; the executable is the absolute path resolved at startup.

use crate::command_guard::{SubtitleMode, ToolPaths, ValidatedEncoding};
use crate::probe::{GpuSupport, MediaInfo, ResolutionClass};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hardware encoder family a job runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFamily {
    Nvenc,
    Vaapi,
    Amf,
    Qsv,
    SoftX265,
    SoftX264,
}

impl EncoderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderFamily::Nvenc => "nvenc",
            EncoderFamily::Vaapi => "vaapi",
            EncoderFamily::Amf => "amf",
            EncoderFamily::Qsv => "qsv",
            EncoderFamily::SoftX265 => "soft_x265",
            EncoderFamily::SoftX264 => "soft_x264",
        }
    }

    /// Family of a canonical short-form encoder name.
    pub fn of_encoder(encoder: &str) -> Self {
        match encoder {
            "nvenc_h265" | "nvenc_h264" => EncoderFamily::Nvenc,
            "vaapi_h265" | "vaapi_h264" => EncoderFamily::Vaapi,
            "amf_h265" | "amf_h264" => EncoderFamily::Amf,
            "qsv_h265" | "qsv_h264" => EncoderFamily::Qsv,
            "x264" => EncoderFamily::SoftX264,
            _ => EncoderFamily::SoftX265,
        }
    }
}

/// Which external tool executes the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// FFmpeg-family stream encoder.
    Ffmpeg,
    /// HandBrake-family preset transcoder.
    Handbrake,
}

/// How the executor should interpret the tool's progress output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressFormat {
    /// `time=HH:MM:SS.ss` lines divided by the source duration.
    FfmpegTime { duration_secs: f64 },
    /// `Encoding: task N of M, P.PP %` lines.
    HandbrakePercent,
}

/// A fully assembled transcode command.
#[derive(Debug, Clone)]
pub struct TranscodePlan {
    /// argv\[0\] is the absolute tool path.
    pub argv: Vec<String>,
    pub tool: ToolKind,
    pub family: EncoderFamily,
    /// True when the configured family was unavailable and software took over.
    pub fell_back: bool,
    pub progress: ProgressFormat,
}

/// Inputs the planner needs for one job.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub tools: &'a ToolPaths,
    pub encoding: &'a ValidatedEncoding,
    pub gpu: &'a GpuSupport,
    pub media: MediaInfo,
    pub source: &'a Path,
    pub dest: &'a Path,
}

/// Whether the detected hardware can run the given family.
///
/// AMF and software have no reliable startup probe, so they always count as
/// available; a broken AMF install surfaces as an encode failure instead.
fn family_available(family: EncoderFamily, gpu: &GpuSupport) -> bool {
    match family {
        EncoderFamily::Nvenc => {
            gpu.nvenc_h265 || gpu.nvenc_h264 || gpu.handbrake_nvenc
        }
        EncoderFamily::Vaapi => (gpu.vaapi_h265 || gpu.vaapi_h264) && gpu.render_node,
        EncoderFamily::Qsv => (gpu.qsv_h265 || gpu.qsv_h264) && gpu.render_node,
        EncoderFamily::Amf | EncoderFamily::SoftX265 | EncoderFamily::SoftX264 => true,
    }
}

/// FFmpeg encoder name for a canonical short-form encoder.
fn ffmpeg_encoder_name(encoder: &str) -> &'static str {
    match encoder {
        "nvenc_h265" => "hevc_nvenc",
        "nvenc_h264" => "h264_nvenc",
        "vaapi_h265" => "hevc_vaapi",
        "vaapi_h264" => "h264_vaapi",
        "amf_h265" => "hevc_amf",
        "amf_h264" => "h264_amf",
        "qsv_h265" => "hevc_qsv",
        "qsv_h264" => "h264_qsv",
        "x264" => "libx264",
        _ => "libx265",
    }
}

/// Builds the transcode command for one source file.
pub fn plan_transcode(req: PlanRequest<'_>) -> TranscodePlan {
    let configured_family = EncoderFamily::of_encoder(&req.encoding.video_encoder);

    let (encoder, family, fell_back) = if family_available(configured_family, req.gpu) {
        (req.encoding.video_encoder.clone(), configured_family, false)
    } else {
        ("x265".to_string(), EncoderFamily::SoftX265, true)
    };

    let use_handbrake = family == EncoderFamily::Nvenc
        && req.gpu.handbrake_nvenc
        && req.tools.handbrake.is_some();

    if use_handbrake {
        plan_handbrake(&req, &encoder, family, fell_back)
    } else {
        plan_ffmpeg(&req, &encoder, family, fell_back)
    }
}

fn plan_handbrake(
    req: &PlanRequest<'_>,
    encoder: &str,
    family: EncoderFamily,
    fell_back: bool,
) -> TranscodePlan {
    let handbrake = req
        .tools
        .handbrake
        .as_ref()
        .expect("handbrake path checked by caller");

    let mut argv: Vec<String> = vec![
        handbrake.to_string_lossy().to_string(),
        "-i".into(),
        req.source.to_string_lossy().to_string(),
        "-o".into(),
        req.dest.to_string_lossy().to_string(),
    ];

    if let Some(preset_file) = &req.encoding.handbrake_preset_file {
        argv.push("--preset-import-file".into());
        argv.push(preset_file.to_string_lossy().to_string());
    }

    // UHD sources take the 4K preset variant; the preset embeds quality and
    // scaling, so no -q flag here.
    let preset = match req.media.resolution_class() {
        ResolutionClass::Uhd => &req.encoding.handbrake_preset_4k,
        _ => &req.encoding.handbrake_preset,
    };
    argv.push("--preset".into());
    argv.push(preset.clone());

    argv.push("--encoder".into());
    argv.push(encoder.to_string());

    argv.push("--aencoder".into());
    argv.push(req.encoding.audio_encoder.clone());

    match req.encoding.subtitle_mode {
        SubtitleMode::All => argv.push("--all-subtitles".into()),
        SubtitleMode::First => {
            argv.push("--subtitle".into());
            argv.push("1".into());
        }
        SubtitleMode::None => {}
    }

    TranscodePlan {
        argv,
        tool: ToolKind::Handbrake,
        family,
        fell_back,
        progress: ProgressFormat::HandbrakePercent,
    }
}

fn plan_ffmpeg(
    req: &PlanRequest<'_>,
    encoder: &str,
    family: EncoderFamily,
    fell_back: bool,
) -> TranscodePlan {
    let quality = req.encoding.video_quality.to_string();
    let mut argv: Vec<String> = vec![req.tools.ffmpeg.to_string_lossy().to_string(), "-y".into()];

    // Hardware upload happens on the input side for the families that decode
    // into device memory.
    match family {
        EncoderFamily::Nvenc => {
            argv.extend(["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"].map(String::from));
        }
        EncoderFamily::Vaapi => {
            argv.extend(["-hwaccel", "vaapi", "-hwaccel_device"].map(String::from));
            argv.push(req.encoding.vaapi_device.to_string_lossy().to_string());
            argv.extend(["-hwaccel_output_format", "vaapi"].map(String::from));
        }
        EncoderFamily::Qsv => {
            argv.extend(["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"].map(String::from));
        }
        _ => {}
    }

    argv.push("-i".into());
    argv.push(req.source.to_string_lossy().to_string());

    // Stream mapping: video track 0, every audio track, subtitles per mode
    argv.extend(["-map", "0:v:0", "-map", "0:a?"].map(String::from));
    match req.encoding.subtitle_mode {
        SubtitleMode::All => argv.extend(["-map", "0:s?", "-c:s", "copy"].map(String::from)),
        SubtitleMode::First => {
            argv.extend(["-map", "0:s:0?", "-c:s", "copy"].map(String::from))
        }
        SubtitleMode::None => argv.push("-sn".into()),
    }

    argv.push("-c:v".into());
    argv.push(ffmpeg_encoder_name(encoder).to_string());

    match family {
        EncoderFamily::Nvenc => {
            argv.extend(["-preset", "p4", "-cq", quality.as_str(), "-b:v", "0"].map(String::from));
        }
        EncoderFamily::Vaapi => {
            argv.extend(["-rc_mode", "CQP", "-qp", quality.as_str()].map(String::from));
        }
        EncoderFamily::Amf => {
            argv.extend(["-rc", "cqp", "-qp_i", quality.as_str(), "-qp_p", quality.as_str()].map(String::from));
        }
        EncoderFamily::Qsv => {
            argv.extend(["-global_quality", quality.as_str()].map(String::from));
        }
        EncoderFamily::SoftX265 | EncoderFamily::SoftX264 => {
            argv.extend(["-crf", quality.as_str(), "-preset", "medium"].map(String::from));
        }
    }

    // SD sources upscale to 720p with the family's native filter
    if req.media.resolution_class() == ResolutionClass::Sd {
        let filter = match family {
            EncoderFamily::Nvenc => "scale_cuda=1280:720",
            EncoderFamily::Vaapi => "scale_vaapi=w=1280:h=720",
            EncoderFamily::Qsv => "vpp_qsv=w=1280:h=720",
            // AMF decodes in system memory, so the software scaler applies
            EncoderFamily::Amf | EncoderFamily::SoftX265 | EncoderFamily::SoftX264 => {
                "scale=1280:720"
            }
        };
        argv.push("-vf".into());
        argv.push(filter.to_string());
    }

    if req.encoding.audio_encoder == "copy" {
        argv.extend(["-c:a", "copy"].map(String::from));
    } else {
        argv.push("-c:a".into());
        argv.push(req.encoding.audio_encoder.clone());
        argv.extend(["-b:a", "192k"].map(String::from));
    }

    argv.push(req.dest.to_string_lossy().to_string());

    TranscodePlan {
        argv,
        tool: ToolKind::Ffmpeg,
        family,
        fell_back,
        progress: ProgressFormat::FfmpegTime {
            duration_secs: req.media.duration_secs,
        },
    }
}
