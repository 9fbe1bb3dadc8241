//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A setting value is out of its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Shared-storage and state paths
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root directory where the ripper deposits raw output
    #[serde(default = "default_raw_path")]
    pub raw_path: PathBuf,
    /// Root directory for published transcodes
    #[serde(default = "default_completed_path")]
    pub completed_path: PathBuf,
    /// Local scratch directory for in-flight transcodes
    #[serde(default = "default_work_path")]
    pub work_path: PathBuf,
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_raw_path() -> PathBuf {
    PathBuf::from("/data/raw")
}

fn default_completed_path() -> PathBuf {
    PathBuf::from("/data/completed")
}

fn default_work_path() -> PathBuf {
    PathBuf::from("/data/work")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/data/db/transcoder.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_path: default_raw_path(),
            completed_path: default_completed_path(),
            work_path: default_work_path(),
            db_path: default_db_path(),
        }
    }
}

/// Output tree layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_movies_subdir")]
    pub movies_subdir: String,
    #[serde(default = "default_tv_subdir")]
    pub tv_subdir: String,
    #[serde(default = "default_audio_subdir")]
    pub audio_subdir: String,
    /// Container extension for transcoded video output
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
}

fn default_movies_subdir() -> String {
    "movies".to_string()
}

fn default_tv_subdir() -> String {
    "tv".to_string()
}

fn default_audio_subdir() -> String {
    "audio".to_string()
}

fn default_output_extension() -> String {
    "mkv".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            movies_subdir: default_movies_subdir(),
            tv_subdir: default_tv_subdir(),
            audio_subdir: default_audio_subdir(),
            output_extension: default_output_extension(),
        }
    }
}

/// Encoder selection and tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    /// Video encoder name (validated against the allowlist at startup)
    #[serde(default = "default_video_encoder")]
    pub video_encoder: String,
    /// Constant-quality value, 0-51 (lower is better)
    #[serde(default = "default_video_quality")]
    pub video_quality: u8,
    /// Audio encoder, or "copy" for passthrough
    #[serde(default = "default_audio_encoder")]
    pub audio_encoder: String,
    /// Subtitle handling: all, none, first
    #[serde(default = "default_subtitle_mode")]
    pub subtitle_mode: String,
    /// HandBrake preset for HD-and-below sources
    #[serde(default = "default_handbrake_preset")]
    pub handbrake_preset: String,
    /// HandBrake preset for UHD sources
    #[serde(default = "default_handbrake_preset_4k")]
    pub handbrake_preset_4k: String,
    /// Optional preset JSON imported into HandBrake before selecting the preset
    #[serde(default)]
    pub handbrake_preset_file: String,
    /// Render node used by VAAPI and QSV
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: PathBuf,
}

fn default_video_encoder() -> String {
    "nvenc_h265".to_string()
}

fn default_video_quality() -> u8 {
    22
}

fn default_audio_encoder() -> String {
    "copy".to_string()
}

fn default_subtitle_mode() -> String {
    "all".to_string()
}

fn default_handbrake_preset() -> String {
    "H.265 NVENC 1080p".to_string()
}

fn default_handbrake_preset_4k() -> String {
    "H.265 NVENC 2160p 4K".to_string()
}

fn default_vaapi_device() -> PathBuf {
    PathBuf::from("/dev/dri/renderD128")
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            video_encoder: default_video_encoder(),
            video_quality: default_video_quality(),
            audio_encoder: default_audio_encoder(),
            subtitle_mode: default_subtitle_mode(),
            handbrake_preset: default_handbrake_preset(),
            handbrake_preset_4k: default_handbrake_preset_4k(),
            handbrake_preset_file: String::new(),
            vaapi_device: default_vaapi_device(),
        }
    }
}

/// Worker runtime knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Max concurrent transcodes (1 for a single GPU)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Seconds the source tree must stay unchanged before it counts as stable
    #[serde(default = "default_stabilize_seconds")]
    pub stabilize_seconds: u64,
    /// Max times a failed job may be requeued (0-10)
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Free space to keep on the work volume, in GiB
    #[serde(default = "default_minimum_free_space_gb")]
    pub minimum_free_space_gb: u64,
    /// Remove the raw source directory after a successful publish
    #[serde(default = "default_delete_source")]
    pub delete_source: bool,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_stabilize_seconds() -> u64 {
    60
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_minimum_free_space_gb() -> u64 {
    10
}

fn default_delete_source() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            stabilize_seconds: default_stabilize_seconds(),
            max_retry_count: default_max_retry_count(),
            minimum_free_space_gb: default_minimum_free_space_gb(),
            delete_source: default_delete_source(),
        }
    }
}

/// API and webhook authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthConfig {
    /// Require X-API-Key on the control-plane endpoints
    #[serde(default)]
    pub require_api_auth: bool,
    /// Comma-separated API keys, each optionally prefixed with "role:"
    #[serde(default)]
    pub api_keys: String,
    /// Shared secret checked against X-Webhook-Secret when non-empty
    #[serde(default)]
    pub webhook_secret: String,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Settings {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Load configuration from file (if present) and apply environment overrides
    ///
    /// A missing file is not an error: the service can be configured entirely
    /// through the environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut settings = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Every setting can be overridden; the variable names match the
    /// deployment documentation (RAW_PATH, VIDEO_ENCODER, MAX_RETRY_COUNT, ...).
    pub fn apply_env_overrides(&mut self) {
        override_path(&mut self.paths.raw_path, "RAW_PATH");
        override_path(&mut self.paths.completed_path, "COMPLETED_PATH");
        override_path(&mut self.paths.work_path, "WORK_PATH");
        override_path(&mut self.paths.db_path, "DB_PATH");

        override_string(&mut self.output.movies_subdir, "MOVIES_SUBDIR");
        override_string(&mut self.output.tv_subdir, "TV_SUBDIR");
        override_string(&mut self.output.audio_subdir, "AUDIO_SUBDIR");
        override_string(&mut self.output.output_extension, "OUTPUT_EXTENSION");

        override_string(&mut self.encoding.video_encoder, "VIDEO_ENCODER");
        override_parse(&mut self.encoding.video_quality, "VIDEO_QUALITY");
        override_string(&mut self.encoding.audio_encoder, "AUDIO_ENCODER");
        override_string(&mut self.encoding.subtitle_mode, "SUBTITLE_MODE");
        override_string(&mut self.encoding.handbrake_preset, "HANDBRAKE_PRESET");
        override_string(&mut self.encoding.handbrake_preset_4k, "HANDBRAKE_PRESET_4K");
        override_string(
            &mut self.encoding.handbrake_preset_file,
            "HANDBRAKE_PRESET_FILE",
        );
        override_path(&mut self.encoding.vaapi_device, "VAAPI_DEVICE");

        override_parse(&mut self.runtime.max_concurrent, "MAX_CONCURRENT");
        override_parse(&mut self.runtime.stabilize_seconds, "STABILIZE_SECONDS");
        override_parse(&mut self.runtime.max_retry_count, "MAX_RETRY_COUNT");
        override_parse(
            &mut self.runtime.minimum_free_space_gb,
            "MINIMUM_FREE_SPACE_GB",
        );
        override_bool(&mut self.runtime.delete_source, "DELETE_SOURCE");

        override_bool(&mut self.auth.require_api_auth, "REQUIRE_API_AUTH");
        override_string(&mut self.auth.api_keys, "API_KEYS");
        override_string(&mut self.auth.webhook_secret, "WEBHOOK_SECRET");
    }

    /// Range checks for numeric settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoding.video_quality > 51 {
            return Err(ConfigError::Invalid(format!(
                "video_quality {} out of range 0-51",
                self.encoding.video_quality
            )));
        }
        if self.runtime.max_retry_count > 10 {
            return Err(ConfigError::Invalid(format!(
                "max_retry_count {} out of range 0-10",
                self.runtime.max_retry_count
            )));
        }
        if self.runtime.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.output.output_extension.is_empty() {
            return Err(ConfigError::Invalid(
                "output_extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_string(target: &mut String, var: &str) {
    if let Ok(val) = env::var(var) {
        *target = val;
    }
}

fn override_path(target: &mut PathBuf, var: &str) {
    if let Ok(val) = env::var(var) {
        if !val.is_empty() {
            *target = PathBuf::from(val);
        }
    }
}

fn override_parse<T: std::str::FromStr>(target: &mut T, var: &str) {
    if let Ok(val) = env::var(var) {
        if let Ok(parsed) = val.parse::<T>() {
            *target = parsed;
        }
    }
}

fn override_bool(target: &mut bool, var: &str) {
    if let Ok(val) = env::var(var) {
        // Accept "true", "1", "yes" as true; "false", "0", "no" as false
        match val.to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            _ => {} // Invalid value, keep existing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "RAW_PATH",
        "COMPLETED_PATH",
        "WORK_PATH",
        "DB_PATH",
        "MOVIES_SUBDIR",
        "TV_SUBDIR",
        "AUDIO_SUBDIR",
        "OUTPUT_EXTENSION",
        "VIDEO_ENCODER",
        "VIDEO_QUALITY",
        "AUDIO_ENCODER",
        "SUBTITLE_MODE",
        "HANDBRAKE_PRESET",
        "HANDBRAKE_PRESET_4K",
        "HANDBRAKE_PRESET_FILE",
        "VAAPI_DEVICE",
        "MAX_CONCURRENT",
        "STABILIZE_SECONDS",
        "MAX_RETRY_COUNT",
        "MINIMUM_FREE_SPACE_GB",
        "DELETE_SOURCE",
        "REQUIRE_API_AUTH",
        "API_KEYS",
        "WEBHOOK_SECRET",
    ];

    fn clear_env_vars() {
        for var in ALL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(settings.paths.raw_path, PathBuf::from("/data/raw"));
        assert_eq!(
            settings.paths.completed_path,
            PathBuf::from("/data/completed")
        );
        assert_eq!(settings.output.movies_subdir, "movies");
        assert_eq!(settings.output.tv_subdir, "tv");
        assert_eq!(settings.output.audio_subdir, "audio");
        assert_eq!(settings.encoding.video_encoder, "nvenc_h265");
        assert_eq!(settings.encoding.video_quality, 22);
        assert_eq!(settings.runtime.max_concurrent, 1);
        assert_eq!(settings.runtime.stabilize_seconds, 60);
        assert_eq!(settings.runtime.max_retry_count, 3);
        assert_eq!(settings.runtime.minimum_free_space_gb, 10);
        assert!(settings.runtime.delete_source);
        assert!(!settings.auth.require_api_auth);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[paths]
raw_path = "/mnt/rips"

[encoding]
video_quality = 18
"#;
        let settings = Settings::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(settings.paths.raw_path, PathBuf::from("/mnt/rips"));
        assert_eq!(settings.paths.work_path, PathBuf::from("/data/work")); // default
        assert_eq!(settings.encoding.video_quality, 18);
        assert_eq!(settings.encoding.video_encoder, "nvenc_h265"); // default
    }

    #[test]
    fn test_env_overrides_paths_and_encoder() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut settings = Settings::default();
        env::set_var("RAW_PATH", "/srv/raw");
        env::set_var("VIDEO_ENCODER", "vaapi_h265");
        env::set_var("DELETE_SOURCE", "no");
        settings.apply_env_overrides();
        clear_env_vars();

        assert_eq!(settings.paths.raw_path, PathBuf::from("/srv/raw"));
        assert_eq!(settings.encoding.video_encoder, "vaapi_h265");
        assert!(!settings.runtime.delete_source);
    }

    #[test]
    fn test_env_override_invalid_number_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut settings = Settings::default();
        env::set_var("VIDEO_QUALITY", "not-a-number");
        settings.apply_env_overrides();
        clear_env_vars();

        assert_eq!(settings.encoding.video_quality, 22);
    }

    #[test]
    fn test_validate_rejects_out_of_range_quality() {
        let mut settings = Settings::default();
        settings.encoding.video_quality = 52;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_retry() {
        let mut settings = Settings::default();
        settings.runtime.max_retry_count = 11;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.runtime.max_concurrent = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_falls_back_to_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("WORK_PATH", "/scratch");
        let settings = Settings::load("/nonexistent/config.toml").expect("should load");
        clear_env_vars();

        assert_eq!(settings.paths.work_path, PathBuf::from("/scratch"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_config_parses_all_sections(
            quality in 0u8..=51,
            stabilize in 1u64..3600,
            retries in 0u32..=10,
            min_free in 0u64..100,
            delete in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[encoding]
video_quality = {}

[runtime]
stabilize_seconds = {}
max_retry_count = {}
minimum_free_space_gb = {}
delete_source = {}
"#,
                quality, stabilize, retries, min_free, delete
            );

            let settings = Settings::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(settings.encoding.video_quality, quality);
            prop_assert_eq!(settings.runtime.stabilize_seconds, stabilize);
            prop_assert_eq!(settings.runtime.max_retry_count, retries);
            prop_assert_eq!(settings.runtime.minimum_free_space_gb, min_free);
            prop_assert_eq!(settings.runtime.delete_source, delete);
            prop_assert!(settings.validate().is_ok());
        }
    }
}
