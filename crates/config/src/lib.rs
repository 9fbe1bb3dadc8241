//! Configuration loading for the ARM transcoder daemon

mod config;

pub use config::{
    AuthConfig, ConfigError, EncodingConfig, OutputConfig, PathsConfig, RuntimeConfig, Settings,
};
