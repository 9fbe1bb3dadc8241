//! ARM Transcoder
//!
//! Durable transcode-job server: webhook admission, a persistent job queue,
//! and a single-flight background worker that drives each job through
//! stabilize, resolve, plan, execute, publish, and cleanup.

pub mod admission;
pub mod auth;
pub mod classify;
pub mod command_guard;
pub mod executor;
pub mod path_guard;
pub mod planner;
pub mod probe;
pub mod server;
pub mod space;
pub mod stability;
pub mod store;
pub mod worker;

pub use admission::{Admission, AdmissionError, AdmissionOutcome};
pub use arm_transcoder_config as config;
pub use arm_transcoder_config::Settings;
pub use auth::ApiKeys;
pub use classify::Classification;
pub use command_guard::{ToolPaths, ValidatedEncoding};
pub use planner::{plan_transcode, EncoderFamily, TranscodePlan};
pub use probe::{detect_gpu_support, GpuSupport, MediaInfo, ResolutionClass};
pub use server::{create_router, AppState};
pub use store::{ErrorKind, Job, JobStatus, NewJob, Store, StoreError};
pub use worker::{Worker, WorkerHandle};
