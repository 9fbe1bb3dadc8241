//! The background worker: a single-flight loop driving each job through its
//! lifecycle.
//!
//! One worker task claims the oldest PENDING job and walks it through
//! stabilize -> resolve -> admit -> plan -> execute -> publish -> cleanup.
//! Failures become terminal FAILED records with a taxonomy kind; shutdown
//! mid-job parks the job back to PENDING so the next process re-runs it.
//! Infrastructure errors (store unreachable, claim failures) back off
//! exponentially and never kill the loop.

use crate::classify::{self, Classification};
use crate::command_guard::{ToolPaths, ValidatedEncoding};
use crate::executor::{self, ExecOutcome};
use crate::path_guard::{self, PathGuardError};
use crate::planner::{plan_transcode, PlanRequest};
use crate::probe::{self, GpuSupport};
use crate::space::{self, SpaceCheck};
use crate::stability::{self, StabilityOutcome, StabilizeParams};
use crate::store::{ErrorKind, Job, JobStatus, Store};
use arm_transcoder_config::Settings;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Idle poll interval while the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);
/// First backoff after an infrastructure error.
const BACKOFF_START: Duration = Duration::from_secs(1);
/// Backoff ceiling for infrastructure errors.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Observable worker state shared with the control plane.
#[derive(Debug, Default)]
pub struct WorkerState {
    running: AtomicBool,
    current: Mutex<Option<String>>,
}

/// Handle the HTTP layer uses to wake, observe, and stop the worker.
#[derive(Clone)]
pub struct WorkerHandle {
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    /// Wakes the worker after a durable insert.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Title of the job currently being processed.
    pub fn current_job(&self) -> Option<String> {
        self.state.current.lock().expect("worker state poisoned").clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// How a job left the drive path, before the terminal store write.
enum DriveEnd {
    /// Published successfully to this path.
    Published(PathBuf),
    /// Failed with a taxonomy kind and message.
    Failed(ErrorKind, String),
    /// Shutdown interrupted the job; it was parked back to PENDING.
    Parked,
}

/// The background transcode worker.
pub struct Worker {
    store: Arc<Store>,
    settings: Arc<Settings>,
    encoding: ValidatedEncoding,
    tools: ToolPaths,
    gpu: GpuSupport,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    state: Arc<WorkerState>,
    /// Stabilizer timing; shrunk by tests.
    pub(crate) stabilize: StabilizeParams,
}

impl Worker {
    pub fn new(
        store: Arc<Store>,
        settings: Arc<Settings>,
        encoding: ValidatedEncoding,
        tools: ToolPaths,
        gpu: GpuSupport,
    ) -> Self {
        let stabilize = StabilizeParams::with_window_secs(settings.runtime.stabilize_seconds);
        Self {
            store,
            settings,
            encoding,
            tools,
            gpu,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            state: Arc::new(WorkerState::default()),
            stabilize,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            wake: self.wake.clone(),
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
        }
    }

    /// Main worker loop. Exits when shutdown is requested.
    pub async fn run(self) {
        self.state.running.store(true, Ordering::SeqCst);
        tracing::info!("transcode worker started");

        let mut backoff = BACKOFF_START;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.store.claim_next() {
                Ok(Some(job)) => {
                    backoff = BACKOFF_START;
                    self.process_job(job).await;
                }
                Ok(None) => {
                    backoff = BACKOFF_START;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("claim failed: {e}; backing off {}s", backoff.as_secs());
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        self.state.running.store(false, Ordering::SeqCst);
        tracing::info!("transcode worker stopped");
    }

    /// Drives one claimed job to a terminal state (or parks it on shutdown).
    pub(crate) async fn process_job(&self, job: Job) {
        tracing::info!(job = job.id, title = %job.title, "processing job");
        *self.state.current.lock().expect("worker state poisoned") = Some(job.title.clone());

        let work_dir = self
            .settings
            .paths
            .work_path
            .join(format!("job-{}", job.id));

        let end = self.drive(&job, &work_dir).await;

        // The scratch directory goes away no matter how the job ended
        if work_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&work_dir) {
                tracing::warn!(job = job.id, "failed to clean work dir: {e}");
            }
        }

        match end {
            DriveEnd::Published(output) => {
                match self
                    .store
                    .finish(job.id, JobStatus::Completed, None, None, Some(&output))
                {
                    Ok(_) => tracing::info!(job = job.id, output = %output.display(), "job completed"),
                    Err(e) => tracing::error!(job = job.id, "failed to record completion: {e}"),
                }
            }
            DriveEnd::Failed(kind, message) => {
                // A job out of retries fails terminally, marked so the
                // control plane refuses further requeues up front.
                let kind = if job.retry_count >= self.settings.runtime.max_retry_count {
                    ErrorKind::RetryExhausted
                } else {
                    kind
                };
                tracing::warn!(job = job.id, kind = kind.as_str(), "job failed: {message}");
                if let Err(e) = self.store.finish(
                    job.id,
                    JobStatus::Failed,
                    Some(kind),
                    Some(&message),
                    None,
                ) {
                    tracing::error!(job = job.id, "failed to record failure: {e}");
                }
            }
            DriveEnd::Parked => {
                tracing::info!(job = job.id, "job parked for next startup");
            }
        }

        *self.state.current.lock().expect("worker state poisoned") = None;
    }

    async fn drive(&self, job: &Job, work_dir: &Path) -> DriveEnd {
        let raw_root = &self.settings.paths.raw_path;

        // STABILIZING: watch the un-canonicalized join; the hint was screened
        // at admission so it cannot address anything outside the raw root.
        let watch_path = raw_root.join(&job.source_hint);
        match stability::wait_for_stable(&watch_path, self.stabilize, &self.shutdown).await {
            StabilityOutcome::Stable => {}
            StabilityOutcome::Missing => {
                return DriveEnd::Failed(
                    ErrorKind::Missing,
                    format!("source directory never appeared: {}", job.source_hint),
                );
            }
            StabilityOutcome::Unstable => {
                return DriveEnd::Failed(
                    ErrorKind::Unstable,
                    "source still changing at the stabilization ceiling".to_string(),
                );
            }
            StabilityOutcome::Cancelled => return self.park(job).await,
        }

        // RESOLVING
        let source = match path_guard::resolve(raw_root, &job.source_hint, true) {
            Ok(path) => path,
            Err(PathGuardError::NotFound(_)) => {
                return DriveEnd::Failed(
                    ErrorKind::Missing,
                    format!("source not found under raw root: {}", job.source_hint),
                );
            }
            Err(e) => {
                return DriveEnd::Failed(ErrorKind::Missing, format!("source rejected: {e}"));
            }
        };
        if let Err(e) = self.store.set_source_resolved(job.id, &source) {
            tracing::error!(job = job.id, "failed to record resolved source: {e}");
        }

        // ADMIT
        let source_bytes = space::dir_size(&source);
        match space::check_space(
            &self.settings.paths.work_path,
            source_bytes,
            self.settings.runtime.minimum_free_space_gb,
        ) {
            SpaceCheck::Sufficient { .. } => {}
            SpaceCheck::Insufficient {
                free_bytes,
                required_bytes,
            } => {
                return DriveEnd::Failed(
                    ErrorKind::Nospace,
                    format!(
                        "insufficient disk space: {free_bytes} bytes free, {required_bytes} required"
                    ),
                );
            }
            SpaceCheck::Unknown => {
                tracing::warn!(job = job.id, "work volume free space unknown, admitting anyway");
            }
        }

        // PLANNING starts with classification; music rips skip the encoder
        let classification = classify::classify_source(&source, &job.title);
        if classification == Classification::Audio {
            return self.passthrough_audio(job, &source).await;
        }

        let tracks = classify::discover_video_files(&source);
        let Some(main_feature) = tracks.first().cloned() else {
            return DriveEnd::Failed(
                ErrorKind::Missing,
                format!("no video or audio files found in {}", source.display()),
            );
        };

        let media = match probe::probe_media(&self.tools.ffprobe, &main_feature).await {
            Ok(media) => media,
            Err(e) => {
                return DriveEnd::Failed(ErrorKind::Encode, format!("probe failed: {e}"));
            }
        };

        // Output takes the rip directory's name; the notification title is
        // display-only and often generic ("ARM notification").
        let clean_title = classify::clean_title(&job.source_hint);
        let output_dir = work_dir.join("output");
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            return DriveEnd::Failed(
                ErrorKind::Encode,
                format!("failed to prepare work directory: {e}"),
            );
        }
        let scratch_output = output_dir.join(format!(
            "{clean_title}.{}",
            self.settings.output.output_extension
        ));

        let plan = plan_transcode(PlanRequest {
            tools: &self.tools,
            encoding: &self.encoding,
            gpu: &self.gpu,
            media,
            source: &main_feature,
            dest: &scratch_output,
        });
        if plan.fell_back {
            tracing::warn!(
                job = job.id,
                configured = %self.encoding.video_encoder,
                "configured encoder unavailable, using software x265"
            );
        }

        let main_feature_name = main_feature
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        if let Err(e) = self.store.set_plan(
            job.id,
            classification,
            Some(plan.family.as_str()),
            tracks.len() as u32,
            main_feature_name.as_deref(),
        ) {
            tracing::error!(job = job.id, "failed to record plan: {e}");
        }

        // EXECUTING
        let store = self.store.clone();
        let job_id = job.id;
        let on_progress = move |p: f64| {
            if let Err(e) = store.update_progress(job_id, p) {
                tracing::debug!(job = job_id, "progress update dropped: {e}");
            }
        };

        match executor::run(&plan.argv, &on_progress, plan.progress, &self.shutdown).await {
            Ok(ExecOutcome::Exited { success: true, .. }) => {}
            Ok(ExecOutcome::Exited {
                exit_code,
                stderr_tail,
                ..
            }) => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                return DriveEnd::Failed(
                    ErrorKind::Encode,
                    format!("encoder exited with {code}: {}", stderr_tail.trim()),
                );
            }
            Ok(ExecOutcome::Cancelled { .. }) => return self.park(job).await,
            Err(e) => {
                return DriveEnd::Failed(ErrorKind::Encode, format!("encoder failed: {e}"));
            }
        }

        if !scratch_output.is_file() {
            return DriveEnd::Failed(
                ErrorKind::Encode,
                "encoder exited cleanly but produced no output".to_string(),
            );
        }

        // PUBLISHING
        let subdir = self.classification_subdir(classification);
        let publish_dir = self.settings.paths.completed_path.join(subdir);
        let target = publish_dir.join(format!(
            "{clean_title}.{}",
            self.settings.output.output_extension
        ));
        if let Err(e) =
            std::fs::create_dir_all(&publish_dir).and_then(|_| move_file(&scratch_output, &target))
        {
            return DriveEnd::Failed(ErrorKind::Publish, format!("publish failed: {e}"));
        }

        // CLEANUP: losing the source after a good publish never fails the job
        if self.settings.runtime.delete_source {
            if let Err(e) = std::fs::remove_dir_all(&source) {
                tracing::warn!(job = job.id, "failed to remove source: {e}");
            }
        }

        DriveEnd::Published(target)
    }

    /// Copies a music rip straight into the audio tree, no encoder involved.
    async fn passthrough_audio(&self, job: &Job, source: &Path) -> DriveEnd {
        let audio_files = classify::discover_audio_files(source);
        let clean_title = classify::clean_title(&job.source_hint);
        let output_dir = self
            .settings
            .paths
            .completed_path
            .join(&self.settings.output.audio_subdir)
            .join(&clean_title);

        tracing::info!(
            job = job.id,
            count = audio_files.len(),
            "audio passthrough to {}",
            output_dir.display()
        );

        if let Err(e) = self.store.set_plan(
            job.id,
            Classification::Audio,
            None,
            audio_files.len() as u32,
            None,
        ) {
            tracing::error!(job = job.id, "failed to record plan: {e}");
        }

        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            return DriveEnd::Failed(ErrorKind::Publish, format!("publish failed: {e}"));
        }
        for file in &audio_files {
            let name = file.file_name().unwrap_or_default();
            if let Err(e) = std::fs::copy(file, output_dir.join(name)) {
                return DriveEnd::Failed(
                    ErrorKind::Publish,
                    format!("failed to copy {}: {e}", file.display()),
                );
            }
        }

        if self.settings.runtime.delete_source {
            if let Err(e) = std::fs::remove_dir_all(source) {
                tracing::warn!(job = job.id, "failed to remove source: {e}");
            }
        }

        DriveEnd::Published(output_dir)
    }

    /// Parks the job back to PENDING after a shutdown interruption.
    async fn park(&self, job: &Job) -> DriveEnd {
        if let Err(e) = self.store.park_pending(job.id, ErrorKind::Shutdown) {
            tracing::error!(job = job.id, "failed to park job: {e}");
        }
        DriveEnd::Parked
    }

    fn classification_subdir(&self, classification: Classification) -> &str {
        match classification {
            Classification::Movie => &self.settings.output.movies_subdir,
            Classification::Tv => &self.settings.output.tv_subdir,
            Classification::Audio => &self.settings.output.audio_subdir,
        }
    }
}

/// Moves a file, falling back to copy+remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)?;
    std::fs::remove_file(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewJob;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dirs: TempDir,
        worker: Worker,
        store: Arc<Store>,
        raw: PathBuf,
        completed: PathBuf,
    }

    fn fixture() -> Fixture {
        let dirs = TempDir::new().unwrap();
        let raw = dirs.path().join("raw");
        let completed = dirs.path().join("completed");
        let work = dirs.path().join("work");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::create_dir_all(&completed).unwrap();
        std::fs::create_dir_all(&work).unwrap();

        let mut settings = Settings::default();
        settings.paths.raw_path = raw.clone();
        settings.paths.completed_path = completed.clone();
        settings.paths.work_path = work;
        settings.runtime.minimum_free_space_gb = 0;

        let encoding =
            ValidatedEncoding::from_settings(&arm_transcoder_config::EncodingConfig::default())
                .unwrap();
        let tools = ToolPaths {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            ffprobe: PathBuf::from("/usr/bin/ffprobe"),
            handbrake: None,
        };
        let store = Arc::new(Store::open_in_memory().unwrap());

        let mut worker = Worker::new(
            store.clone(),
            Arc::new(settings),
            encoding,
            tools,
            GpuSupport::default(),
        );
        worker.stabilize = StabilizeParams {
            window: Duration::from_millis(30),
            interval: Duration::from_millis(10),
            ceiling: Duration::from_millis(300),
        };

        Fixture {
            _dirs: dirs,
            worker,
            store,
            raw,
            completed,
        }
    }

    fn admit(store: &Store, title: &str) -> Job {
        store
            .insert(NewJob {
                title: title.to_string(),
                source_hint: title.to_string(),
                arm_job_id: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_audio_passthrough_completes_without_encoder() {
        let fx = fixture();
        let source = fx.raw.join("Best Of");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("track01.flac"), b"audio1").unwrap();
        std::fs::write(source.join("track02.flac"), b"audio2").unwrap();

        admit(&fx.store, "Best Of");
        let claimed = fx.store.claim_next().unwrap().unwrap();
        fx.worker.process_job(claimed).await;

        let job = fx.store.get(1).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert_eq!(job.classification, Some(Classification::Audio));
        assert_eq!(job.total_tracks, 2);

        let published = fx.completed.join("audio").join("Best Of");
        assert!(published.join("track01.flac").is_file());
        assert!(published.join("track02.flac").is_file());
        // delete_source defaults on, so the raw copy is gone
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_missing_source_fails_with_missing_kind() {
        let fx = fixture();
        admit(&fx.store, "Ghost");
        let claimed = fx.store.claim_next().unwrap().unwrap();
        fx.worker.process_job(claimed).await;

        let job = fx.store.get(1).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind.as_deref(), Some("missing"));
    }

    #[tokio::test]
    async fn test_empty_source_directory_fails_missing() {
        let fx = fixture();
        let source = fx.raw.join("Empty");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("notes.txt"), b"not media").unwrap();

        admit(&fx.store, "Empty");
        let claimed = fx.store.claim_next().unwrap().unwrap();
        fx.worker.process_job(claimed).await;

        let job = fx.store.get(1).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind.as_deref(), Some("missing"));
        assert!(job.error.unwrap().contains("no video or audio files"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_terminal_kind() {
        let fx = fixture();
        admit(&fx.store, "Ghost");

        // Burn through the retry budget
        for _ in 0..3 {
            let claimed = fx.store.claim_next().unwrap().unwrap();
            fx.worker.process_job(claimed).await;
            fx.store.requeue(1, 3).unwrap();
        }
        let claimed = fx.store.claim_next().unwrap().unwrap();
        fx.worker.process_job(claimed).await;

        let job = fx.store.get(1).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind.as_deref(), Some("retry_exhausted"));
        assert!(fx.store.requeue(1, 3).is_err());
    }

    #[tokio::test]
    async fn test_work_dir_removed_after_failure() {
        let fx = fixture();
        admit(&fx.store, "Ghost");
        let claimed = fx.store.claim_next().unwrap().unwrap();
        let work_dir = fx.worker.settings.paths.work_path.join("job-1");
        fx.worker.process_job(claimed).await;
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn test_worker_loop_drains_queue_and_stops() {
        let fx = fixture();
        let source = fx.raw.join("Mix");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("song.mp3"), b"x").unwrap();
        admit(&fx.store, "Mix");

        let handle = fx.worker.handle();
        let store = fx.store.clone();
        let run = tokio::spawn(fx.worker.run());

        // Give the loop time to pick up and finish the job
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get(1).unwrap().status == JobStatus::Completed {
                break;
            }
        }
        assert_eq!(store.get(1).unwrap().status, JobStatus::Completed);
        assert!(handle.is_running());

        handle.request_shutdown();
        run.await.unwrap();
        assert!(!handle.is_running());
    }
}
