//! CLI entry point for the ARM transcoder daemon.
//!
//! Loads settings, validates the encoder configuration, recovers orphaned
//! jobs, then runs the webhook server and the background worker until a
//! shutdown signal arrives.

use arm_transcoder::{
    command_guard, create_router, detect_gpu_support, Admission, ApiKeys, AppState, Settings,
    Store, ToolPaths, ValidatedEncoding, Worker,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ARM Transcoder - GPU transcode hand-off for Automatic Ripping Machine
#[derive(Parser, Debug)]
#[command(name = "arm-transcoder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an optional config.toml; the environment overrides it
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address for the HTTP server
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arm_transcoder=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let settings = match Settings::load(&args.config) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            tracing::error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let encoding = match ValidatedEncoding::from_settings(&settings.encoding) {
        Ok(encoding) => encoding,
        Err(e) => {
            tracing::error!("invalid encoder configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(preset_file) = &encoding.handbrake_preset_file {
        if !command_guard::check_preset_file(preset_file) {
            tracing::error!(
                "handbrake_preset_file does not exist: {}",
                preset_file.display()
            );
            return ExitCode::FAILURE;
        }
    }

    let tools = match ToolPaths::resolve() {
        Ok(tools) => tools,
        Err(e) => {
            tracing::error!("required encoder binaries missing: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        ffmpeg = %tools.ffmpeg.display(),
        handbrake = ?tools.handbrake,
        "encoder tools resolved"
    );

    let gpu = detect_gpu_support(
        &tools.ffmpeg,
        tools.handbrake.as_deref(),
        &encoding.vaapi_device,
    )
    .await;

    for dir in [&settings.paths.work_path, &settings.paths.completed_path] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!("failed to create {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    }

    let store = match Store::open(&settings.paths.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to open job store: {e}");
            return ExitCode::FAILURE;
        }
    };
    match store.recover_orphans() {
        Ok(0) => {}
        Ok(n) => tracing::info!("requeued {n} interrupted job(s) from previous run"),
        Err(e) => {
            tracing::error!("orphan recovery failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    let worker = Worker::new(store.clone(), settings.clone(), encoding, tools, gpu);
    let handle = worker.handle();
    let worker_task = tokio::spawn(worker.run());

    let state = AppState {
        store,
        admission: Arc::new(Admission::new()),
        api_keys: Arc::new(ApiKeys::from_config(&settings.auth)),
        worker: handle.clone(),
        settings,
    };
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {}: {e}", args.listen);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("listening on {}", args.listen);

    let shutdown_handle = handle.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for shutdown signal");
        }
        tracing::info!("shutdown requested");
        shutdown_handle.request_shutdown();
    });

    if let Err(e) = serve.await {
        tracing::error!("server error: {e}");
        handle.request_shutdown();
        let _ = worker_task.await;
        return ExitCode::FAILURE;
    }

    // The worker parks any in-flight job before exiting
    if let Err(e) = worker_task.await {
        tracing::error!("worker task panicked: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
