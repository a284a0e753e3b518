use clap::ValueEnum;
use cli::Cli;
use detector::{Detector, DetectorConfig};
use server::{VisionService, run_server};
use sink::{FrameSink, SinkConfig};
use std::{future::Future, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use worker::spawn_detector_worker;

pub mod cli;
pub mod detector;
pub mod engine;
pub mod error;
pub mod image;
pub mod postprocess;
pub mod server;
pub mod sink;
pub mod worker;

pub mod proto {
    tonic::include_proto!("vision");
}

/// Wire the full service: build the detector, spawn its worker thread,
/// construct the frame sink, and return the server future plus the token
/// that shuts it down and the worker handle to join afterwards.
pub fn visiond_service(
    args: Cli,
) -> anyhow::Result<(
    impl Future<Output = anyhow::Result<()>>,
    CancellationToken,
    std::thread::JoinHandle<()>,
)> {
    let detector_config = DetectorConfig {
        model: args.model.clone(),
        confidence_threshold: args.confidence_threshold,
        top_k: args.top_k,
        intra_threads: args.intra_threads,
        inter_threads: args.inter_threads,
    };
    let detector = Detector::new(&detector_config)?;
    let (detector_handle, worker_handle) = spawn_detector_worker(detector, args.worker_queue_size)?;

    let sink = FrameSink::new(SinkConfig {
        root: args.save_dir.clone(),
    });
    let service = VisionService::new(detector_handle, sink);

    let cancel_token = CancellationToken::new();
    let server_future = run_server(args.port, cancel_token.clone(), service);

    Ok((server_future, cancel_token, worker_handle))
}

pub fn init_logging(
    log_level: LogLevel,
    log_path: &Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let guard = if let Some(log_directory) = log_path {
        let file_appender = tracing_appender::rolling::daily(log_directory, "visiond.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        None
    };

    info!(?log_level, "Logging initialized");
    Ok(guard)
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}
