use crate::LogLevel;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Remote object detection service over gRPC")]
pub struct Cli {
    /// The port on which the server will listen for gRPC requests.
    #[arg(long, default_value_t = 8032)]
    pub port: u16,
    /// Path to the ONNX detection model file.
    #[clap(long)]
    pub model: PathBuf,
    /// Minimum confidence for a detection to be kept.
    #[clap(long, default_value_t = 0.25)]
    pub confidence_threshold: f32,
    /// Keep at most this many detections per image.
    #[clap(long, default_value_t = 100)]
    pub top_k: usize,
    /// Root directory for persisted stream frames.
    #[clap(long, default_value = "./received")]
    pub save_dir: PathBuf,
    /// Intra thread parallelism max is cpu cores - 1
    #[clap(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[clap(long, default_value_t = 192)]
    pub inter_threads: usize,
    /// Pending detection requests before the server starts shedding load.
    #[clap(long, default_value_t = 16)]
    pub worker_queue_size: usize,
    /// Sets the level of logging
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[clap(long)]
    pub log_path: Option<PathBuf>,
}
