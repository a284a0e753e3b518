use crate::{error::Error, proto::Frame};
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_STREAM_KEY: &str = "default";
pub const DEFAULT_CAMERA_KEY: &str = "cam";
const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub root: PathBuf,
}

/// Best-effort frame persistence under `<root>/<stream>/<camera>/`.
/// Constructed once at startup; failures are reported to the caller as
/// `Error::Storage` and must never gate the inference path.
pub struct FrameSink {
    root: PathBuf,
}

#[derive(Debug)]
pub struct SavedFrame {
    pub jpeg_path: PathBuf,
    pub metadata_path: PathBuf,
}

#[derive(Serialize)]
struct FrameMetadata<'a> {
    stream_id: &'a str,
    camera_id: &'a str,
    frame_index: u64,
    timestamp_ns: u64,
    width: u32,
    height: u32,
    format: i32,
    saved_at: f64,
    jpeg_path: String,
}

impl FrameSink {
    pub fn new(config: SinkConfig) -> Self {
        Self { root: config.root }
    }

    /// Persist the raw frame bytes and a metadata record. File names derive
    /// from the frame identity, so re-saving the same frame overwrites in
    /// place instead of duplicating.
    pub async fn save(&self, frame: &Frame) -> Result<SavedFrame, Error> {
        self.save_inner(frame).await.map_err(Error::Storage)
    }

    async fn save_inner(&self, frame: &Frame) -> anyhow::Result<SavedFrame> {
        let dir = self
            .root
            .join(sanitize_key(&frame.stream_id, DEFAULT_STREAM_KEY))
            .join(sanitize_key(&frame.camera_id, DEFAULT_CAMERA_KEY));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let base = format!("img_{}_{}", frame.frame_index, frame.timestamp_ns);
        let jpeg_path = dir.join(format!("{base}.jpg"));
        let metadata_path = dir.join(format!("{base}.json"));

        tokio::fs::write(&jpeg_path, &frame.data)
            .await
            .with_context(|| format!("writing {}", jpeg_path.display()))?;

        let metadata = FrameMetadata {
            stream_id: &frame.stream_id,
            camera_id: &frame.camera_id,
            frame_index: frame.frame_index,
            timestamp_ns: frame.timestamp_ns,
            width: frame.width,
            height: frame.height,
            format: frame.format,
            saved_at: chrono::Utc::now().timestamp_micros() as f64 / 1e6,
            jpeg_path: jpeg_path.to_string_lossy().into_owned(),
        };
        tokio::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)
            .await
            .with_context(|| format!("writing {}", metadata_path.display()))?;

        debug!(jpeg = %jpeg_path.display(), "Frame persisted");
        Ok(SavedFrame {
            jpeg_path,
            metadata_path,
        })
    }
}

/// Reduce an identifier to a bounded `[A-Za-z0-9._-]` path segment: every
/// other character becomes `_` and the result is truncated to 128
/// characters. Empty and all-dots results (`..` would escape the root)
/// fall back to the given default token.
pub fn sanitize_key(id: &str, fallback: &str) -> String {
    let key: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_KEY_LEN)
        .collect();
    if key.is_empty() || key.chars().all(|c| c == '.') {
        fallback.to_string()
    } else {
        key
    }
}
