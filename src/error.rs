use thiserror::Error;

/// Failure taxonomy for the detection pipeline and its side channels.
///
/// `InvalidArgument` surfaces to the caller as-is and terminates the call.
/// Decode, inference and postprocess failures collapse to an internal error
/// on the unary path, but on the streaming path they are caught per frame
/// and turned into an empty result so the stream survives. `Storage` is
/// logged only and never reaches the RPC caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to decode image: {0}")]
    Decode(#[source] anyhow::Error),
    #[error("inference engine failure: {0}")]
    Inference(#[source] anyhow::Error),
    #[error("malformed model output: {0}")]
    Postprocess(String),
    #[error("frame storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}
