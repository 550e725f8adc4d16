use thiserror::Error;

#[derive(Error, Debug)]
pub enum EpilogueError {
    #[error("Buffer `{tensor}` too small: requires {required} elements, has {actual}")]
    BufferTooSmall { tensor: &'static str, required: usize, actual: usize },
    #[error("Tensor `{tensor}` misaligned: contiguous extent {extent} is not a multiple of {required} elements")]
    Misaligned { tensor: &'static str, required: usize, extent: usize },
    #[error("Top-k softmax needs the whole row in one epilogue subtile: n = {n}, subtile width = {width}")]
    RowExceedsSubtile { n: usize, width: usize },
    #[error("Top-k softmax with k = {k} exceeds row length {n}")]
    TopKExceedsRow { k: usize, n: usize },
    #[error("Missing tensor: {0}")]
    MissingTensor(&'static str),
    #[error("Element type mismatch for `{tensor}`: expected {expected}, got {actual}")]
    ElementMismatch { tensor: &'static str, expected: &'static str, actual: &'static str },
    #[error("Unsupported pipeline: {0}")]
    UnsupportedPipeline(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
