use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// Per-voice and mixer-internal failures never reach here — they are
/// logged and contained at the point of failure (see the crate's module
/// docs on error propagation policy).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad file: {0}")]
    BadFile(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no voice available")]
    NoVoice,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation in progress")]
    InProgress,

    #[error("audio device error: {0}")]
    DeviceError(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
