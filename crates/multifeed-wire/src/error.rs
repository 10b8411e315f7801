/// Errors returned by the multifeed wire layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame serialization failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("frame deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid feed key: {0}")]
    InvalidKey(String),

    #[error("stream is closed")]
    Closed,
}
