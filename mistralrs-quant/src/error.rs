use thiserror::Error;

/// Failure modes of this crate, per the error-kinds enumerated for the
/// quantize/dequantize surface. `NumericOverflow` (zero-range group,
/// collapsed scale) is deliberately absent here: it is handled inline by
/// substituting `scale = 1.0` for the affected group rather than surfacing
/// as an `Err`.
#[derive(Debug, Error)]
pub enum QuantError {
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, QuantError>;
