//! Error types shared by the geometry engine and the model assemblers.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised while building or resolving convolutional geometry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("invalid node '{name}': {reason}")]
    InvalidNode { name: String, reason: String },
    #[error("stride must be positive, got {0}")]
    InvalidStride(i64),
    #[error("empty range [{lo}, {hi})")]
    EmptyRange { lo: i64, hi: i64 },
    #[error("position {position} is not a multiple of stride {stride}")]
    Misaligned { position: i64, stride: i64 },
    #[error("range [{lo}, {hi}) exceeds its bounding extent [{full_lo}, {full_hi})")]
    OutOfBounds {
        lo: i64,
        hi: i64,
        full_lo: i64,
        full_hi: i64,
    },
    #[error("stride mismatch: expected {expected}, found {found}")]
    StrideMismatch { expected: i64, found: i64 },
    #[error("node '{node}': grid stride {stride} is not divisible by factor {factor}")]
    NonIntegralStride {
        node: String,
        stride: i64,
        factor: i64,
    },
    #[error("node '{node}': input of {input_len} elements cannot produce any output")]
    Unreachable { node: String, input_len: i64 },
    #[error("node '{begin}' is not upstream of '{end}'")]
    Disconnected { begin: String, end: String },
    #[error("linking would create a cycle through '{0}'")]
    Cycle(String),
    #[error("unknown node handle {0}")]
    UnknownNode(usize),
}

/// Top-level error for model assembly, codebook initialization and checkpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unsupported configuration (e.g. unknown bottleneck type).
    #[error("configuration error: {0}")]
    Config(String),
    /// An operation was called on a model that does not support it.
    #[error("usage error: {0}")]
    Usage(String),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("shape error: {0}")]
    Shape(String),
    #[error("data source exhausted after {got} of {wanted} samples")]
    DataExhausted { got: usize, wanted: usize },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_errors_convert_into_crate_error() {
        let err: Error = GeometryError::Misaligned {
            position: 3,
            stride: 2,
        }
        .into();
        assert!(matches!(err, Error::Geometry(GeometryError::Misaligned { .. })));
        assert_eq!(err.to_string(), "position 3 is not a multiple of stride 2");
    }
}
