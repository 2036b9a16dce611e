use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToonError>;

/// Failures raised while building or evaluating the generator and while
/// opening media. None of them are transient.
#[derive(Debug, Error)]
pub enum ToonError {
    #[error("parameter source {} cannot be opened: {reason}", path.display())]
    MissingParameterSource { path: PathBuf, reason: String },

    #[error("parameter source has no tensor named '{key}'")]
    MissingParameter { key: String },

    #[error("parameter '{key}' is invalid: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot read media {}: {reason}", path.display())]
    UnreadableMedia { path: PathBuf, reason: String },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ToonError {
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
