//! Error Handling Module
//!
//! Defines the error type shared by every stage of the FCN pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for road_fcn operations
#[derive(Error, Debug)]
pub enum FcnError {
    /// Two tensors that must line up (fusion, labels vs scores, encoder taps) do not
    #[error("Shape mismatch at {stage}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        stage: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Class axis length differs from the configured number of classes
    #[error("Class count mismatch in {context}: expected {expected} classes, found {found}")]
    ClassCountMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// Error loading or processing an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error with model operations
    #[error("Model error: {0}")]
    Model(String),

    /// Error during a forward/backward step
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

impl From<serde_json::Error> for FcnError {
    fn from(err: serde_json::Error) -> Self {
        FcnError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FcnError {
    fn from(err: toml::de::Error) -> Self {
        FcnError::Config(err.to_string())
    }
}

/// Convenience Result type for road_fcn operations
pub type Result<T> = std::result::Result<T, FcnError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| FcnError::Dataset(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| FcnError::Dataset(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| FcnError::Dataset(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| FcnError::Dataset(f()))
    }
}

/// Fail with a [`FcnError::ShapeMismatch`] unless both shapes are identical.
pub fn ensure_same_shape(stage: &'static str, expected: &[usize], found: &[usize]) -> Result<()> {
    if expected != found {
        return Err(FcnError::ShapeMismatch {
            stage,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FcnError::Dataset("test error".to_string());
        assert_eq!(format!("{}", err), "Dataset error: test error");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = FcnError::ShapeMismatch {
            stage: "stride16 fusion",
            expected: vec![1, 2, 10, 36],
            found: vec![1, 2, 10, 35],
        };
        let msg = err.to_string();
        assert!(msg.contains("stride16 fusion"));
        assert!(msg.contains("[1, 2, 10, 35]"));
    }

    #[test]
    fn test_ensure_same_shape() {
        assert!(ensure_same_shape("x", &[1, 2, 3], &[1, 2, 3]).is_ok());
        assert!(matches!(
            ensure_same_shape("x", &[1, 2, 3], &[1, 2, 1]),
            Err(FcnError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let with_context = result.context("Failed to read file");
        assert!(matches!(with_context, Err(FcnError::Dataset(_))));
    }

    #[test]
    fn test_option_context() {
        let opt: Option<i32> = None;
        let with_context = opt.context("Value was None");
        assert!(with_context.is_err());
    }
}
