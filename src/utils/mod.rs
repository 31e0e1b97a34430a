//! Utilities module for errors, logging and small formatting helpers
//!
//! This module provides:
//! - The crate-wide error type
//! - Structured logging with tracing
//! - General helper functions

pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use error::{FcnError, Result};
pub use logging::{init_logging, LogConfig, TrainingLogger};

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

/// Format a shape as `AxBxC`
pub fn format_shape(dims: &[usize]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.5), "30.5s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m");
    }

    #[test]
    fn test_format_shape() {
        assert_eq!(format_shape(&[4, 2, 160, 576]), "4x2x160x576");
        assert_eq!(format_shape(&[]), "");
    }
}
