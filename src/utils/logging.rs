//! Logging Module
//!
//! Structured logging through the `tracing` crate, plus the per-epoch
//! training diagnostics emitted by the training driver.

use std::time::Instant;

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::utils::error::FcnError;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose logging for debugging (per-batch losses, decoder shapes)
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = FcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(FcnError::Config(format!("unknown log level '{}'", other))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Filter for the configured level alone
pub fn level_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level.to_tracing_level()).into())
}

/// `RUST_LOG` when set and valid, otherwise the configured level
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(config.level))
}

/// Initialize the global subscriber with the given configuration
pub fn init_logging(config: &LogConfig) -> Result<(), FcnError> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter(config))
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| FcnError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Training progress logger
pub struct TrainingLogger {
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    /// Create a new training logger
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();

        tracing::debug!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Log a single batch update
    pub fn batch(&self, batch_idx: usize, loss: f64, samples: usize) {
        tracing::debug!(
            "Epoch {} batch {}: loss = {:.6} ({} samples)",
            self.epoch,
            batch_idx + 1,
            loss,
            samples
        );
    }

    /// Log end of an epoch with the reported loss
    pub fn end_epoch(&self, reported_loss: f64, batches: usize) {
        let epoch_time = self.epoch_start.elapsed();
        let total_time = self.training_start.elapsed();

        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch_time = total_time.as_secs_f64() / (self.epoch + 1) as f64;
        let eta_secs = epochs_remaining as f64 * avg_epoch_time;

        tracing::info!(
            "Epoch: {}  mean loss: {:.6} | {} batches in {:.1}s | ETA: {:.0}s",
            self.epoch,
            reported_loss,
            batches,
            epoch_time.as_secs_f64(),
            eta_secs
        );
    }

    /// Log training completion
    pub fn log_complete(&self, final_loss: Option<f64>) {
        let total_time = self.training_start.elapsed();

        match final_loss {
            Some(loss) => tracing::info!(
                "Training complete! {} epochs in {:.1}s | Final loss: {:.6}",
                self.total_epochs,
                total_time.as_secs_f64(),
                loss
            ),
            None => tracing::warn!("Training finished without running any epoch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_follows_config() {
        assert_eq!(level_filter(LogLevel::Debug).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(level_filter(LogLevel::Error).max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(
            level_filter(LogConfig::default().level).max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("unknown".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_config_presets() {
        assert_eq!(LogConfig::default().level, LogLevel::Info);
        assert_eq!(LogConfig::verbose().level, LogLevel::Debug);
        assert_eq!(LogConfig::quiet().level, LogLevel::Error);
    }

    #[test]
    fn test_training_logger_tracks_epoch() {
        let mut logger = TrainingLogger::new(3);
        logger.start_epoch(2);
        assert_eq!(logger.epoch, 2);
        logger.end_epoch(0.5, 4);
        logger.log_complete(Some(0.5));
    }
}
