//! Pre-flight validation before assembling a model.
//!
//! Checks the tensor framework version the crate was built against and
//! whether an accelerator is present. Both outcomes are returned to the
//! caller as typed values; neither check aborts the process. A missing
//! accelerator only produces a warning.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend;

/// Burn release this crate is compiled against.
///
/// Bump together with the `burn` requirement in Cargo.toml; a test compares the two.
pub const FRAMEWORK_VERSION: &str = "0.18.0";

/// Oldest Burn release providing the APIs used here (`Batcher<B, I, O>`, conv transpose padding_out).
pub const MIN_FRAMEWORK_VERSION: &str = "0.17.0";

/// Outcome of the framework version check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameworkSupport {
    Supported { version: String },
    Unsupported { version: String, minimum: String },
    Unparseable { version: String },
}

impl FrameworkSupport {
    pub fn is_supported(&self) -> bool {
        matches!(self, FrameworkSupport::Supported { .. })
    }
}

impl fmt::Display for FrameworkSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameworkSupport::Supported { version } => write!(f, "burn {} (supported)", version),
            FrameworkSupport::Unsupported { version, minimum } => {
                write!(f, "burn {} (unsupported, need >= {})", version, minimum)
            }
            FrameworkSupport::Unparseable { version } => {
                write!(f, "burn '{}' (unrecognised version)", version)
            }
        }
    }
}

/// Kind of accelerator found on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceleratorKind {
    Nvidia,
    Amd,
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorKind::Nvidia => write!(f, "NVIDIA"),
            AcceleratorKind::Amd => write!(f, "AMD"),
        }
    }
}

/// Outcome of the accelerator presence check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceleratorStatus {
    Present(AcceleratorKind),
    Absent,
}

impl AcceleratorStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, AcceleratorStatus::Present(_))
    }
}

impl fmt::Display for AcceleratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorStatus::Present(kind) => write!(f, "{} GPU detected", kind),
            AcceleratorStatus::Absent => write!(f, "no GPU found"),
        }
    }
}

/// Combined pre-flight result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub framework: FrameworkSupport,
    pub accelerator: AcceleratorStatus,
    pub backend: String,
}

impl PreflightReport {
    /// Warnings the caller should surface. Training may still proceed.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.framework.is_supported() {
            warnings.push(format!("Framework check failed: {}", self.framework));
        }
        if !self.accelerator.is_present() {
            warnings.push(
                "No GPU found. Training will run on the CPU at reduced speed.".to_string(),
            );
        } else if !backend::backend_uses_accelerator() {
            warnings.push(format!(
                "{} but the {} backend is compiled in; rebuild with --features cuda",
                self.accelerator,
                self.backend
            ));
        }
        warnings
    }

    /// Emit the report through tracing
    pub fn log(&self) {
        info!("Framework: {}", self.framework);
        info!("Backend: {}", self.backend);
        match self.accelerator {
            AcceleratorStatus::Present(_) => info!("Accelerator: {}", self.accelerator),
            AcceleratorStatus::Absent => {}
        }
        for warning in self.warnings() {
            warn!("{}", warning);
        }
    }
}

/// Run every pre-flight check
pub fn run_preflight() -> PreflightReport {
    PreflightReport {
        framework: check_framework_version(FRAMEWORK_VERSION, MIN_FRAMEWORK_VERSION),
        accelerator: detect_accelerator(),
        backend: backend::backend_name().to_string(),
    }
}

/// Compare a dotted `major.minor.patch` version against a minimum
pub fn check_framework_version(found: &str, minimum: &str) -> FrameworkSupport {
    match (parse_version(found), parse_version(minimum)) {
        (Some(v), Some(min)) if v >= min => FrameworkSupport::Supported {
            version: found.to_string(),
        },
        (Some(_), Some(_)) => FrameworkSupport::Unsupported {
            version: found.to_string(),
            minimum: minimum.to_string(),
        },
        _ => FrameworkSupport::Unparseable {
            version: found.to_string(),
        },
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.trim().split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Probe the host for a usable GPU
pub fn detect_accelerator() -> AcceleratorStatus {
    if has_nvidia_gpu() {
        AcceleratorStatus::Present(AcceleratorKind::Nvidia)
    } else if has_amd_gpu() {
        AcceleratorStatus::Present(AcceleratorKind::Amd)
    } else {
        AcceleratorStatus::Absent
    }
}

/// Check for NVIDIA GPU (CUDA)
fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("nvidia-smi.exe")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

/// Check for AMD GPU (ROCm)
fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/dev/kfd").exists()
            && std::path::Path::new("/sys/module/amdgpu").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
