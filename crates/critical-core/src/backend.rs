//! Accelerator and precision selection.
//!
//! Which burn backend to instantiate is decided here from what the machine
//! offers and what the run asked for; the binary maps the result onto
//! concrete backend types.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Precision;

/// Device type for backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Device {
    /// CPU backend
    Cpu,
    /// GPU backend (when available)
    Gpu(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

/// Float width the training backend will actually run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatWidth {
    F32,
    F64,
}

impl fmt::Display for FloatWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatWidth::F32 => f.write_str("f32"),
            FloatWidth::F64 => f.write_str("f64"),
        }
    }
}

/// Picks the device: the first GPU when a GPU backend is compiled in and one
/// is detected, the CPU otherwise.
pub fn select_device(gpu_backend_compiled: bool) -> Device {
    if gpu_backend_compiled && is_gpu_available() {
        info!("GPU detected, training on GPU:0");
        Device::Gpu(0)
    } else {
        if !gpu_backend_compiled && is_gpu_available() {
            info!("GPU detected but no GPU backend compiled in (enable the `wgpu` feature)");
        }
        info!("Training on CPU");
        Device::Cpu
    }
}

/// Maps a requested precision onto a width the device supports.
///
/// Neither backend exposes half-precision training kernels, so 16-bit
/// requests run in f32. The GPU backend has no f64 path either.
pub fn resolve_precision(requested: Precision, device: Device) -> FloatWidth {
    match (requested, device) {
        (Precision::Double, Device::Cpu) => FloatWidth::F64,
        (Precision::Double, Device::Gpu(_)) => {
            warn!("precision=64 is not supported on {device}; using f32");
            FloatWidth::F32
        }
        (Precision::Single, _) => FloatWidth::F32,
        (half, _) => {
            debug_assert!(half.is_half());
            warn!("precision={half} is not available on {device}; using f32");
            FloatWidth::F32
        }
    }
}

/// Check if any GPU acceleration is available
pub fn is_gpu_available() -> bool {
    has_nvidia_gpu() || has_amd_gpu()
}

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

fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/module/amdgpu").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "CPU");
        assert_eq!(Device::Gpu(1).to_string(), "GPU:1");
    }

    #[test]
    fn test_cpu_only_build_selects_cpu() {
        assert_eq!(select_device(false), Device::Cpu);
    }

    #[test]
    fn test_resolve_precision() {
        assert_eq!(resolve_precision(Precision::Double, Device::Cpu), FloatWidth::F64);
        assert_eq!(resolve_precision(Precision::Double, Device::Gpu(0)), FloatWidth::F32);
        assert_eq!(resolve_precision(Precision::Single, Device::Cpu), FloatWidth::F32);
        assert_eq!(resolve_precision(Precision::Half, Device::Cpu), FloatWidth::F32);
        assert_eq!(resolve_precision(Precision::BFloat16, Device::Gpu(0)), FloatWidth::F32);
    }
}
