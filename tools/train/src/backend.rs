//! Concrete burn backends the binary can train on.

use burn::backend::{Autodiff, NdArray};

/// CPU training in single precision.
pub type CpuF32 = Autodiff<NdArray<f32>>;

/// CPU training in double precision.
pub type CpuF64 = Autodiff<NdArray<f64>>;

#[cfg(feature = "wgpu")]
pub type Gpu = Autodiff<burn::backend::Wgpu>;

#[cfg(feature = "wgpu")]
pub fn gpu_device(index: usize) -> burn::backend::wgpu::WgpuDevice {
    burn::backend::wgpu::WgpuDevice::DiscreteGpu(index)
}
