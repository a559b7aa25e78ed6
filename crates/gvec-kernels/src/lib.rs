//! # gvec-kernels
//!
//! Device boundary for gvec.
//!
//! Provides:
//! - The [`Device`] contract (memory, BLAS subset, random fill, named kernels)
//! - Launch geometry helpers shared by every backend
//! - [`EmulatedDevice`], a host implementation used for tests and CPU-only runs
//! - CUDA dispatch via cudarc, cuBLAS and cuRAND (behind `cuda` feature flag)

pub mod device;
pub mod emulator;
pub mod error;
pub mod kernel;
pub mod launch;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use device::{
    AllocId, Device, DeviceMemory, DevicePtr, DeviceResult, ElemKind, GemmCall, GemvCall,
    KernelModule, LinearAlgebra, RandomSource, Side, StreamId, Transpose, ELEMENT_WIDTH,
};
pub use emulator::{DeviceStats, EmulatedDevice};
pub use error::DeviceError;
pub use kernel::{Kernel, KernelArg};
pub use launch::{grid_1d, grid_rows, is_power_of_two, reduction_block, LaunchConfig};
