//! CUDA kernel launcher with PTX compilation and caching.
//!
//! The vector kernel module is compiled once per device at runtime via NVRTC
//! and every kernel in [`Kernel::ALL`] is registered when it loads.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, CudaFunction, LaunchAsync};
use parking_lot::Mutex;

use crate::error::DeviceError;
use crate::kernel::Kernel;
use crate::launch::LaunchConfig;

const MODULE_NAME: &str = "gvec_vector";
const VECTOR_CU: &str = include_str!("kernels/vector.cu");

/// Devices whose vector module has been compiled and loaded.
static LOADED: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();

fn loaded_set() -> &'static Mutex<HashSet<usize>> {
    LOADED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Ensure the vector module is compiled and loaded on the given device.
/// No-op if already loaded.
pub fn ensure_module(device: &Arc<CudaDevice>, device_idx: usize) -> Result<(), DeviceError> {
    if loaded_set().lock().contains(&device_idx) {
        return Ok(());
    }

    let ptx = cudarc::nvrtc::compile_ptx(VECTOR_CU)
        .map_err(|e| DeviceError::Driver(format!("compiling {MODULE_NAME}: {e}")))?;
    let names: Vec<&'static str> = Kernel::ALL.iter().map(|k| k.symbol()).collect();
    device
        .load_ptx(ptx, MODULE_NAME, &names)
        .map_err(|e| DeviceError::Driver(format!("loading {MODULE_NAME}: {e}")))?;

    tracing::debug!(device_idx, kernels = names.len(), "loaded vector kernel module");
    loaded_set().lock().insert(device_idx);
    Ok(())
}

/// Get a kernel function handle, loading the module if needed.
pub fn get_func(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    kernel: Kernel,
) -> Result<CudaFunction, DeviceError> {
    ensure_module(device, device_idx)?;
    device
        .get_func(MODULE_NAME, kernel.symbol())
        .ok_or_else(|| DeviceError::launch(kernel.symbol(), "function not found in module"))
}

fn to_cudarc(cfg: LaunchConfig) -> cudarc::driver::LaunchConfig {
    cudarc::driver::LaunchConfig {
        grid_dim: cfg.grid_dim,
        block_dim: cfg.block_dim,
        shared_mem_bytes: cfg.shared_mem_bytes,
    }
}

/// One resolved kernel parameter, laid out as the kernel reads it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RawArg {
    Ptr(u64),
    F32(f32),
    U32(u32),
}

/// Launch `kernel` on the device's main stream.
pub(crate) fn launch(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    kernel: Kernel,
    cfg: LaunchConfig,
    args: &mut [RawArg],
) -> Result<(), DeviceError> {
    let func = get_func(device, device_idx, kernel)?;
    let mut params: Vec<*mut c_void> = args
        .iter_mut()
        .map(|a| match a {
            RawArg::Ptr(p) => p as *mut u64 as *mut c_void,
            RawArg::F32(v) => v as *mut f32 as *mut c_void,
            RawArg::U32(v) => v as *mut u32 as *mut c_void,
        })
        .collect();
    // SAFETY: every parameter slot points at a live value in `args` whose
    // type matches the kernel signature checked by the caller.
    unsafe { func.launch(to_cudarc(cfg), &mut params) }
        .map_err(|e| DeviceError::launch(kernel.symbol(), e.to_string()))
}
