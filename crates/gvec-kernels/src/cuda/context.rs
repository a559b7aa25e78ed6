//! CUDA device context management.
//!
//! Provides lazy-initialized singleton `CudaDevice` handles per GPU index.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, DriverError};
use parking_lot::Mutex;

use crate::error::DeviceError;

/// Global registry of CUDA device handles (one per GPU index).
static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<CudaDevice>>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<usize, Arc<CudaDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create a CUDA device handle for the given GPU index.
pub fn get_device(device_idx: usize) -> Result<Arc<CudaDevice>, DeviceError> {
    let mut map = devices().lock();
    if let Some(dev) = map.get(&device_idx) {
        return Ok(Arc::clone(dev));
    }
    let dev = CudaDevice::new(device_idx)
        .map_err(|e| DeviceError::Unavailable(format!("device {device_idx}: {e}")))?;
    map.insert(device_idx, Arc::clone(&dev));
    Ok(dev)
}

/// Check if any CUDA device is available.
pub fn is_cuda_available() -> bool {
    get_device(0).is_ok()
}

/// Number of available CUDA devices.
pub fn device_count() -> usize {
    CudaDevice::count().map(|n| n.max(0) as usize).unwrap_or(0)
}

/// Wrap a driver failure with the operation that raised it.
pub(crate) fn driver_err(op: &str, e: DriverError) -> DeviceError {
    DeviceError::Driver(format!("{op}: {e}"))
}
