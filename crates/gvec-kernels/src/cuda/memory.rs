//! GPU allocation table and host/device transfers.
//!
//! Every allocation is held as a typed `CudaSlice`; views are resolved to raw
//! device addresses (`base + offset * 4`) at the point of use so that
//! sub-range handles never need their own cudarc object.

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::sys::CUdeviceptr;
use cudarc::driver::{result, CudaDevice, CudaSlice, DevicePtr as _};

use super::context::driver_err;
use crate::device::{AllocId, DevicePtr, DeviceResult, ElemKind, ELEMENT_WIDTH};
use crate::error::DeviceError;

enum GpuAlloc {
    F32(CudaSlice<f32>),
    I32(CudaSlice<i32>),
}

impl GpuAlloc {
    fn kind(&self) -> ElemKind {
        match self {
            GpuAlloc::F32(_) => ElemKind::F32,
            GpuAlloc::I32(_) => ElemKind::I32,
        }
    }

    fn base(&self) -> CUdeviceptr {
        match self {
            GpuAlloc::F32(s) => *s.device_ptr(),
            GpuAlloc::I32(s) => *s.device_ptr(),
        }
    }
}

struct Entry {
    alloc: GpuAlloc,
    len: usize,
}

/// Allocations owned by one device session.
pub(crate) struct GpuHeap {
    dev: Arc<CudaDevice>,
    entries: HashMap<AllocId, Entry>,
    next_alloc: u64,
}

impl GpuHeap {
    pub fn new(dev: Arc<CudaDevice>) -> Self {
        Self {
            dev,
            entries: HashMap::new(),
            next_alloc: 1,
        }
    }

    pub fn alloc(&mut self, kind: ElemKind, len: usize) -> DeviceResult<DevicePtr> {
        // cuMemAlloc rejects zero-byte requests
        let physical = len.max(1);
        let out_of_memory = |_| {
            let available = result::mem_get_info().map(|(free, _)| free).unwrap_or(0);
            DeviceError::OutOfMemory {
                requested: len * ELEMENT_WIDTH,
                available,
            }
        };
        // SAFETY: the buffer is uninitialized; the engine clears or writes it
        // before reading.
        let alloc = unsafe {
            match kind {
                ElemKind::F32 => GpuAlloc::F32(self.dev.alloc::<f32>(physical).map_err(out_of_memory)?),
                ElemKind::I32 => GpuAlloc::I32(self.dev.alloc::<i32>(physical).map_err(out_of_memory)?),
            }
        };
        let id = AllocId(self.next_alloc);
        self.next_alloc += 1;
        self.entries.insert(id, Entry { alloc, len });
        Ok(DevicePtr::new(id, len))
    }

    pub fn free(&mut self, ptr: DevicePtr) -> DeviceResult<()> {
        self.entries
            .remove(&ptr.alloc())
            .map(drop)
            .ok_or_else(|| DeviceError::InvalidBuffer(format!("double free of {:?}", ptr.alloc())))
    }

    fn entry(&self, ptr: DevicePtr) -> DeviceResult<&Entry> {
        let entry = self.entries.get(&ptr.alloc()).ok_or_else(|| {
            DeviceError::InvalidBuffer(format!("allocation {:?} does not exist", ptr.alloc()))
        })?;
        if ptr.offset() + ptr.len() > entry.len {
            return Err(DeviceError::InvalidBuffer(format!(
                "view [{}, {}) exceeds allocation of {} elements",
                ptr.offset(),
                ptr.offset() + ptr.len(),
                entry.len
            )));
        }
        Ok(entry)
    }

    pub fn kind(&self, ptr: DevicePtr) -> DeviceResult<ElemKind> {
        Ok(self.entry(ptr)?.alloc.kind())
    }

    /// Device address of the first element of `ptr`.
    pub fn raw(&self, ptr: DevicePtr) -> DeviceResult<CUdeviceptr> {
        let entry = self.entry(ptr)?;
        Ok(entry.alloc.base() + (ptr.offset() * ELEMENT_WIDTH) as CUdeviceptr)
    }

    /// Device address of an f32 view.
    pub fn raw_f32(&self, ptr: DevicePtr) -> DeviceResult<CUdeviceptr> {
        match self.kind(ptr)? {
            ElemKind::F32 => self.raw(ptr),
            ElemKind::I32 => Err(DeviceError::TypeMismatch(ptr.alloc())),
        }
    }

    fn expect_kind(&self, ptr: DevicePtr, kind: ElemKind) -> DeviceResult<CUdeviceptr> {
        if self.kind(ptr)? != kind {
            return Err(DeviceError::TypeMismatch(ptr.alloc()));
        }
        self.raw(ptr)
    }

    pub fn copy(&self, dst: DevicePtr, src: DevicePtr) -> DeviceResult<()> {
        if dst.len() != src.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "copy: destination has {} elements, source has {}",
                dst.len(),
                src.len()
            )));
        }
        if dst.is_empty() {
            return Ok(());
        }
        let src_raw = self.raw(src)?;
        let dst_raw = self.expect_kind(dst, self.kind(src)?)?;
        // SAFETY: both ranges were bounds-checked against live allocations.
        unsafe { result::memcpy_dtod_async(dst_raw, src_raw, dst.nbytes(), *self.dev.cu_stream()) }
            .map_err(|e| driver_err("memcpy_dtod", e))
    }

    pub fn clear(&self, dst: DevicePtr) -> DeviceResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let raw = self.raw(dst)?;
        // SAFETY: the range was bounds-checked against a live allocation.
        unsafe { result::memset_d8_async(raw, 0, dst.nbytes(), *self.dev.cu_stream()) }
            .map_err(|e| driver_err("memset", e))
    }

    pub fn write<T: cudarc::driver::DeviceRepr>(&self, kind: ElemKind, dst: DevicePtr, src: &[T]) -> DeviceResult<()> {
        check_host_len(dst, src.len())?;
        let raw = self.expect_kind(dst, kind)?;
        if src.is_empty() {
            return Ok(());
        }
        self.dev.synchronize().map_err(|e| driver_err("synchronize", e))?;
        // SAFETY: the device range holds exactly `src.len()` elements.
        unsafe { result::memcpy_htod_sync(raw, src) }.map_err(|e| driver_err("memcpy_htod", e))
    }

    pub fn read<T: cudarc::driver::DeviceRepr>(&self, kind: ElemKind, dst: &mut [T], src: DevicePtr) -> DeviceResult<()> {
        check_host_len(src, dst.len())?;
        let raw = self.expect_kind(src, kind)?;
        if dst.is_empty() {
            return Ok(());
        }
        self.dev.synchronize().map_err(|e| driver_err("synchronize", e))?;
        // SAFETY: the device range holds exactly `dst.len()` elements.
        unsafe { result::memcpy_dtoh_sync(dst, raw) }.map_err(|e| driver_err("memcpy_dtoh", e))
    }

    /// Typed temporary slice, used as a staging target by the generator.
    pub fn scratch(&self, len: usize) -> DeviceResult<CudaSlice<f32>> {
        self.dev
            .alloc_zeros::<f32>(len.max(1))
            .map_err(|e| driver_err("alloc scratch", e))
    }
}

fn check_host_len(ptr: DevicePtr, host: usize) -> DeviceResult<()> {
    if ptr.len() != host {
        return Err(DeviceError::InvalidBuffer(format!(
            "transfer: device view has {} elements, host buffer has {host}",
            ptr.len()
        )));
    }
    Ok(())
}
