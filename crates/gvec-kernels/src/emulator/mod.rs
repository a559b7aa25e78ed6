//! Emulated device.
//!
//! Runs the whole device contract on host memory so the engine can execute
//! without an accelerator. Kernels honour their launch geometry (elements not
//! covered by the grid are left untouched) and fresh allocations are filled
//! with NaN, so a missing clear or an undersized launch shows up in results
//! instead of being masked by zeroed memory.

mod blas;
mod kernels;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::{
    AllocId, Device, DeviceMemory, DevicePtr, DeviceResult, ElemKind, RandomSource, StreamId,
    ELEMENT_WIDTH,
};
use crate::error::DeviceError;

/// Host-side backing store of one allocation.
#[derive(Debug)]
enum HostAlloc {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl HostAlloc {
    fn len(&self) -> usize {
        match self {
            HostAlloc::F32(v) => v.len(),
            HostAlloc::I32(v) => v.len(),
        }
    }
}

/// Counters describing what the device has been asked to do.
///
/// Shared through an `Arc` so a test can keep a handle after the device has
/// been moved into a session.
#[derive(Debug, Default)]
pub struct DeviceStats {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    live_elements: AtomicUsize,
    launches: AtomicUsize,
    blas_calls: AtomicUsize,
    streams_forked: AtomicUsize,
}

impl DeviceStats {
    /// Allocations performed so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Allocations released so far.
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Elements currently allocated.
    pub fn live_elements(&self) -> usize {
        self.live_elements.load(Ordering::SeqCst)
    }

    /// Kernel launches performed so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// BLAS calls performed so far.
    pub fn blas_calls(&self) -> usize {
        self.blas_calls.load(Ordering::SeqCst)
    }

    /// Auxiliary streams forked so far.
    pub fn streams_forked(&self) -> usize {
        self.streams_forked.load(Ordering::SeqCst)
    }
}

/// A device whose memory, BLAS, RNG and kernels all run on the host.
pub struct EmulatedDevice {
    heap: HashMap<AllocId, HostAlloc>,
    next_alloc: u64,
    capacity_bytes: Option<usize>,
    live_bytes: usize,
    rng: StdRng,
    streams: HashSet<StreamId>,
    next_stream: u32,
    blas_stream: Option<StreamId>,
    stats: Arc<DeviceStats>,
}

impl EmulatedDevice {
    /// Create an emulated device with unbounded memory.
    pub fn new() -> Self {
        Self {
            heap: HashMap::new(),
            next_alloc: 1,
            capacity_bytes: None,
            live_bytes: 0,
            rng: StdRng::from_entropy(),
            streams: HashSet::new(),
            next_stream: 1,
            blas_stream: None,
            stats: Arc::new(DeviceStats::default()),
        }
    }

    /// Create an emulated device that fails allocations beyond `bytes`.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity_bytes: Some(bytes),
            ..Self::new()
        }
    }

    /// Shared handle to the device's counters.
    pub fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }

    fn entry(&self, ptr: DevicePtr) -> DeviceResult<&HostAlloc> {
        let alloc = self.heap.get(&ptr.alloc()).ok_or_else(|| {
            DeviceError::InvalidBuffer(format!("allocation {:?} does not exist", ptr.alloc()))
        })?;
        if ptr.offset() + ptr.len() > alloc.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "view [{}, {}) exceeds allocation of {} elements",
                ptr.offset(),
                ptr.offset() + ptr.len(),
                alloc.len()
            )));
        }
        Ok(alloc)
    }

    fn entry_mut(&mut self, ptr: DevicePtr) -> DeviceResult<&mut HostAlloc> {
        self.entry(ptr)?;
        self.heap
            .get_mut(&ptr.alloc())
            .ok_or_else(|| DeviceError::InvalidBuffer(format!("allocation {:?} vanished", ptr.alloc())))
    }

    pub(crate) fn f32s(&self, ptr: DevicePtr) -> DeviceResult<&[f32]> {
        match self.entry(ptr)? {
            HostAlloc::F32(v) => Ok(&v[ptr.offset()..ptr.offset() + ptr.len()]),
            HostAlloc::I32(_) => Err(DeviceError::TypeMismatch(ptr.alloc())),
        }
    }

    pub(crate) fn f32s_mut(&mut self, ptr: DevicePtr) -> DeviceResult<&mut [f32]> {
        match self.entry_mut(ptr)? {
            HostAlloc::F32(v) => Ok(&mut v[ptr.offset()..ptr.offset() + ptr.len()]),
            HostAlloc::I32(_) => Err(DeviceError::TypeMismatch(ptr.alloc())),
        }
    }

    pub(crate) fn i32s(&self, ptr: DevicePtr) -> DeviceResult<&[i32]> {
        match self.entry(ptr)? {
            HostAlloc::I32(v) => Ok(&v[ptr.offset()..ptr.offset() + ptr.len()]),
            HostAlloc::F32(_) => Err(DeviceError::TypeMismatch(ptr.alloc())),
        }
    }

    pub(crate) fn i32s_mut(&mut self, ptr: DevicePtr) -> DeviceResult<&mut [i32]> {
        match self.entry_mut(ptr)? {
            HostAlloc::I32(v) => Ok(&mut v[ptr.offset()..ptr.offset() + ptr.len()]),
            HostAlloc::F32(_) => Err(DeviceError::TypeMismatch(ptr.alloc())),
        }
    }

    /// Snapshot of an f32 view, for operations whose inputs may share an
    /// allocation with their output.
    pub(crate) fn snapshot(&self, ptr: DevicePtr) -> DeviceResult<Vec<f32>> {
        Ok(self.f32s(ptr)?.to_vec())
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn check_same_len(op: &str, dst: usize, src: usize) -> DeviceResult<()> {
    if dst != src {
        return Err(DeviceError::InvalidBuffer(format!(
            "{op}: destination has {dst} elements, source has {src}"
        )));
    }
    Ok(())
}

impl DeviceMemory for EmulatedDevice {
    fn alloc(&mut self, kind: ElemKind, len: usize) -> DeviceResult<DevicePtr> {
        let bytes = len * ELEMENT_WIDTH;
        if let Some(cap) = self.capacity_bytes {
            let available = cap.saturating_sub(self.live_bytes);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        let id = AllocId(self.next_alloc);
        self.next_alloc += 1;
        let storage = match kind {
            ElemKind::F32 => HostAlloc::F32(vec![f32::NAN; len]),
            ElemKind::I32 => HostAlloc::I32(vec![-1; len]),
        };
        self.heap.insert(id, storage);
        self.live_bytes += bytes;
        self.stats.allocations.fetch_add(1, Ordering::SeqCst);
        self.stats.live_elements.fetch_add(len, Ordering::SeqCst);
        Ok(DevicePtr::new(id, len))
    }

    fn free(&mut self, ptr: DevicePtr) -> DeviceResult<()> {
        let alloc = self.heap.remove(&ptr.alloc()).ok_or_else(|| {
            DeviceError::InvalidBuffer(format!("double free of {:?}", ptr.alloc()))
        })?;
        let len = alloc.len();
        self.live_bytes -= len * ELEMENT_WIDTH;
        self.stats.frees.fetch_add(1, Ordering::SeqCst);
        self.stats.live_elements.fetch_sub(len, Ordering::SeqCst);
        Ok(())
    }

    fn copy(&mut self, dst: DevicePtr, src: DevicePtr) -> DeviceResult<()> {
        check_same_len("copy", dst.len(), src.len())?;
        if matches!(self.entry(src)?, HostAlloc::F32(_)) {
            let data = self.snapshot(src)?;
            self.f32s_mut(dst)?.copy_from_slice(&data);
        } else {
            let data = self.i32s(src)?.to_vec();
            self.i32s_mut(dst)?.copy_from_slice(&data);
        }
        Ok(())
    }

    fn clear(&mut self, dst: DevicePtr) -> DeviceResult<()> {
        match self.entry_mut(dst)? {
            HostAlloc::F32(v) => v[dst.offset()..dst.offset() + dst.len()].fill(0.0),
            HostAlloc::I32(v) => v[dst.offset()..dst.offset() + dst.len()].fill(0),
        }
        Ok(())
    }

    fn write_f32(&mut self, dst: DevicePtr, src: &[f32]) -> DeviceResult<()> {
        check_same_len("write", dst.len(), src.len())?;
        self.f32s_mut(dst)?.copy_from_slice(src);
        Ok(())
    }

    fn read_f32(&mut self, dst: &mut [f32], src: DevicePtr) -> DeviceResult<()> {
        check_same_len("read", dst.len(), src.len())?;
        dst.copy_from_slice(self.f32s(src)?);
        Ok(())
    }

    fn write_i32(&mut self, dst: DevicePtr, src: &[i32]) -> DeviceResult<()> {
        check_same_len("write", dst.len(), src.len())?;
        self.i32s_mut(dst)?.copy_from_slice(src);
        Ok(())
    }

    fn read_i32(&mut self, dst: &mut [i32], src: DevicePtr) -> DeviceResult<()> {
        check_same_len("read", dst.len(), src.len())?;
        dst.copy_from_slice(self.i32s(src)?);
        Ok(())
    }
}

impl RandomSource for EmulatedDevice {
    fn seed(&mut self, seed: u64) -> DeviceResult<()> {
        self.rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    fn fill_uniform(&mut self, dst: DevicePtr) -> DeviceResult<()> {
        let values: Vec<f32> = (0..dst.len()).map(|_| 1.0 - self.rng.gen::<f32>()).collect();
        self.f32s_mut(dst)?.copy_from_slice(&values);
        Ok(())
    }

    fn fill_normal(&mut self, dst: DevicePtr, mean: f32, std: f32) -> DeviceResult<()> {
        if dst.len() % 2 != 0 {
            return Err(DeviceError::Random(format!(
                "normal fill needs an even element count, got {}",
                dst.len()
            )));
        }
        // Box-Muller, one pair of outputs per pair of uniforms
        let mut values = Vec::with_capacity(dst.len());
        for _ in 0..dst.len() / 2 {
            let u1: f32 = 1.0 - self.rng.gen::<f32>();
            let u2: f32 = self.rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = std::f32::consts::TAU * u2;
            values.push(mean + std * r * theta.cos());
            values.push(mean + std * r * theta.sin());
        }
        self.f32s_mut(dst)?.copy_from_slice(&values);
        Ok(())
    }
}

impl Device for EmulatedDevice {
    fn name(&self) -> String {
        "emulated".to_string()
    }

    fn fork_stream(&mut self) -> DeviceResult<StreamId> {
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(id);
        self.stats.streams_forked.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn join_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        if self.blas_stream == Some(stream) {
            return Err(DeviceError::Driver(format!(
                "stream {stream:?} is still bound to the BLAS handle"
            )));
        }
        if !self.streams.remove(&stream) {
            return Err(DeviceError::Driver(format!("unknown stream {stream:?}")));
        }
        Ok(())
    }

    fn synchronize(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}
