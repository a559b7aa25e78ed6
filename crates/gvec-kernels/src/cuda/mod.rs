//! CUDA GPU backend.
//!
//! [`CudaBackend`] implements the device contract on one GPU: allocations are
//! tracked in a table of typed slices, BLAS goes through cuBLAS, random fills
//! through cuRAND, and the named kernels are compiled from
//! `kernels/vector.cu` at first use.

pub mod blas;
pub mod context;
pub mod launch;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::curand::CudaRng;
use cudarc::driver::{result, CudaDevice, CudaStream, DevicePtr as _};

use self::blas::GpuBlas;
use self::context::{driver_err, get_device};
use self::launch::RawArg;
use self::memory::GpuHeap;
use crate::device::{
    Device, DeviceMemory, DevicePtr, DeviceResult, ElemKind, GemmCall, GemvCall, KernelModule,
    LinearAlgebra, RandomSource, Side, StreamId,
};
use crate::error::DeviceError;
use crate::kernel::{Kernel, KernelArg};
use crate::launch::LaunchConfig;

pub use self::context::{device_count, is_cuda_available};

/// A device session on one CUDA GPU.
pub struct CudaBackend {
    dev: Arc<CudaDevice>,
    device_idx: usize,
    heap: GpuHeap,
    blas: GpuBlas,
    rng: CudaRng,
    streams: HashMap<StreamId, CudaStream>,
    next_stream: u32,
    blas_stream: Option<StreamId>,
}

// SAFETY: the backend is owned by exactly one command-queue worker; the raw
// cuBLAS and cuRAND handles are never shared between threads.
unsafe impl Send for CudaBackend {}

impl CudaBackend {
    /// Open a session on GPU `device_idx` and load the kernel module.
    pub fn new(device_idx: usize) -> DeviceResult<Self> {
        let dev = get_device(device_idx)?;
        launch::ensure_module(&dev, device_idx)?;
        let blas = GpuBlas::new(Arc::clone(&dev))?;
        let rng = CudaRng::new(0, Arc::clone(&dev)).map_err(|e| DeviceError::Random(e.to_string()))?;
        tracing::info!(device_idx, name = %dev.name().unwrap_or_default(), "opened CUDA device");
        Ok(Self {
            heap: GpuHeap::new(Arc::clone(&dev)),
            dev,
            device_idx,
            blas,
            rng,
            streams: HashMap::new(),
            next_stream: 1,
            blas_stream: None,
        })
    }

    fn fill_via_scratch(
        &mut self,
        dst: DevicePtr,
        fill: impl FnOnce(&CudaRng, &mut cudarc::driver::CudaSlice<f32>) -> Result<(), cudarc::curand::result::CurandError>,
    ) -> DeviceResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let raw = self.heap.raw_f32(dst)?;
        let mut scratch = self.heap.scratch(dst.len())?;
        fill(&self.rng, &mut scratch).map_err(|e| DeviceError::Random(e.to_string()))?;
        // SAFETY: scratch holds at least `dst.len()` elements; `dst` was bounds-checked.
        unsafe { result::memcpy_dtod_async(raw, *scratch.device_ptr(), dst.nbytes(), *self.dev.cu_stream()) }
            .map_err(|e| driver_err("memcpy_dtod", e))?;
        // scratch is freed on drop; keep the copy ordered before that
        self.dev.synchronize().map_err(|e| driver_err("synchronize", e))
    }
}

impl DeviceMemory for CudaBackend {
    fn alloc(&mut self, kind: ElemKind, len: usize) -> DeviceResult<DevicePtr> {
        self.heap.alloc(kind, len)
    }

    fn free(&mut self, ptr: DevicePtr) -> DeviceResult<()> {
        self.heap.free(ptr)
    }

    fn copy(&mut self, dst: DevicePtr, src: DevicePtr) -> DeviceResult<()> {
        self.heap.copy(dst, src)
    }

    fn clear(&mut self, dst: DevicePtr) -> DeviceResult<()> {
        self.heap.clear(dst)
    }

    fn write_f32(&mut self, dst: DevicePtr, src: &[f32]) -> DeviceResult<()> {
        self.heap.write(ElemKind::F32, dst, src)
    }

    fn read_f32(&mut self, dst: &mut [f32], src: DevicePtr) -> DeviceResult<()> {
        self.heap.read(ElemKind::F32, dst, src)
    }

    fn write_i32(&mut self, dst: DevicePtr, src: &[i32]) -> DeviceResult<()> {
        self.heap.write(ElemKind::I32, dst, src)
    }

    fn read_i32(&mut self, dst: &mut [i32], src: DevicePtr) -> DeviceResult<()> {
        self.heap.read(ElemKind::I32, dst, src)
    }
}

impl LinearAlgebra for CudaBackend {
    fn sscal(&mut self, n: usize, alpha: f32, x: DevicePtr) -> DeviceResult<()> {
        self.blas.sscal(n, alpha, self.heap.raw_f32(x)?)
    }

    fn saxpy(&mut self, n: usize, alpha: f32, x: DevicePtr, y: DevicePtr) -> DeviceResult<()> {
        self.blas.saxpy(n, alpha, self.heap.raw_f32(x)?, self.heap.raw_f32(y)?)
    }

    fn sdot(&mut self, n: usize, x: DevicePtr, y: DevicePtr) -> DeviceResult<f32> {
        self.blas.sdot(n, self.heap.raw_f32(x)?, self.heap.raw_f32(y)?)
    }

    fn sdgmm(
        &mut self,
        side: Side,
        m: usize,
        n: usize,
        a: DevicePtr,
        lda: usize,
        x: DevicePtr,
        incx: usize,
        c: DevicePtr,
        ldc: usize,
    ) -> DeviceResult<()> {
        let (a, x, c) = (self.heap.raw_f32(a)?, self.heap.raw_f32(x)?, self.heap.raw_f32(c)?);
        self.blas.sdgmm(side, m, n, a, lda, x, incx, c, ldc)
    }

    fn sgemm(&mut self, call: &GemmCall, a: DevicePtr, b: DevicePtr, c: DevicePtr) -> DeviceResult<()> {
        let (a, b, c) = (self.heap.raw_f32(a)?, self.heap.raw_f32(b)?, self.heap.raw_f32(c)?);
        self.blas.sgemm(call, a, b, c)
    }

    fn sgemv(&mut self, call: &GemvCall, a: DevicePtr, x: DevicePtr, y: DevicePtr) -> DeviceResult<()> {
        let (a, x, y) = (self.heap.raw_f32(a)?, self.heap.raw_f32(x)?, self.heap.raw_f32(y)?);
        self.blas.sgemv(call, a, x, y)
    }

    fn sasum(&mut self, n: usize, x: DevicePtr) -> DeviceResult<f32> {
        self.blas.sasum(n, self.heap.raw_f32(x)?)
    }

    fn snrm2(&mut self, n: usize, x: DevicePtr) -> DeviceResult<f32> {
        self.blas.snrm2(n, self.heap.raw_f32(x)?)
    }

    fn isamax(&mut self, n: usize, x: DevicePtr) -> DeviceResult<usize> {
        self.blas.isamax(n, self.heap.raw_f32(x)?)
    }

    fn set_stream(&mut self, stream: Option<StreamId>) -> DeviceResult<()> {
        match stream {
            Some(id) => {
                let s = self
                    .streams
                    .get(&id)
                    .ok_or_else(|| DeviceError::Driver(format!("unknown stream {id:?}")))?;
                self.blas.set_stream(Some(s))?;
            }
            None => self.blas.set_stream(None)?,
        }
        self.blas_stream = stream;
        Ok(())
    }
}

impl RandomSource for CudaBackend {
    fn seed(&mut self, seed: u64) -> DeviceResult<()> {
        self.rng.set_seed(seed).map_err(|e| DeviceError::Random(e.to_string()))
    }

    fn fill_uniform(&mut self, dst: DevicePtr) -> DeviceResult<()> {
        self.fill_via_scratch(dst, |rng, s| rng.fill_with_uniform(s))
    }

    fn fill_normal(&mut self, dst: DevicePtr, mean: f32, std: f32) -> DeviceResult<()> {
        if dst.len() % 2 != 0 {
            return Err(DeviceError::Random(format!(
                "normal fill needs an even element count, got {}",
                dst.len()
            )));
        }
        self.fill_via_scratch(dst, |rng, s| rng.fill_with_normal(s, mean, std))
    }
}

impl KernelModule for CudaBackend {
    fn launch(&mut self, kernel: Kernel, cfg: LaunchConfig, args: &[KernelArg]) -> DeviceResult<()> {
        if args.len() != kernel.arity() {
            return Err(DeviceError::launch(
                kernel.symbol(),
                format!("expected {} arguments, got {}", kernel.arity(), args.len()),
            ));
        }
        let mut raw = args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                Ok(match *a {
                    KernelArg::Ptr(p) => RawArg::Ptr(self.heap.raw(p)?),
                    KernelArg::F32(v) => RawArg::F32(v),
                    other => RawArg::U32(other.as_u32(kernel, i)?.ok_or_else(|| {
                        DeviceError::launch(kernel.symbol(), format!("argument {i} is not an integer"))
                    })?),
                })
            })
            .collect::<DeviceResult<Vec<_>>>()?;
        launch::launch(&self.dev, self.device_idx, kernel, cfg, &mut raw)
    }
}

impl Device for CudaBackend {
    fn name(&self) -> String {
        format!("cuda:{}", self.device_idx)
    }

    fn fork_stream(&mut self) -> DeviceResult<StreamId> {
        let stream = self.dev.fork_default_stream().map_err(|e| driver_err("fork stream", e))?;
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(id, stream);
        Ok(id)
    }

    fn join_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        if self.blas_stream == Some(stream) {
            return Err(DeviceError::Driver(format!(
                "stream {stream:?} is still bound to the BLAS handle"
            )));
        }
        let s = self
            .streams
            .remove(&stream)
            .ok_or_else(|| DeviceError::Driver(format!("unknown stream {stream:?}")))?;
        self.dev.wait_for(&s).map_err(|e| driver_err("join stream", e))
    }

    fn synchronize(&mut self) -> DeviceResult<()> {
        self.dev.synchronize().map_err(|e| driver_err("synchronize", e))
    }
}
