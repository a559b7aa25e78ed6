//! cuBLAS calls on resolved device addresses.

use std::ffi::c_int;
use std::sync::Arc;

use cudarc::cublas::sys::{self, cublasOperation_t, cublasSideMode_t};
use cudarc::cublas::CudaBlas;
use cudarc::driver::sys::CUdeviceptr;
use cudarc::driver::{CudaDevice, CudaStream};

use crate::device::{DeviceResult, GemmCall, GemvCall, Side, Transpose};
use crate::error::DeviceError;

fn op(t: Transpose) -> cublasOperation_t {
    match t {
        Transpose::No => cublasOperation_t::CUBLAS_OP_N,
        Transpose::Yes => cublasOperation_t::CUBLAS_OP_T,
    }
}

fn dim(call: &'static str, x: usize) -> DeviceResult<c_int> {
    c_int::try_from(x).map_err(|_| DeviceError::blas(call, format!("dimension {x} exceeds i32")))
}

fn check(call: &'static str, status: sys::cublasStatus_t) -> DeviceResult<()> {
    status.result().map_err(|e| DeviceError::blas(call, e.to_string()))
}

fn fptr(p: CUdeviceptr) -> *mut f32 {
    p as *mut f32
}

/// One cuBLAS handle bound to the session's device.
pub(crate) struct GpuBlas {
    blas: CudaBlas,
}

impl GpuBlas {
    pub fn new(dev: Arc<CudaDevice>) -> DeviceResult<Self> {
        let blas = CudaBlas::new(dev).map_err(|e| DeviceError::blas("create", e.to_string()))?;
        Ok(Self { blas })
    }

    fn handle(&self) -> sys::cublasHandle_t {
        *self.blas.handle()
    }

    pub fn set_stream(&self, stream: Option<&CudaStream>) -> DeviceResult<()> {
        // SAFETY: the stream outlives the binding; callers unbind before joining.
        unsafe { self.blas.set_stream(stream) }.map_err(|e| DeviceError::blas("set_stream", e.to_string()))
    }

    pub fn sscal(&self, n: usize, alpha: f32, x: CUdeviceptr) -> DeviceResult<()> {
        let n = dim("sscal", n)?;
        // SAFETY: `x` addresses at least `n` live f32 elements.
        check("sscal", unsafe { sys::cublasSscal_v2(self.handle(), n, &alpha, fptr(x), 1) })
    }

    pub fn saxpy(&self, n: usize, alpha: f32, x: CUdeviceptr, y: CUdeviceptr) -> DeviceResult<()> {
        let n = dim("saxpy", n)?;
        // SAFETY: `x` and `y` address at least `n` live f32 elements.
        check("saxpy", unsafe { sys::cublasSaxpy_v2(self.handle(), n, &alpha, fptr(x), 1, fptr(y), 1) })
    }

    pub fn sdot(&self, n: usize, x: CUdeviceptr, y: CUdeviceptr) -> DeviceResult<f32> {
        let n = dim("sdot", n)?;
        let mut out = 0.0f32;
        // SAFETY: host pointer mode; `out` lives until the call returns.
        check("sdot", unsafe { sys::cublasSdot_v2(self.handle(), n, fptr(x), 1, fptr(y), 1, &mut out) })?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sdgmm(
        &self,
        side: Side,
        m: usize,
        n: usize,
        a: CUdeviceptr,
        lda: usize,
        x: CUdeviceptr,
        incx: usize,
        c: CUdeviceptr,
        ldc: usize,
    ) -> DeviceResult<()> {
        let mode = match side {
            Side::Left => cublasSideMode_t::CUBLAS_SIDE_LEFT,
            Side::Right => cublasSideMode_t::CUBLAS_SIDE_RIGHT,
        };
        // SAFETY: extents were validated against the views by the caller.
        check("sdgmm", unsafe {
            sys::cublasSdgmm(
                self.handle(),
                mode,
                dim("sdgmm", m)?,
                dim("sdgmm", n)?,
                fptr(a),
                dim("sdgmm", lda)?,
                fptr(x),
                dim("sdgmm", incx)?,
                fptr(c),
                dim("sdgmm", ldc)?,
            )
        })
    }

    pub fn sgemm(&self, call: &GemmCall, a: CUdeviceptr, b: CUdeviceptr, c: CUdeviceptr) -> DeviceResult<()> {
        // SAFETY: extents were validated against the views by the caller.
        check("sgemm", unsafe {
            sys::cublasSgemm_v2(
                self.handle(),
                op(call.trans_a),
                op(call.trans_b),
                dim("sgemm", call.m)?,
                dim("sgemm", call.n)?,
                dim("sgemm", call.k)?,
                &call.alpha,
                fptr(a),
                dim("sgemm", call.lda)?,
                fptr(b),
                dim("sgemm", call.ldb)?,
                &call.beta,
                fptr(c),
                dim("sgemm", call.ldc)?,
            )
        })
    }

    pub fn sgemv(&self, call: &GemvCall, a: CUdeviceptr, x: CUdeviceptr, y: CUdeviceptr) -> DeviceResult<()> {
        // SAFETY: extents were validated against the views by the caller.
        check("sgemv", unsafe {
            sys::cublasSgemv_v2(
                self.handle(),
                op(call.trans),
                dim("sgemv", call.m)?,
                dim("sgemv", call.n)?,
                &call.alpha,
                fptr(a),
                dim("sgemv", call.lda)?,
                fptr(x),
                dim("sgemv", call.incx)?,
                &call.beta,
                fptr(y),
                dim("sgemv", call.incy)?,
            )
        })
    }

    pub fn sasum(&self, n: usize, x: CUdeviceptr) -> DeviceResult<f32> {
        let n = dim("sasum", n)?;
        let mut out = 0.0f32;
        // SAFETY: host pointer mode; `out` lives until the call returns.
        check("sasum", unsafe { sys::cublasSasum_v2(self.handle(), n, fptr(x), 1, &mut out) })?;
        Ok(out)
    }

    pub fn snrm2(&self, n: usize, x: CUdeviceptr) -> DeviceResult<f32> {
        let n = dim("snrm2", n)?;
        let mut out = 0.0f32;
        // SAFETY: host pointer mode; `out` lives until the call returns.
        check("snrm2", unsafe { sys::cublasSnrm2_v2(self.handle(), n, fptr(x), 1, &mut out) })?;
        Ok(out)
    }

    pub fn isamax(&self, n: usize, x: CUdeviceptr) -> DeviceResult<usize> {
        let n = dim("isamax", n)?;
        let mut out: c_int = 0;
        // SAFETY: host pointer mode; `out` lives until the call returns.
        check("isamax", unsafe { sys::cublasIsamax_v2(self.handle(), n, fptr(x), 1, &mut out) })?;
        Ok(out.max(0) as usize)
    }
}
