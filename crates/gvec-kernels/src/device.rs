//! Device session contract.
//!
//! Everything the engine does on the accelerator goes through the [`Device`]
//! trait, which the command queue owns exclusively. Buffers are addressed by
//! [`DevicePtr`] handles measured in 4-byte elements; slicing a handle is a
//! zero-copy sub-range view of the same allocation.

use crate::error::DeviceError;
use crate::kernel::{Kernel, KernelArg};
use crate::launch::LaunchConfig;

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Width in bytes of every element a device buffer holds (f32 and i32 alike).
pub const ELEMENT_WIDTH: usize = 4;

/// Opaque identity of one device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(pub u64);

/// Element type of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    F32,
    I32,
}

/// A view of `len` elements starting `offset` elements into an allocation.
///
/// Offsets are always in elements, never bytes; byte extents are derived
/// with [`DevicePtr::nbytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    alloc: AllocId,
    offset: usize,
    len: usize,
}

impl DevicePtr {
    /// Handle covering a whole allocation of `len` elements.
    pub fn new(alloc: AllocId, len: usize) -> Self {
        Self {
            alloc,
            offset: 0,
            len,
        }
    }

    pub fn alloc(&self) -> AllocId {
        self.alloc
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte extent of the view.
    pub fn nbytes(&self) -> usize {
        self.len * ELEMENT_WIDTH
    }

    /// Zero-copy view of elements `[start, end)` of this view.
    pub fn slice(&self, start: usize, end: usize) -> DeviceResult<DevicePtr> {
        if start > end || end > self.len {
            return Err(DeviceError::InvalidBuffer(format!(
                "slice [{start}, {end}) out of range for view of {} elements",
                self.len
            )));
        }
        Ok(Self {
            alloc: self.alloc,
            offset: self.offset + start,
            len: end - start,
        })
    }
}

/// Matrix transpose flag for BLAS calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

impl Transpose {
    pub fn from_flag(trans: bool) -> Self {
        if trans {
            Transpose::Yes
        } else {
            Transpose::No
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Transpose::No => Transpose::Yes,
            Transpose::Yes => Transpose::No,
        }
    }
}

/// Which side the diagonal matrix multiplies from in `sdgmm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Column-major GEMM: `C = alpha * op(A) * op(B) + beta * C`, with
/// `op(A)` of shape `[m, k]` and `op(B)` of shape `[k, n]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmCall {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub lda: usize,
    pub ldb: usize,
    pub beta: f32,
    pub ldc: usize,
}

/// Column-major GEMV: `y = alpha * op(A) * x + beta * y`, with `A` of shape `[m, n]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemvCall {
    pub trans: Transpose,
    pub m: usize,
    pub n: usize,
    pub alpha: f32,
    pub lda: usize,
    pub incx: usize,
    pub beta: f32,
    pub incy: usize,
}

/// Identity of an auxiliary execution stream forked from the main stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// Allocation and host transfer.
pub trait DeviceMemory {
    /// Allocate `len` uninitialized elements.
    fn alloc(&mut self, kind: ElemKind, len: usize) -> DeviceResult<DevicePtr>;

    /// Release the allocation `ptr` belongs to.
    fn free(&mut self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Device-to-device copy; both views must have the same length.
    fn copy(&mut self, dst: DevicePtr, src: DevicePtr) -> DeviceResult<()>;

    /// Zero-fill a view.
    fn clear(&mut self, dst: DevicePtr) -> DeviceResult<()>;

    fn write_f32(&mut self, dst: DevicePtr, src: &[f32]) -> DeviceResult<()>;

    fn read_f32(&mut self, dst: &mut [f32], src: DevicePtr) -> DeviceResult<()>;

    fn write_i32(&mut self, dst: DevicePtr, src: &[i32]) -> DeviceResult<()>;

    fn read_i32(&mut self, dst: &mut [i32], src: DevicePtr) -> DeviceResult<()>;
}

/// Single-precision BLAS subset. Matrices are column-major, as in cuBLAS.
pub trait LinearAlgebra {
    /// `x *= alpha`
    fn sscal(&mut self, n: usize, alpha: f32, x: DevicePtr) -> DeviceResult<()>;

    /// `y += alpha * x`
    fn saxpy(&mut self, n: usize, alpha: f32, x: DevicePtr, y: DevicePtr) -> DeviceResult<()>;

    fn sdot(&mut self, n: usize, x: DevicePtr, y: DevicePtr) -> DeviceResult<f32>;

    /// `C = A * diag(x)` (right) or `C = diag(x) * A` (left), `A` of shape `[m, n]`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> DeviceResult<()>;

    fn sgemm(&mut self, call: &GemmCall, a: DevicePtr, b: DevicePtr, c: DevicePtr) -> DeviceResult<()>;

    fn sgemv(&mut self, call: &GemvCall, a: DevicePtr, x: DevicePtr, y: DevicePtr) -> DeviceResult<()>;

    fn sasum(&mut self, n: usize, x: DevicePtr) -> DeviceResult<f32>;

    fn snrm2(&mut self, n: usize, x: DevicePtr) -> DeviceResult<f32>;

    /// One-based index of the first element with the largest magnitude.
    fn isamax(&mut self, n: usize, x: DevicePtr) -> DeviceResult<usize>;

    /// Route subsequent BLAS calls to `stream`, or back to the main stream.
    fn set_stream(&mut self, stream: Option<StreamId>) -> DeviceResult<()>;
}

/// Pseudo-random fill.
pub trait RandomSource {
    fn seed(&mut self, seed: u64) -> DeviceResult<()>;

    /// Uniform values in `(0, 1]`.
    fn fill_uniform(&mut self, dst: DevicePtr) -> DeviceResult<()>;

    /// Normal values; `dst` must hold an even number of elements.
    fn fill_normal(&mut self, dst: DevicePtr, mean: f32, std: f32) -> DeviceResult<()>;
}

/// Launches kernels from the fixed named set in [`Kernel`].
pub trait KernelModule {
    fn launch(&mut self, kernel: Kernel, cfg: LaunchConfig, args: &[KernelArg]) -> DeviceResult<()>;
}

/// A complete device session: one ordered main stream plus the allocator,
/// BLAS handle, random generator and kernel module that run on it.
pub trait Device: DeviceMemory + LinearAlgebra + RandomSource + KernelModule + Send {
    fn name(&self) -> String;

    /// Create an auxiliary stream ordered after all work queued so far.
    fn fork_stream(&mut self) -> DeviceResult<StreamId>;

    /// Make the main stream wait for `stream`, then release it.
    fn join_stream(&mut self, stream: StreamId) -> DeviceResult<()>;

    /// Block until the main stream is idle.
    fn synchronize(&mut self) -> DeviceResult<()>;
}
