//! The fixed named kernel set and its argument encoding.
//!
//! Argument order for each kernel (matches `cuda/kernels/vector.cu`):
//!
//! | kernel | arguments |
//! |---|---|
//! | `addScaler` | `f32 s, f32* v, u32 n` |
//! | `divElements` | `f32* v, f32* d, u32 n` |
//! | unary (`expElements` ... `clipPositive`) | `f32* v, u32 n` |
//! | compare (`lessThan`, `greaterThan`, `equalTo`) | `f32 a, f32* v, u32 n` |
//! | `powScalar` | `f32 p, f32* v, u32 n` |
//! | `addChunks` | `f32* v, f32* c, u32 n, u32 chunk_size` |
//! | `addRepeated`, `scaleRepeated` | `f32* v, f32* r, u32 n, u32 rep_len` |
//! | `addRepeatedPow2`, `scaleRepeatedPow2` | `f32* v, f32* r, u32 n, u32 rep_mask` |
//! | `elemMax` | `f32* v, f32* w, u32 n` |
//! | `uniformToBernoulli` | `f32* v, u32 n` |
//! | `mapForward` | `f32* out, f32* in, i32* table, u32 table_len` |
//! | `mapBackward` | `f32* out, f32* in, i32* table, u32 table_len` |
//! | `mapMax` | `i32* table, f32* v, u32 rows, u32 cols` |
//! | `logSumExpGroups` | `f32* out, f32* in, u32 cols, u32 groups` |
//! | `logSumExpRows` | `f32* out, f32* in, u32 cols` |

use std::fmt;

use crate::device::DevicePtr;
use crate::device::DeviceResult;
use crate::error::DeviceError;

/// Named kernels available on every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    AddScaler,
    DivElements,
    Exp,
    Log,
    Tanh,
    Sin,
    Sigmoid,
    ClipPositive,
    LessThan,
    GreaterThan,
    EqualTo,
    PowScalar,
    AddChunks,
    AddRepeated,
    AddRepeatedPow2,
    ScaleRepeated,
    ScaleRepeatedPow2,
    ElemMax,
    UniformToBernoulli,
    MapForward,
    MapBackward,
    MapMax,
    LogSumExpGroups,
    LogSumExpRows,
}

impl Kernel {
    /// Every kernel, in module export order.
    pub const ALL: &'static [Kernel] = &[
        Kernel::AddScaler,
        Kernel::DivElements,
        Kernel::Exp,
        Kernel::Log,
        Kernel::Tanh,
        Kernel::Sin,
        Kernel::Sigmoid,
        Kernel::ClipPositive,
        Kernel::LessThan,
        Kernel::GreaterThan,
        Kernel::EqualTo,
        Kernel::PowScalar,
        Kernel::AddChunks,
        Kernel::AddRepeated,
        Kernel::AddRepeatedPow2,
        Kernel::ScaleRepeated,
        Kernel::ScaleRepeatedPow2,
        Kernel::ElemMax,
        Kernel::UniformToBernoulli,
        Kernel::MapForward,
        Kernel::MapBackward,
        Kernel::MapMax,
        Kernel::LogSumExpGroups,
        Kernel::LogSumExpRows,
    ];

    /// Exported symbol name in the kernel module.
    pub fn symbol(self) -> &'static str {
        match self {
            Kernel::AddScaler => "addScaler",
            Kernel::DivElements => "divElements",
            Kernel::Exp => "expElements",
            Kernel::Log => "logElements",
            Kernel::Tanh => "tanhElements",
            Kernel::Sin => "sinElements",
            Kernel::Sigmoid => "sigmoidElements",
            Kernel::ClipPositive => "clipPositive",
            Kernel::LessThan => "lessThan",
            Kernel::GreaterThan => "greaterThan",
            Kernel::EqualTo => "equalTo",
            Kernel::PowScalar => "powScalar",
            Kernel::AddChunks => "addChunks",
            Kernel::AddRepeated => "addRepeated",
            Kernel::AddRepeatedPow2 => "addRepeatedPow2",
            Kernel::ScaleRepeated => "scaleRepeated",
            Kernel::ScaleRepeatedPow2 => "scaleRepeatedPow2",
            Kernel::ElemMax => "elemMax",
            Kernel::UniformToBernoulli => "uniformToBernoulli",
            Kernel::MapForward => "mapForward",
            Kernel::MapBackward => "mapBackward",
            Kernel::MapMax => "mapMax",
            Kernel::LogSumExpGroups => "logSumExpGroups",
            Kernel::LogSumExpRows => "logSumExpRows",
        }
    }

    /// Number of arguments the kernel takes.
    pub fn arity(self) -> usize {
        match self {
            Kernel::Exp
            | Kernel::Log
            | Kernel::Tanh
            | Kernel::Sin
            | Kernel::Sigmoid
            | Kernel::ClipPositive
            | Kernel::UniformToBernoulli => 2,
            Kernel::AddScaler
            | Kernel::DivElements
            | Kernel::LessThan
            | Kernel::GreaterThan
            | Kernel::EqualTo
            | Kernel::PowScalar
            | Kernel::ElemMax
            | Kernel::LogSumExpRows => 3,
            Kernel::AddChunks
            | Kernel::AddRepeated
            | Kernel::AddRepeatedPow2
            | Kernel::ScaleRepeated
            | Kernel::ScaleRepeatedPow2
            | Kernel::MapForward
            | Kernel::MapBackward
            | Kernel::MapMax
            | Kernel::LogSumExpGroups => 4,
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    F32(f32),
    U32(u32),
    /// A host length or index, narrowed to `u32` at launch.
    Len(usize),
}

impl KernelArg {
    /// The argument as a device `unsigned int`, if it is one that fits.
    pub fn as_u32(self, kernel: Kernel, position: usize) -> DeviceResult<Option<u32>> {
        match self {
            KernelArg::U32(v) => Ok(Some(v)),
            KernelArg::Len(v) => u32::try_from(v).map(Some).map_err(|_| {
                DeviceError::launch(
                    kernel.symbol(),
                    format!("argument {position} is {v}, beyond the device index range"),
                )
            }),
            _ => Ok(None),
        }
    }
}

impl From<DevicePtr> for KernelArg {
    fn from(p: DevicePtr) -> Self {
        KernelArg::Ptr(p)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        KernelArg::F32(v)
    }
}

impl From<u32> for KernelArg {
    fn from(v: u32) -> Self {
        KernelArg::U32(v)
    }
}

impl From<usize> for KernelArg {
    fn from(v: usize) -> Self {
        KernelArg::Len(v)
    }
}
