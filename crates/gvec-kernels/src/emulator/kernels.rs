//! Host execution of the named kernel set.
//!
//! Elementwise kernels process element `i` only if thread `i` exists in the
//! launch grid. Row kernels process one row per block and require the shared
//! memory a real launch would need.

use std::sync::atomic::Ordering;

use super::EmulatedDevice;
use crate::device::{DevicePtr, DeviceResult, KernelModule};
use crate::error::DeviceError;
use crate::kernel::{Kernel, KernelArg};
use crate::launch::LaunchConfig;

/// Typed access to a kernel's argument list.
struct Args<'a> {
    kernel: Kernel,
    args: &'a [KernelArg],
}

impl<'a> Args<'a> {
    fn new(kernel: Kernel, args: &'a [KernelArg]) -> DeviceResult<Self> {
        if args.len() != kernel.arity() {
            return Err(DeviceError::launch(
                kernel.symbol(),
                format!("expected {} arguments, got {}", kernel.arity(), args.len()),
            ));
        }
        Ok(Self { kernel, args })
    }

    fn ptr(&self, i: usize) -> DeviceResult<DevicePtr> {
        match self.args[i] {
            KernelArg::Ptr(p) => Ok(p),
            other => Err(self.mismatch(i, "pointer", other)),
        }
    }

    fn f32(&self, i: usize) -> DeviceResult<f32> {
        match self.args[i] {
            KernelArg::F32(v) => Ok(v),
            other => Err(self.mismatch(i, "f32", other)),
        }
    }

    fn u32(&self, i: usize) -> DeviceResult<usize> {
        match self.args[i].as_u32(self.kernel, i)? {
            Some(v) => Ok(v as usize),
            None => Err(self.mismatch(i, "u32", self.args[i])),
        }
    }

    fn mismatch(&self, i: usize, want: &str, got: KernelArg) -> DeviceError {
        DeviceError::launch(
            self.kernel.symbol(),
            format!("argument {i} should be {want}, got {got:?}"),
        )
    }
}

/// Numerically stable log-sum-exp of a non-empty slice.
fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f32 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

fn check_index(kernel: Kernel, idx: i32, len: usize) -> DeviceResult<usize> {
    if idx < 0 || idx as usize >= len {
        return Err(DeviceError::launch(
            kernel.symbol(),
            format!("table entry {idx} outside [0, {len})"),
        ));
    }
    Ok(idx as usize)
}

fn check_shared(kernel: Kernel, cfg: &LaunchConfig, per_thread: usize) -> DeviceResult<()> {
    let need = cfg.block_threads() * per_thread;
    if (cfg.shared_mem_bytes as usize) < need {
        return Err(DeviceError::launch(
            kernel.symbol(),
            format!("needs {need} bytes of shared memory, launch provides {}", cfg.shared_mem_bytes),
        ));
    }
    Ok(())
}

impl EmulatedDevice {
    /// Apply `f` to every covered element of `v[..n]`.
    fn map_in_place(&mut self, cfg: &LaunchConfig, v: DevicePtr, n: usize, f: impl Fn(f32) -> f32) -> DeviceResult<()> {
        let covered = cfg.threads().min(n);
        for x in &mut self.f32s_mut(v)?[..covered] {
            *x = f(*x);
        }
        Ok(())
    }

    /// Combine every covered element of `v[..n]` with `w[g(i)]`.
    fn zip_in_place(
        &mut self,
        cfg: &LaunchConfig,
        v: DevicePtr,
        w: DevicePtr,
        n: usize,
        g: impl Fn(usize) -> usize,
        f: impl Fn(f32, f32) -> f32,
    ) -> DeviceResult<()> {
        let ws = self.snapshot(w)?;
        let covered = cfg.threads().min(n);
        let vs = self.f32s_mut(v)?;
        for i in 0..covered {
            let j = g(i);
            let other = *ws.get(j).ok_or_else(|| {
                DeviceError::InvalidBuffer(format!("read of element {j} past {} elements", ws.len()))
            })?;
            vs[i] = f(vs[i], other);
        }
        Ok(())
    }

    fn check_len(&self, kernel: Kernel, ptr: DevicePtr, n: usize) -> DeviceResult<()> {
        if ptr.len() < n {
            return Err(DeviceError::launch(
                kernel.symbol(),
                format!("buffer of {} elements is shorter than n = {n}", ptr.len()),
            ));
        }
        Ok(())
    }
}

impl KernelModule for EmulatedDevice {
    fn launch(&mut self, kernel: Kernel, cfg: LaunchConfig, args: &[KernelArg]) -> DeviceResult<()> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        if cfg.block_threads() == 0 || cfg.blocks() == 0 {
            return Err(DeviceError::launch(kernel.symbol(), "empty launch geometry"));
        }
        let a = Args::new(kernel, args)?;
        match kernel {
            Kernel::AddScaler | Kernel::LessThan | Kernel::GreaterThan | Kernel::EqualTo | Kernel::PowScalar => {
                let s = a.f32(0)?;
                let v = a.ptr(1)?;
                let n = a.u32(2)?;
                self.check_len(kernel, v, n)?;
                let f: fn(f32, f32) -> f32 = match kernel {
                    Kernel::AddScaler => |x, s| x + s,
                    Kernel::LessThan => |x, s| if x < s { 1.0 } else { 0.0 },
                    Kernel::GreaterThan => |x, s| if x > s { 1.0 } else { 0.0 },
                    Kernel::EqualTo => |x, s| if x == s { 1.0 } else { 0.0 },
                    _ => |x, p| x.powf(p),
                };
                self.map_in_place(&cfg, v, n, |x| f(x, s))
            }
            Kernel::Exp
            | Kernel::Log
            | Kernel::Tanh
            | Kernel::Sin
            | Kernel::Sigmoid
            | Kernel::ClipPositive
            | Kernel::UniformToBernoulli => {
                let v = a.ptr(0)?;
                let n = a.u32(1)?;
                self.check_len(kernel, v, n)?;
                let f: fn(f32) -> f32 = match kernel {
                    Kernel::Exp => f32::exp,
                    Kernel::Log => f32::ln,
                    Kernel::Tanh => f32::tanh,
                    Kernel::Sin => f32::sin,
                    Kernel::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
                    Kernel::ClipPositive => |x| x.max(0.0),
                    _ => |x| if x > 0.5 { 1.0 } else { 0.0 },
                };
                self.map_in_place(&cfg, v, n, f)
            }
            Kernel::DivElements | Kernel::ElemMax => {
                let v = a.ptr(0)?;
                let w = a.ptr(1)?;
                let n = a.u32(2)?;
                self.check_len(kernel, v, n)?;
                self.check_len(kernel, w, n)?;
                let f: fn(f32, f32) -> f32 = match kernel {
                    Kernel::DivElements => |x, d| x / d,
                    _ => f32::max,
                };
                self.zip_in_place(&cfg, v, w, n, |i| i, f)
            }
            Kernel::AddChunks => {
                let v = a.ptr(0)?;
                let c = a.ptr(1)?;
                let n = a.u32(2)?;
                let chunk = a.u32(3)?;
                self.check_len(kernel, v, n)?;
                if chunk == 0 {
                    return Err(DeviceError::launch(kernel.symbol(), "chunk size is zero"));
                }
                self.zip_in_place(&cfg, v, c, n, |i| i / chunk, |x, y| x + y)
            }
            Kernel::AddRepeated | Kernel::ScaleRepeated => {
                let v = a.ptr(0)?;
                let r = a.ptr(1)?;
                let n = a.u32(2)?;
                let rep = a.u32(3)?;
                self.check_len(kernel, v, n)?;
                if rep == 0 {
                    return Err(DeviceError::launch(kernel.symbol(), "repeat length is zero"));
                }
                let f: fn(f32, f32) -> f32 = match kernel {
                    Kernel::AddRepeated => |x, y| x + y,
                    _ => |x, y| x * y,
                };
                self.zip_in_place(&cfg, v, r, n, |i| i % rep, f)
            }
            Kernel::AddRepeatedPow2 | Kernel::ScaleRepeatedPow2 => {
                let v = a.ptr(0)?;
                let r = a.ptr(1)?;
                let n = a.u32(2)?;
                let mask = a.u32(3)?;
                self.check_len(kernel, v, n)?;
                let f: fn(f32, f32) -> f32 = match kernel {
                    Kernel::AddRepeatedPow2 => |x, y| x + y,
                    _ => |x, y| x * y,
                };
                self.zip_in_place(&cfg, v, r, n, |i| i & mask, f)
            }
            Kernel::MapForward => {
                let out = a.ptr(0)?;
                let input = a.ptr(1)?;
                let table = a.ptr(2)?;
                let n = a.u32(3)?;
                self.check_len(kernel, out, n)?;
                let ins = self.snapshot(input)?;
                let idx = self.i32s(table)?[..n.min(table.len())].to_vec();
                let covered = cfg.threads().min(idx.len());
                let outs = self.f32s_mut(out)?;
                for i in 0..covered {
                    outs[i] = ins[check_index(kernel, idx[i], ins.len())?];
                }
                Ok(())
            }
            Kernel::MapBackward => {
                let out = a.ptr(0)?;
                let input = a.ptr(1)?;
                let table = a.ptr(2)?;
                let n = a.u32(3)?;
                self.check_len(kernel, input, n)?;
                let ins = self.snapshot(input)?;
                let idx = self.i32s(table)?[..n.min(table.len())].to_vec();
                let covered = cfg.threads().min(idx.len());
                let outs = self.f32s_mut(out)?;
                for i in 0..covered {
                    let j = check_index(kernel, idx[i], outs.len())?;
                    outs[j] += ins[i];
                }
                Ok(())
            }
            Kernel::MapMax => {
                let table = a.ptr(0)?;
                let v = a.ptr(1)?;
                let rows = a.u32(2)?;
                let cols = a.u32(3)?;
                check_shared(kernel, &cfg, 8)?;
                self.check_len(kernel, v, rows * cols)?;
                self.check_len(kernel, table, rows)?;
                let vs = self.snapshot(v)?;
                let out_rows = cfg.blocks().min(rows);
                let ts = self.i32s_mut(table)?;
                for (row, slot) in ts.iter_mut().enumerate().take(out_rows) {
                    let data = &vs[row * cols..(row + 1) * cols];
                    // NaN never wins; an all-NaN row picks column 0
                    let mut best = (f32::NEG_INFINITY, 0usize);
                    for (c, &x) in data.iter().enumerate() {
                        if x > best.0 {
                            best = (x, c);
                        }
                    }
                    let best = best.1;
                    *slot = (row * cols + best) as i32;
                }
                Ok(())
            }
            Kernel::LogSumExpGroups => {
                let out = a.ptr(0)?;
                let input = a.ptr(1)?;
                let cols = a.u32(2)?;
                let groups = a.u32(3)?;
                check_shared(kernel, &cfg, 4)?;
                if cols == 0 || groups == 0 {
                    return Err(DeviceError::launch(kernel.symbol(), "empty row"));
                }
                let width = cfg.block_threads();
                let rows = input.len() / cols;
                self.check_len(kernel, out, rows * groups)?;
                let ins = self.snapshot(input)?;
                let blocks = cfg.blocks().min(rows * groups);
                let outs = self.f32s_mut(out)?;
                for b in 0..blocks {
                    let (row, group) = (b / groups, b % groups);
                    let start = group * width;
                    if start >= cols {
                        continue;
                    }
                    let end = (start + width).min(cols);
                    outs[row * groups + group] = log_sum_exp(&ins[row * cols + start..row * cols + end]);
                }
                Ok(())
            }
            Kernel::LogSumExpRows => {
                let out = a.ptr(0)?;
                let input = a.ptr(1)?;
                let cols = a.u32(2)?;
                check_shared(kernel, &cfg, 4)?;
                if cols == 0 {
                    return Err(DeviceError::launch(kernel.symbol(), "empty row"));
                }
                let rows = input.len() / cols;
                self.check_len(kernel, out, rows)?;
                let ins = self.snapshot(input)?;
                let blocks = cfg.blocks().min(rows);
                let outs = self.f32s_mut(out)?;
                for (row, slot) in outs.iter_mut().enumerate().take(blocks) {
                    *slot = log_sum_exp(&ins[row * cols..(row + 1) * cols]);
                }
                Ok(())
            }
        }
    }
}
