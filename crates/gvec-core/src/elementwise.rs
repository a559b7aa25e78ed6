//! Elementwise, comparison and broadcast kernels, plus random fills.

use gvec_kernels::{is_power_of_two, DeviceMemory, Kernel, KernelModule, LinearAlgebra, RandomSource, Side};
use serde::{Deserialize, Serialize};

use crate::buffer::with_scratch;
use crate::error::{ensure, Result};
use crate::executor::Completion;
use crate::vector::Vector;

/// Distribution for [`Vector::rand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbDist {
    /// Uniform on (0, 1].
    Uniform,
    /// 0 or 1 with equal probability.
    Bernoulli,
    /// Standard normal.
    Normal,
}

impl Vector {
    /// Launch a single-operand kernel `(v, n)` over the whole vector.
    fn unary(&self, kernel: Kernel) -> Completion<()> {
        let r = self.region().clone();
        let cfg = self.grid(r.len());
        self.submit(move |dev| {
            let v = r.materialize(dev, true)?;
            if !v.is_empty() {
                dev.launch(kernel, cfg, &[v.into(), v.len().into()])?;
            }
            Ok(())
        })
    }

    /// Launch a scalar kernel `(s, v, n)` over the whole vector.
    fn with_scalar(&self, kernel: Kernel, s: f32) -> Completion<()> {
        let r = self.region().clone();
        let cfg = self.grid(r.len());
        self.submit(move |dev| {
            let v = r.materialize(dev, true)?;
            if !v.is_empty() {
                dev.launch(kernel, cfg, &[s.into(), v.into(), v.len().into()])?;
            }
            Ok(())
        })
    }

    pub fn exp(&self) -> Completion<()> {
        self.unary(Kernel::Exp)
    }

    pub fn log(&self) -> Completion<()> {
        self.unary(Kernel::Log)
    }

    pub fn tanh(&self) -> Completion<()> {
        self.unary(Kernel::Tanh)
    }

    pub fn sin(&self) -> Completion<()> {
        self.unary(Kernel::Sin)
    }

    /// Logistic sigmoid.
    pub fn sigmoid(&self) -> Completion<()> {
        self.unary(Kernel::Sigmoid)
    }

    /// Replace negative elements with zero.
    pub fn clip_positive(&self) -> Completion<()> {
        self.unary(Kernel::ClipPositive)
    }

    /// Replace each element with 1 if it is below `s`, else 0.
    pub fn less_than(&self, s: f32) -> Completion<()> {
        self.with_scalar(Kernel::LessThan, s)
    }

    pub fn greater_than(&self, s: f32) -> Completion<()> {
        self.with_scalar(Kernel::GreaterThan, s)
    }

    pub fn equal_to(&self, s: f32) -> Completion<()> {
        self.with_scalar(Kernel::EqualTo, s)
    }

    /// Raise every element to the power `p`. For `p > 0` a zero vector
    /// stays zero and unallocated.
    pub fn pow(&self, p: f32) -> Completion<()> {
        if p > 0.0 {
            let r = self.region().clone();
            let cfg = self.grid(r.len());
            return self.submit(move |dev| {
                if let Some(v) = r.ptr()? {
                    if !v.is_empty() {
                        dev.launch(Kernel::PowScalar, cfg, &[p.into(), v.into(), v.len().into()])?;
                    }
                }
                Ok(())
            });
        }
        self.with_scalar(Kernel::PowScalar, p)
    }

    /// Elementwise maximum against `other`.
    pub fn elem_max(&self, other: &Vector) -> Result<Completion<()>> {
        self.check_compat(other, false)?;
        let (dst, src) = (self.region().clone(), other.region().clone());
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let v = dst.materialize(dev, true)?;
            let w = src.materialize(dev, true)?;
            if !v.is_empty() {
                dev.launch(Kernel::ElemMax, cfg, &[v.into(), w.into(), v.len().into()])?;
            }
            Ok(())
        }))
    }

    fn check_broadcast(&self, other: &Vector, what: &str) -> Result<()> {
        self.check_session(other)?;
        self.check_disjoint(other)?;
        ensure!(!other.is_empty(), "{what} operand is empty");
        ensure!(
            self.len() % other.len() == 0,
            "{what} operand length {} does not divide {}",
            other.len(),
            self.len()
        );
        Ok(())
    }

    /// Split the vector into `scalers.len()` equal contiguous chunks and
    /// scale chunk `i` by `scalers[i]`.
    pub fn scale_chunks(&self, scalers: &Vector) -> Result<Completion<()>> {
        self.check_broadcast(scalers, "chunk")?;
        let (dst, src) = (self.region().clone(), scalers.region().clone());
        let chunks = scalers.len();
        Ok(self.submit(move |dev| {
            let Some(v) = dst.ptr()? else {
                return Ok(());
            };
            if v.is_empty() {
                return Ok(());
            }
            let chunk = v.len() / chunks;
            match src.ptr()? {
                Some(w) => dev.sdgmm(Side::Right, chunk, chunks, v, chunk, w, 1, v, chunk)?,
                None => dev.clear(v)?,
            }
            Ok(())
        }))
    }

    /// Add `biases[i]` to every element of chunk `i`.
    pub fn add_chunks(&self, biases: &Vector) -> Result<Completion<()>> {
        self.check_broadcast(biases, "chunk")?;
        let (dst, src) = (self.region().clone(), biases.region().clone());
        let chunk = self.len() / biases.len();
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let Some(c) = src.ptr()? else {
                return Ok(());
            };
            let v = dst.materialize(dev, true)?;
            if !v.is_empty() {
                dev.launch(Kernel::AddChunks, cfg, &[v.into(), c.into(), v.len().into(), chunk.into()])?;
            }
            Ok(())
        }))
    }

    /// Add `pattern` tiled end to end across the vector.
    pub fn add_repeated(&self, pattern: &Vector) -> Result<Completion<()>> {
        self.check_broadcast(pattern, "repeated")?;
        let (dst, src) = (self.region().clone(), pattern.region().clone());
        let (kernel, last) = repeated_kernel(Kernel::AddRepeated, Kernel::AddRepeatedPow2, pattern.len());
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let Some(r) = src.ptr()? else {
                return Ok(());
            };
            let v = dst.materialize(dev, true)?;
            if !v.is_empty() {
                dev.launch(kernel, cfg, &[v.into(), r.into(), v.len().into(), last.into()])?;
            }
            Ok(())
        }))
    }

    /// Multiply by `pattern` tiled end to end across the vector.
    pub fn scale_repeated(&self, pattern: &Vector) -> Result<Completion<()>> {
        self.check_broadcast(pattern, "repeated")?;
        let (dst, src) = (self.region().clone(), pattern.region().clone());
        let (kernel, last) = repeated_kernel(Kernel::ScaleRepeated, Kernel::ScaleRepeatedPow2, pattern.len());
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let Some(v) = dst.ptr()? else {
                return Ok(());
            };
            if v.is_empty() {
                return Ok(());
            }
            match src.ptr()? {
                Some(r) => dev.launch(kernel, cfg, &[v.into(), r.into(), v.len().into(), last.into()])?,
                None => dev.clear(v)?,
            }
            Ok(())
        }))
    }

    /// Overwrite the vector with samples from `dist`.
    pub fn rand(&self, dist: ProbDist) -> Completion<()> {
        let r = self.region().clone();
        let cfg = self.grid(r.len());
        self.submit(move |dev| {
            let v = r.materialize(dev, false)?;
            if v.is_empty() {
                return Ok(());
            }
            match dist {
                ProbDist::Uniform => dev.fill_uniform(v)?,
                ProbDist::Bernoulli => {
                    dev.fill_uniform(v)?;
                    dev.launch(Kernel::UniformToBernoulli, cfg, &[v.into(), v.len().into()])?;
                }
                ProbDist::Normal if v.len() % 2 == 0 => dev.fill_normal(v, 0.0, 1.0)?,
                ProbDist::Normal => {
                    // the generator only fills even counts
                    with_scratch(dev, v.len() + 1, |dev, tmp| {
                        dev.fill_normal(tmp, 0.0, 1.0)?;
                        dev.copy(v, tmp.slice(0, v.len())?)?;
                        Ok(())
                    })?;
                }
            }
            Ok(())
        })
    }
}

/// Pick the modulo or bitmask variant of a repeated-operand kernel and its
/// final argument (the length, or the mask).
fn repeated_kernel(modulo: Kernel, masked: Kernel, len: usize) -> (Kernel, usize) {
    if is_power_of_two(len) {
        (masked, len - 1)
    } else {
        (modulo, len)
    }
}
