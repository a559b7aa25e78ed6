//! Matrix products over vectors holding row-major matrices.
//!
//! The BLAS backend is column-major. A row-major matrix is the column-major
//! view of its transpose, so `C = op(A) * op(B)` is issued as
//! `C^T = op(B)^T * op(A)^T` with the operands and dimensions swapped.

use gvec_kernels::{Device, DevicePtr, GemmCall, GemvCall, LinearAlgebra, StreamId, Transpose};

use crate::buffer::Region;
use crate::error::{ensure, Result};
use crate::executor::Completion;
use crate::vector::Vector;

/// Elements spanned by a row-major `rows x cols` matrix with row stride `ld`.
fn extent(rows: usize, cols: usize, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        (rows - 1) * ld + cols
    }
}

fn strided(n: usize, inc: usize) -> usize {
    if n == 0 {
        0
    } else {
        (n - 1) * inc + 1
    }
}

/// `C = alpha * op(A) * op(B) + beta * C` for row-major `C` of shape `[m, n]`.
///
/// `op(A)` is `[m, k]` and `op(B)` is `[k, n]`. Leading dimensions are row
/// strides; [`Gemm::new`] assumes densely packed operands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gemm {
    pub trans_a: bool,
    pub trans_b: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub lda: usize,
    pub ldb: usize,
    pub beta: f32,
    pub ldc: usize,
}

impl Gemm {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            trans_a: false,
            trans_b: false,
            m,
            n,
            k,
            alpha: 1.0,
            lda: k,
            ldb: n,
            beta: 0.0,
            ldc: n,
        }
    }

    /// Read `A` as a packed `[k, m]` matrix and use its transpose.
    pub fn transpose_a(mut self) -> Self {
        self.trans_a = true;
        self.lda = self.m;
        self
    }

    /// Read `B` as a packed `[n, k]` matrix and use its transpose.
    pub fn transpose_b(mut self) -> Self {
        self.trans_b = true;
        self.ldb = self.k;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    /// Override the row strides of all three operands.
    pub fn strides(mut self, lda: usize, ldb: usize, ldc: usize) -> Self {
        self.lda = lda;
        self.ldb = ldb;
        self.ldc = ldc;
        self
    }

    fn a_shape(&self) -> (usize, usize) {
        if self.trans_a {
            (self.k, self.m)
        } else {
            (self.m, self.k)
        }
    }

    fn b_shape(&self) -> (usize, usize) {
        if self.trans_b {
            (self.n, self.k)
        } else {
            (self.k, self.n)
        }
    }

    /// Check strides and operand extents against the given lengths.
    fn check(&self, a: usize, b: usize, c: usize) -> Result<()> {
        let (ar, ac) = self.a_shape();
        let (br, bc) = self.b_shape();
        ensure!(self.lda >= ac.max(1), "lda {} is below row width {ac}", self.lda);
        ensure!(self.ldb >= bc.max(1), "ldb {} is below row width {bc}", self.ldb);
        ensure!(self.ldc >= self.n.max(1), "ldc {} is below row width {}", self.ldc, self.n);
        ensure!(a >= extent(ar, ac, self.lda), "A holds {a} elements, needs {}", extent(ar, ac, self.lda));
        ensure!(b >= extent(br, bc, self.ldb), "B holds {b} elements, needs {}", extent(br, bc, self.ldb));
        ensure!(
            c >= extent(self.m, self.n, self.ldc),
            "C holds {c} elements, needs {}",
            extent(self.m, self.n, self.ldc)
        );
        Ok(())
    }

    /// The column-major call computing the same product.
    pub(crate) fn to_call(&self) -> GemmCall {
        GemmCall {
            trans_a: Transpose::from_flag(self.trans_b),
            trans_b: Transpose::from_flag(self.trans_a),
            m: self.n,
            n: self.m,
            k: self.k,
            alpha: self.alpha,
            lda: self.ldb,
            ldb: self.lda,
            beta: self.beta,
            ldc: self.ldc,
        }
    }

    fn run(&self, dev: &mut dyn Device, a: DevicePtr, b: DevicePtr, c: DevicePtr) -> Result<()> {
        if self.m == 0 || self.n == 0 {
            return Ok(());
        }
        dev.sgemm(&self.to_call(), b, a, c)?;
        Ok(())
    }
}

/// `y = alpha * op(A) * x + beta * y` for row-major `A` of shape `[m, n]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gemv {
    pub trans: bool,
    pub m: usize,
    pub n: usize,
    pub alpha: f32,
    pub lda: usize,
    pub incx: usize,
    pub beta: f32,
    pub incy: usize,
}

impl Gemv {
    pub fn new(m: usize, n: usize) -> Self {
        Self {
            trans: false,
            m,
            n,
            alpha: 1.0,
            lda: n,
            incx: 1,
            beta: 0.0,
            incy: 1,
        }
    }

    pub fn transpose(mut self) -> Self {
        self.trans = true;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    /// (x, y) lengths implied by the transpose flag.
    fn operand_lens(&self) -> (usize, usize) {
        if self.trans {
            (self.m, self.n)
        } else {
            (self.n, self.m)
        }
    }

    fn check(&self, a: usize, x: usize, y: usize) -> Result<()> {
        let (xn, yn) = self.operand_lens();
        ensure!(self.incx > 0 && self.incy > 0, "vector increments must be positive");
        ensure!(self.lda >= self.n.max(1), "lda {} is below row width {}", self.lda, self.n);
        ensure!(a >= extent(self.m, self.n, self.lda), "A holds {a} elements, needs {}", extent(self.m, self.n, self.lda));
        ensure!(x >= strided(xn, self.incx), "x holds {x} elements, needs {}", strided(xn, self.incx));
        ensure!(y >= strided(yn, self.incy), "y holds {y} elements, needs {}", strided(yn, self.incy));
        Ok(())
    }

    pub(crate) fn to_call(&self) -> GemvCall {
        GemvCall {
            trans: Transpose::from_flag(self.trans).flip(),
            m: self.n,
            n: self.m,
            alpha: self.alpha,
            lda: self.lda,
            incx: self.incx,
            beta: self.beta,
            incy: self.incy,
        }
    }
}

/// `num` independent products over equal contiguous slices of each operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchedGemm {
    pub num: usize,
    pub gemm: Gemm,
}

impl BatchedGemm {
    pub fn new(num: usize, gemm: Gemm) -> Self {
        Self { num, gemm }
    }
}

/// Window `i` of `num` equal windows.
fn batch(p: DevicePtr, num: usize, i: usize) -> Result<DevicePtr> {
    let size = p.len() / num;
    Ok(p.slice(i * size, (i + 1) * size)?)
}

/// Issue one product per batch, each on a freshly forked stream recorded in
/// `streams`.
fn fan_out(
    dev: &mut dyn Device,
    g: &Gemm,
    num: usize,
    (a, b, c): (DevicePtr, DevicePtr, DevicePtr),
    streams: &mut Vec<StreamId>,
) -> Result<()> {
    for i in 0..num {
        let s = dev.fork_stream()?;
        streams.push(s);
        dev.set_stream(Some(s))?;
        g.run(dev, batch(a, num, i)?, batch(b, num, i)?, batch(c, num, i)?)?;
    }
    Ok(())
}

impl Vector {
    fn check_product_operands(&self, a: &Vector, b: &Vector) -> Result<()> {
        self.check_session(a)?;
        self.check_session(b)?;
        self.check_disjoint(a)?;
        self.check_disjoint(b)?;
        Ok(())
    }

    /// Materialize the three operands, or report that the product is zero
    /// and the destination has nothing to scale.
    fn product_ptrs(
        dev: &mut dyn Device,
        a: &Region,
        b: &Region,
        c: &Region,
    ) -> Result<Option<(DevicePtr, DevicePtr, DevicePtr)>> {
        let zero_product = !a.is_materialized() || !b.is_materialized();
        if zero_product && !c.is_materialized() {
            return Ok(None);
        }
        Ok(Some((
            a.materialize(dev, true)?,
            b.materialize(dev, true)?,
            c.materialize(dev, true)?,
        )))
    }

    /// Store `g` applied to `a` and `b` in this vector.
    pub fn gemm(&self, g: &Gemm, a: &Vector, b: &Vector) -> Result<Completion<()>> {
        self.check_product_operands(a, b)?;
        g.check(a.len(), b.len(), self.len())?;
        let g = *g;
        let (ra, rb, rc) = (a.region().clone(), b.region().clone(), self.region().clone());
        Ok(self.submit(move |dev| {
            if let Some((a, b, c)) = Self::product_ptrs(dev, &ra, &rb, &rc)? {
                g.run(dev, a, b, c)?;
            }
            Ok(())
        }))
    }

    /// Store `g` applied to matrix `a` and vector `x` in this vector.
    pub fn gemv(&self, g: &Gemv, a: &Vector, x: &Vector) -> Result<Completion<()>> {
        self.check_product_operands(a, x)?;
        g.check(a.len(), x.len(), self.len())?;
        let g = *g;
        let (ra, rx, ry) = (a.region().clone(), x.region().clone(), self.region().clone());
        Ok(self.submit(move |dev| {
            if let Some((a, x, y)) = Self::product_ptrs(dev, &ra, &rx, &ry)? {
                if g.m > 0 && g.n > 0 {
                    dev.sgemv(&g.to_call(), a, x, y)?;
                }
            }
            Ok(())
        }))
    }

    /// Run `bg.num` products, one per equal slice of `a`, `b` and this
    /// vector, each on its own device stream. The whole batch is one queue
    /// step: later operations see either none or all of it.
    pub fn batched_gemm(&self, bg: &BatchedGemm, a: &Vector, b: &Vector) -> Result<Completion<()>> {
        self.check_product_operands(a, b)?;
        let num = bg.num;
        ensure!(num > 0, "batch count must be positive");
        for (name, len) in [("A", a.len()), ("B", b.len()), ("C", self.len())] {
            ensure!(len % num == 0, "batch count {num} does not divide {name} length {len}");
        }
        let g = bg.gemm;
        g.check(a.len() / num, b.len() / num, self.len() / num)?;
        let (ra, rb, rc) = (a.region().clone(), b.region().clone(), self.region().clone());
        Ok(self.submit(move |dev| {
            let Some((a, b, c)) = Self::product_ptrs(dev, &ra, &rb, &rc)? else {
                return Ok(());
            };
            let mut streams = Vec::with_capacity(num);
            let mut res = fan_out(dev, &g, num, (a, b, c), &mut streams);
            tracing::trace!(num, streams = streams.len(), "batched gemm fanned out");
            // always rebind the main stream and join every fork, even after a failure
            let rebind = dev.set_stream(None);
            for s in streams {
                if let Err(e) = dev.join_stream(s) {
                    if res.is_ok() {
                        res = Err(e.into());
                    }
                }
            }
            res?;
            rebind?;
            Ok(())
        }))
    }
}
