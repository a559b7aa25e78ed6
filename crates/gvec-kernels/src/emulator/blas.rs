//! Column-major BLAS subset on host memory.

use std::sync::atomic::Ordering;

use super::EmulatedDevice;
use crate::device::{DevicePtr, DeviceResult, GemmCall, GemvCall, LinearAlgebra, Side, StreamId, Transpose};
use crate::error::DeviceError;

/// Minimum number of elements a column-major `[rows, cols]` matrix with
/// leading dimension `ld` occupies.
fn matrix_extent(rows: usize, cols: usize, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        ld * (cols - 1) + rows
    }
}

fn vector_extent(n: usize, inc: usize) -> usize {
    if n == 0 {
        0
    } else {
        inc * (n - 1) + 1
    }
}

fn check_extent(call: &'static str, what: &str, have: usize, need: usize) -> DeviceResult<()> {
    if have < need {
        return Err(DeviceError::blas(
            call,
            format!("{what} holds {have} elements, call reads {need}"),
        ));
    }
    Ok(())
}

fn check_ld(call: &'static str, what: &str, ld: usize, rows: usize) -> DeviceResult<()> {
    if ld < rows.max(1) {
        return Err(DeviceError::blas(
            call,
            format!("leading dimension of {what} is {ld}, needs at least {}", rows.max(1)),
        ));
    }
    Ok(())
}

impl EmulatedDevice {
    fn count_blas(&self) {
        self.stats.blas_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl LinearAlgebra for EmulatedDevice {
    fn sscal(&mut self, n: usize, alpha: f32, x: DevicePtr) -> DeviceResult<()> {
        self.count_blas();
        check_extent("sscal", "x", x.len(), n)?;
        for v in &mut self.f32s_mut(x)?[..n] {
            *v *= alpha;
        }
        Ok(())
    }

    fn saxpy(&mut self, n: usize, alpha: f32, x: DevicePtr, y: DevicePtr) -> DeviceResult<()> {
        self.count_blas();
        check_extent("saxpy", "x", x.len(), n)?;
        check_extent("saxpy", "y", y.len(), n)?;
        let xs = self.snapshot(x)?;
        for (yv, xv) in self.f32s_mut(y)?[..n].iter_mut().zip(&xs) {
            *yv += alpha * xv;
        }
        Ok(())
    }

    fn sdot(&mut self, n: usize, x: DevicePtr, y: DevicePtr) -> DeviceResult<f32> {
        self.count_blas();
        check_extent("sdot", "x", x.len(), n)?;
        check_extent("sdot", "y", y.len(), n)?;
        let xs = self.f32s(x)?;
        let ys = self.f32s(y)?;
        Ok(xs[..n].iter().zip(&ys[..n]).fold(0.0f32, |acc, (a, b)| acc + a * b))
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
        self.count_blas();
        check_ld("sdgmm", "A", lda, m)?;
        check_ld("sdgmm", "C", ldc, m)?;
        check_extent("sdgmm", "A", a.len(), matrix_extent(m, n, lda))?;
        check_extent("sdgmm", "C", c.len(), matrix_extent(m, n, ldc))?;
        let diag_len = match side {
            Side::Left => m,
            Side::Right => n,
        };
        check_extent("sdgmm", "x", x.len(), vector_extent(diag_len, incx))?;

        let av = self.snapshot(a)?;
        let xv = self.snapshot(x)?;
        let cv = self.f32s_mut(c)?;
        for j in 0..n {
            for i in 0..m {
                let d = match side {
                    Side::Left => xv[i * incx],
                    Side::Right => xv[j * incx],
                };
                cv[i + j * ldc] = av[i + j * lda] * d;
            }
        }
        Ok(())
    }

    fn sgemm(&mut self, call: &GemmCall, a: DevicePtr, b: DevicePtr, c: DevicePtr) -> DeviceResult<()> {
        self.count_blas();
        let GemmCall {
            trans_a,
            trans_b,
            m,
            n,
            k,
            alpha,
            lda,
            ldb,
            beta,
            ldc,
        } = *call;
        let (a_rows, a_cols) = match trans_a {
            Transpose::No => (m, k),
            Transpose::Yes => (k, m),
        };
        let (b_rows, b_cols) = match trans_b {
            Transpose::No => (k, n),
            Transpose::Yes => (n, k),
        };
        check_ld("sgemm", "A", lda, a_rows)?;
        check_ld("sgemm", "B", ldb, b_rows)?;
        check_ld("sgemm", "C", ldc, m)?;
        check_extent("sgemm", "A", a.len(), matrix_extent(a_rows, a_cols, lda))?;
        check_extent("sgemm", "B", b.len(), matrix_extent(b_rows, b_cols, ldb))?;
        check_extent("sgemm", "C", c.len(), matrix_extent(m, n, ldc))?;

        let av = self.snapshot(a)?;
        let bv = self.snapshot(b)?;
        let op_a = |i: usize, p: usize| match trans_a {
            Transpose::No => av[i + p * lda],
            Transpose::Yes => av[p + i * lda],
        };
        let op_b = |p: usize, j: usize| match trans_b {
            Transpose::No => bv[p + j * ldb],
            Transpose::Yes => bv[j + p * ldb],
        };
        let cv = self.f32s_mut(c)?;
        for j in 0..n {
            for i in 0..m {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += op_a(i, p) * op_b(p, j);
                }
                let idx = i + j * ldc;
                // beta == 0 overwrites C without reading it, as BLAS does
                cv[idx] = if beta == 0.0 {
                    alpha * acc
                } else {
                    alpha * acc + beta * cv[idx]
                };
            }
        }
        Ok(())
    }

    fn sgemv(&mut self, call: &GemvCall, a: DevicePtr, x: DevicePtr, y: DevicePtr) -> DeviceResult<()> {
        self.count_blas();
        let GemvCall {
            trans,
            m,
            n,
            alpha,
            lda,
            incx,
            beta,
            incy,
        } = *call;
        let (x_len, y_len) = match trans {
            Transpose::No => (n, m),
            Transpose::Yes => (m, n),
        };
        check_ld("sgemv", "A", lda, m)?;
        check_extent("sgemv", "A", a.len(), matrix_extent(m, n, lda))?;
        check_extent("sgemv", "x", x.len(), vector_extent(x_len, incx))?;
        check_extent("sgemv", "y", y.len(), vector_extent(y_len, incy))?;

        let av = self.snapshot(a)?;
        let xv = self.snapshot(x)?;
        let yv = self.f32s_mut(y)?;
        for r in 0..y_len {
            let mut acc = 0.0f32;
            for p in 0..x_len {
                let aval = match trans {
                    Transpose::No => av[r + p * lda],
                    Transpose::Yes => av[p + r * lda],
                };
                acc += aval * xv[p * incx];
            }
            let idx = r * incy;
            yv[idx] = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * yv[idx]
            };
        }
        Ok(())
    }

    fn sasum(&mut self, n: usize, x: DevicePtr) -> DeviceResult<f32> {
        self.count_blas();
        check_extent("sasum", "x", x.len(), n)?;
        Ok(self.f32s(x)?[..n].iter().map(|v| v.abs()).sum())
    }

    fn snrm2(&mut self, n: usize, x: DevicePtr) -> DeviceResult<f32> {
        self.count_blas();
        check_extent("snrm2", "x", x.len(), n)?;
        let sq: f64 = self.f32s(x)?[..n].iter().map(|&v| (v as f64) * (v as f64)).sum();
        Ok(sq.sqrt() as f32)
    }

    fn isamax(&mut self, n: usize, x: DevicePtr) -> DeviceResult<usize> {
        self.count_blas();
        check_extent("isamax", "x", x.len(), n)?;
        let xs = &self.f32s(x)?[..n];
        let mut best = 0usize;
        for (i, v) in xs.iter().enumerate() {
            if v.abs() > xs[best].abs() {
                best = i;
            }
        }
        Ok(if n == 0 { 0 } else { best + 1 })
    }

    fn set_stream(&mut self, stream: Option<StreamId>) -> DeviceResult<()> {
        if let Some(s) = stream {
            if !self.streams.contains(&s) {
                return Err(DeviceError::Driver(format!("unknown stream {s:?}")));
            }
        }
        self.blas_stream = stream;
        Ok(())
    }
}
