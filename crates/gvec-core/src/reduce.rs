//! Row reductions: log-sum-exp, log-softmax and column sums.
//!
//! A vector of length `rows * cols` is read as a row-major matrix. The
//! log-sum-exp kernels reduce one row per block, so rows wider than the
//! session's `reduce_width` are first folded into `ceil(cols / width)` partial
//! results per row, repeatedly, until a single block covers what is left.

use gvec_kernels::{
    grid_rows, reduction_block, Device, DevicePtr, GemvCall, Kernel, KernelModule, LinearAlgebra,
    Transpose,
};

use crate::buffer::with_scratch;
use crate::error::{ensure, Result, VecError};
use crate::executor::Completion;
use crate::vector::{fill_ones, Vector};

/// Write the log-sum-exp of each `cols`-wide row of `input` into `out`.
pub(crate) fn log_sum_exp_rows(
    dev: &mut dyn Device,
    input: DevicePtr,
    out: DevicePtr,
    cols: usize,
    width: usize,
) -> Result<()> {
    let rows = input.len() / cols;
    if cols <= width {
        let cfg = grid_rows(rows, reduction_block(cols, width));
        dev.launch(Kernel::LogSumExpRows, cfg, &[out.into(), input.into(), cols.into()])?;
        return Ok(());
    }
    let groups = cols.div_ceil(width);
    if groups >= cols {
        return Err(VecError::Configuration(format!(
            "reduce width {width} cannot fold rows of {cols} columns"
        )));
    }
    tracing::trace!(rows, cols, groups, "log-sum-exp fan-in pass");
    with_scratch(dev, rows * groups, |dev, partial| {
        dev.launch(
            Kernel::LogSumExpGroups,
            grid_rows(rows * groups, width),
            &[partial.into(), input.into(), cols.into(), groups.into()],
        )?;
        log_sum_exp_rows(dev, partial, out, groups, width)
    })
}

impl Vector {
    /// Resolve a chunk size (0 meaning the whole vector) to a row width.
    fn row_width(&self, chunk: usize) -> Result<usize> {
        let cols = if chunk == 0 { self.len() } else { chunk };
        ensure!(
            cols == 0 || self.len() % cols == 0,
            "chunk size {chunk} does not divide length {}",
            self.len()
        );
        Ok(cols)
    }

    /// Log-sum-exp of each `chunk`-sized row, as a new vector with one
    /// element per row. A chunk of 0 treats the whole vector as one row.
    pub fn add_logs(&self, chunk: usize) -> Result<Vector> {
        let cols = self.row_width(chunk)?;
        let rows = if cols == 0 { 0 } else { self.len() / cols };
        let out = self.session().make_vector(rows);
        if rows == 0 {
            return Ok(out);
        }
        let (src, dst) = (self.region().clone(), out.region().clone());
        let width = self.session().config().reduce_width;
        let cfg = out.grid(rows);
        self.sync(move |dev| {
            match src.ptr()? {
                Some(x) => {
                    let o = dst.materialize(dev, false)?;
                    log_sum_exp_rows(dev, x, o, cols, width)?;
                }
                None => {
                    // every row is `cols` zeros
                    let o = dst.materialize(dev, true)?;
                    let lse = (cols as f32).ln();
                    dev.launch(Kernel::AddScaler, cfg, &[lse.into(), o.into(), rows.into()])?;
                }
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Normalize each `chunk`-sized row in place so its exponentials sum to
    /// one, in log space.
    pub fn log_softmax(&self, chunk: usize) -> Result<Completion<()>> {
        let cols = self.row_width(chunk)?;
        if cols == 0 || self.is_empty() {
            return Ok(Completion::ready(Ok(())));
        }
        let rows = self.len() / cols;
        let r = self.region().clone();
        let width = self.session().config().reduce_width;
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let v = r.materialize(dev, true)?;
            with_scratch(dev, rows, |dev, lse| {
                log_sum_exp_rows(dev, v, lse, cols, width)?;
                dev.sscal(rows, -1.0, lse)?;
                dev.launch(
                    Kernel::AddChunks,
                    cfg,
                    &[v.into(), lse.into(), v.len().into(), cols.into()],
                )?;
                Ok(())
            })
        }))
    }

    /// Column sums of the row-major `len / cols` by `cols` matrix.
    pub fn sum_rows(&self, cols: usize) -> Result<Vector> {
        ensure!(cols > 0, "column count must be positive");
        ensure!(
            self.len() % cols == 0,
            "column count {cols} does not divide length {}",
            self.len()
        );
        let rows = self.len() / cols;
        let out = self.session().make_vector(cols);
        let (src, dst) = (self.region().clone(), out.region().clone());
        let cfg = self.grid(rows);
        self.sync(move |dev| {
            let x = match src.ptr()? {
                Some(x) if rows > 0 => x,
                _ => {
                    dst.materialize(dev, true)?;
                    return Ok(());
                }
            };
            let o = dst.materialize(dev, false)?;
            with_scratch(dev, rows, |dev, ones| {
                fill_ones(dev, ones, cfg)?;
                let call = GemvCall {
                    trans: Transpose::No,
                    m: cols,
                    n: rows,
                    alpha: 1.0,
                    lda: cols,
                    incx: 1,
                    beta: 0.0,
                    incy: 1,
                };
                dev.sgemv(&call, x, ones, o)?;
                Ok(())
            })
        })?;
        Ok(out)
    }
}
