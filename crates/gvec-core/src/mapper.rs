//! Gather/scatter index tables.

use gvec_kernels::{
    grid_rows, reduction_block, DeviceMemory, ElemKind, Kernel, KernelModule, LaunchConfig,
};

use crate::buffer::{LazyBuffer, Region};
use crate::error::{ensure, Result, VecError};
use crate::executor::Completion;
use crate::session::Session;
use crate::vector::Vector;

/// An immutable table of `out_size` indices into an input of `in_size`
/// elements, stored on the device.
///
/// [`Mapper::map`] gathers `out[i] = in[table[i]]`; [`Mapper::map_transpose`]
/// scatter-adds `out[table[i]] += in[i]`.
pub struct Mapper {
    // released before the session, as with vectors
    table: Region,
    in_size: usize,
    out_size: usize,
    session: Session,
}

fn to_device_index(idx: usize) -> Result<i32> {
    i32::try_from(idx).map_err(|_| {
        VecError::Contract(format!("index {idx} does not fit the device index type"))
    })
}

impl Mapper {
    pub(crate) fn new(session: Session, in_size: usize, table: &[usize]) -> Result<Self> {
        ensure!(in_size <= i32::MAX as usize, "input size {in_size} is too large to index");
        let mut entries = Vec::with_capacity(table.len());
        for (i, &idx) in table.iter().enumerate() {
            ensure!(idx < in_size, "table entry {i} is {idx}, outside [0, {in_size})");
            entries.push(to_device_index(idx)?);
        }
        let mapper = Self::empty(session, in_size, table.len());
        let region = mapper.table.clone();
        mapper
            .session
            .executor()
            .submit_sync(move |dev| {
                if !entries.is_empty() {
                    let p = region.materialize(dev, false)?;
                    dev.write_i32(p, &entries)?;
                }
                Ok(())
            })?;
        Ok(mapper)
    }

    /// A mapper whose table has not been written yet.
    fn empty(session: Session, in_size: usize, out_size: usize) -> Self {
        let root = LazyBuffer::with_kind(ElemKind::I32, out_size, session.executor().sender());
        Self {
            table: Region::whole(root),
            in_size,
            out_size,
            session,
        }
    }

    pub fn in_size(&self) -> usize {
        self.in_size
    }

    pub fn out_size(&self) -> usize {
        self.out_size
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Host copy of the index table.
    pub fn table(&self) -> Result<Vec<usize>> {
        let region = self.table.clone();
        self.session.executor().submit_sync(move |dev| {
            let Some(p) = region.ptr()? else {
                return Ok(Vec::new());
            };
            let mut raw = vec![0i32; p.len()];
            dev.read_i32(&mut raw, p)?;
            Ok(raw.into_iter().map(|i| i.max(0) as usize).collect())
        })
    }

    fn check_operands(&self, input: &Vector, out: &Vector, in_len: usize, out_len: usize) -> Result<()> {
        for v in [input, out] {
            ensure!(v.session().same(&self.session), "vector belongs to another session");
        }
        ensure!(input.len() == in_len, "input has length {}, expected {in_len}", input.len());
        ensure!(out.len() == out_len, "output has length {}, expected {out_len}", out.len());
        ensure!(!input.overlaps(out), "input and output overlap");
        Ok(())
    }

    /// Gather: `out[i] = input[table[i]]`.
    pub fn map(&self, input: &Vector, out: &Vector) -> Result<Completion<()>> {
        self.check_operands(input, out, self.in_size, self.out_size)?;
        let (table, src, dst) = (self.table.clone(), input.region().clone(), out.region().clone());
        let cfg = out.grid(self.out_size);
        Ok(out.submit(move |dev| {
            let Some(x) = src.ptr()? else {
                if let Some(o) = dst.ptr()? {
                    dev.clear(o)?;
                }
                return Ok(());
            };
            let o = dst.materialize(dev, false)?;
            if let Some(t) = table.ptr()? {
                if !t.is_empty() {
                    dev.launch(Kernel::MapForward, cfg, &[o.into(), x.into(), t.into(), t.len().into()])?;
                }
            }
            Ok(())
        }))
    }

    /// Scatter-add: `out[table[i]] += input[i]`. Repeated indices accumulate.
    pub fn map_transpose(&self, input: &Vector, out: &Vector) -> Result<Completion<()>> {
        self.check_operands(input, out, self.out_size, self.in_size)?;
        let (table, src, dst) = (self.table.clone(), input.region().clone(), out.region().clone());
        let cfg = out.grid(self.out_size);
        Ok(out.submit(move |dev| {
            let Some(x) = src.ptr()? else {
                return Ok(());
            };
            let o = dst.materialize(dev, true)?;
            if let Some(t) = table.ptr()? {
                if !t.is_empty() {
                    dev.launch(Kernel::MapBackward, cfg, &[o.into(), x.into(), t.into(), t.len().into()])?;
                }
            }
            Ok(())
        }))
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("in_size", &self.in_size)
            .field("out_size", &self.out_size)
            .finish_non_exhaustive()
    }
}

impl Vector {
    /// For each `cols`-wide row, a mapper selecting that row's maximum.
    ///
    /// The table holds absolute indices into this vector, so mapping this
    /// vector through it yields the row maxima. Ties pick the first column.
    pub fn map_max(&self, cols: usize) -> Result<Mapper> {
        if cols == 0 {
            ensure!(self.is_empty(), "column count is zero for a vector of length {}", self.len());
            return Ok(Mapper::empty(self.session().clone(), 0, 0));
        }
        ensure!(
            self.len() % cols == 0,
            "column count {cols} does not divide length {}",
            self.len()
        );
        ensure!(self.len() <= i32::MAX as usize, "vector too long to index");
        let rows = self.len() / cols;
        let mapper = Mapper::empty(self.session().clone(), self.len(), rows);
        let (src, table) = (self.region().clone(), mapper.table.clone());
        let block = reduction_block(cols, self.session().config().reduce_width);
        let cfg = LaunchConfig {
            // each thread keeps a value and its column
            shared_mem_bytes: (block * 8) as u32,
            ..grid_rows(rows, block)
        };
        self.sync(move |dev| {
            if rows == 0 {
                return Ok(());
            }
            let t = table.materialize(dev, false)?;
            match src.ptr()? {
                Some(x) => dev.launch(Kernel::MapMax, cfg, &[t.into(), x.into(), rows.into(), cols.into()])?,
                None => {
                    let firsts = (0..rows)
                        .map(|r| to_device_index(r * cols))
                        .collect::<Result<Vec<_>>>()?;
                    dev.write_i32(t, &firsts)?;
                }
            }
            Ok(())
        })?;
        Ok(mapper)
    }
}
