//! The vector type and its core operations.
//!
//! A [`Vector`] is a window onto a lazily allocated device buffer. Mutating
//! operations validate their arguments on the calling thread, then enqueue
//! the device work and hand back a [`Completion`]. Operations that return a
//! host value block until the queue has run them.

use gvec_kernels::{
    grid_1d, Device, DeviceMemory, DevicePtr, Kernel, KernelModule, LaunchConfig, LinearAlgebra,
    Side,
};

use crate::buffer::{with_scratch, Region};
use crate::error::{ensure, Result};
use crate::executor::Completion;
use crate::session::Session;

/// Longest vector a kernel launch can index.
pub(crate) const MAX_LEN: usize = u32::MAX as usize;

/// A dense f32 vector living on a session's device.
///
/// A vector that has never been written holds no device memory and reads as
/// all zeros. Slices share storage with their parent.
pub struct Vector {
    // declared first so the root's release is queued before the session
    // (and possibly the queue worker) goes away
    region: Region,
    session: Session,
}

impl Vector {
    pub(crate) fn from_region(session: Session, region: Region) -> Self {
        Self { region, session }
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the two vectors share at least one element of storage.
    pub fn overlaps(&self, other: &Vector) -> bool {
        self.region.overlaps(&other.region)
    }

    /// Whether device memory backs this vector yet.
    pub fn is_materialized(&self) -> Result<bool> {
        let r = self.region.clone();
        self.sync(move |_| Ok(r.is_materialized()))
    }

    // ------------------------------------------------------------------
    // Queue plumbing
    // ------------------------------------------------------------------

    pub(crate) fn submit<F>(&self, op: F) -> Completion<()>
    where
        F: FnOnce(&mut dyn Device) -> Result<()> + Send + 'static,
    {
        self.session.executor().submit(op)
    }

    pub(crate) fn sync<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Device) -> Result<T> + Send + 'static,
    {
        self.session.executor().submit_sync(op)
    }

    /// Elementwise launch geometry covering `n` elements.
    pub(crate) fn grid(&self, n: usize) -> LaunchConfig {
        grid_1d(n, self.session.config().block_width)
    }

    pub(crate) fn check_session(&self, other: &Vector) -> Result<()> {
        ensure!(
            self.session.same(&other.session),
            "vectors belong to different sessions"
        );
        Ok(())
    }

    pub(crate) fn check_disjoint(&self, other: &Vector) -> Result<()> {
        ensure!(!self.overlaps(other), "operand overlaps the destination");
        Ok(())
    }

    /// Same session and length; for writes, no shared storage.
    pub(crate) fn check_compat(&self, other: &Vector, read_only: bool) -> Result<()> {
        self.check_session(other)?;
        ensure!(
            self.len() == other.len(),
            "length mismatch: {} vs {}",
            self.len(),
            other.len()
        );
        if !read_only {
            self.check_disjoint(other)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data movement
    // ------------------------------------------------------------------

    /// Host copy of the contents.
    pub fn data(&self) -> Result<Vec<f32>> {
        let r = self.region.clone();
        self.sync(move |dev| {
            let mut out = vec![0.0; r.len()];
            if let Some(p) = r.ptr()? {
                dev.read_f32(&mut out, p)?;
            }
            Ok(out)
        })
    }

    /// Overwrite the leading `data.len()` elements; any remaining elements of
    /// a fresh allocation are zero.
    pub fn set_data(&self, data: &[f32]) -> Result<Completion<()>> {
        ensure!(
            data.len() <= self.len(),
            "{} values do not fit in a vector of length {}",
            data.len(),
            self.len()
        );
        let r = self.region.clone();
        let data = data.to_vec();
        Ok(self.submit(move |dev| {
            let p = r.materialize(dev, data.len() < r.len())?;
            dev.write_f32(p.slice(0, data.len())?, &data)?;
            Ok(())
        }))
    }

    /// Copy `other` into this vector.
    pub fn set(&self, other: &Vector) -> Result<Completion<()>> {
        self.check_compat(other, false)?;
        let (dst, src) = (self.region.clone(), other.region.clone());
        Ok(self.submit(move |dev| {
            match src.ptr()? {
                Some(s) => {
                    let d = dst.materialize(dev, false)?;
                    dev.copy(d, s)?;
                }
                None => {
                    if let Some(d) = dst.ptr()? {
                        dev.clear(d)?;
                    }
                }
            }
            Ok(())
        }))
    }

    /// A new vector with the same contents and its own storage.
    pub fn copy(&self) -> Result<Vector> {
        let out = self.session.make_vector(self.len());
        out.set(self)?.wait()?;
        Ok(out)
    }

    /// A view of `[start, end)` sharing this vector's storage.
    pub fn slice(&self, start: usize, end: usize) -> Result<Vector> {
        ensure!(
            start <= end && end <= self.len(),
            "slice [{start}, {end}) out of range for length {}",
            self.len()
        );
        Ok(Self::from_region(self.session.clone(), self.region.sub(start, end)))
    }

    /// Write `other` at position `start`. A negative `start` drops the
    /// leading elements of `other` that would land before index 0.
    pub fn set_slice(&self, start: isize, other: &Vector) -> Result<Completion<()>> {
        self.check_session(other)?;
        let (len, olen) = (self.len() as isize, other.len() as isize);
        ensure!(
            olen <= len - start,
            "{olen} elements at offset {start} run past length {len}"
        );
        if start <= -olen {
            return Ok(Completion::ready(Ok(())));
        }
        let (dst_start, src_start) = if start < 0 {
            (0, start.unsigned_abs())
        } else {
            (start as usize, 0)
        };
        let count = (other.len() - src_start).min(self.len() - dst_start);
        if count == 0 {
            return Ok(Completion::ready(Ok(())));
        }
        let dst = self.region.sub(dst_start, dst_start + count);
        let src = other.region.sub(src_start, src_start + count);
        ensure!(!dst.overlaps(&src), "source and destination ranges overlap");
        Ok(self.submit(move |dev| {
            let s = src.ptr()?;
            if s.is_none() && !dst.is_materialized() {
                return Ok(());
            }
            let d = dst.materialize(dev, true)?;
            match s {
                Some(s) => dev.copy(d, s)?,
                None => dev.clear(d)?,
            }
            Ok(())
        }))
    }

    // ------------------------------------------------------------------
    // Scalar arithmetic
    // ------------------------------------------------------------------

    /// Multiply every element by `s`. A zero vector stays unallocated, so
    /// non-finite `s` leaves it at zero.
    pub fn scale(&self, s: f32) -> Completion<()> {
        let r = self.region.clone();
        self.submit(move |dev| {
            if let Some(p) = r.ptr()? {
                if !p.is_empty() {
                    dev.sscal(p.len(), s, p)?;
                }
            }
            Ok(())
        })
    }

    pub fn add_scalar(&self, s: f32) -> Completion<()> {
        let r = self.region.clone();
        let cfg = self.grid(r.len());
        self.submit(move |dev| {
            let p = r.materialize(dev, true)?;
            if !p.is_empty() {
                dev.launch(Kernel::AddScaler, cfg, &[s.into(), p.into(), p.len().into()])?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Vector arithmetic
    // ------------------------------------------------------------------

    /// Inner product. Self-dot is allowed.
    pub fn dot(&self, other: &Vector) -> Result<f32> {
        self.check_compat(other, true)?;
        let (a, b) = (self.region.clone(), other.region.clone());
        self.sync(move |dev| match (a.ptr()?, b.ptr()?) {
            (Some(x), Some(y)) if !x.is_empty() => Ok(dev.sdot(x.len(), x, y)?),
            _ => Ok(0.0),
        })
    }

    pub fn add(&self, other: &Vector) -> Result<Completion<()>> {
        self.axpy(1.0, other)
    }

    pub fn sub(&self, other: &Vector) -> Result<Completion<()>> {
        self.axpy(-1.0, other)
    }

    /// `self += alpha * other`
    fn axpy(&self, alpha: f32, other: &Vector) -> Result<Completion<()>> {
        self.check_compat(other, false)?;
        let (dst, src) = (self.region.clone(), other.region.clone());
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let Some(x) = src.ptr()? else {
                return Ok(());
            };
            if x.is_empty() {
                return Ok(());
            }
            match dst.ptr()? {
                Some(y) => dev.saxpy(x.len(), alpha, x, y)?,
                None => {
                    let y = dst.materialize(dev, false)?;
                    dev.copy(y, x)?;
                    if alpha != 1.0 {
                        dev.sscal(y.len(), alpha, y)?;
                    }
                    // 0 + a*x: -0.0 becomes +0.0, as it would through saxpy
                    dev.launch(Kernel::AddScaler, cfg, &[0.0f32.into(), y.into(), y.len().into()])?;
                }
            }
            Ok(())
        }))
    }

    /// Elementwise product, as a diagonal scaling.
    pub fn mul(&self, other: &Vector) -> Result<Completion<()>> {
        self.check_compat(other, false)?;
        let (dst, src) = (self.region.clone(), other.region.clone());
        Ok(self.submit(move |dev| {
            let Some(v) = dst.ptr()? else {
                return Ok(());
            };
            let n = v.len();
            if n == 0 {
                return Ok(());
            }
            match src.ptr()? {
                Some(w) => dev.sdgmm(Side::Left, n, 1, v, n, w, 1, v, n)?,
                None => dev.clear(v)?,
            }
            Ok(())
        }))
    }

    /// Elementwise quotient. A zero receiver stays zero without touching the
    /// divisor, so zero or non-finite divisors are not observed.
    pub fn div(&self, other: &Vector) -> Result<Completion<()>> {
        self.check_compat(other, false)?;
        let (dst, src) = (self.region.clone(), other.region.clone());
        let cfg = self.grid(self.len());
        Ok(self.submit(move |dev| {
            let Some(v) = dst.ptr()? else {
                return Ok(());
            };
            if v.is_empty() {
                return Ok(());
            }
            let w = src.materialize(dev, true)?;
            dev.launch(Kernel::DivElements, cfg, &[v.into(), w.into(), v.len().into()])?;
            Ok(())
        }))
    }

    // ------------------------------------------------------------------
    // Reductions to a scalar
    // ------------------------------------------------------------------

    pub fn sum(&self) -> Result<f32> {
        let r = self.region.clone();
        let cfg = self.grid(r.len());
        self.sync(move |dev| {
            let Some(x) = r.ptr()? else {
                return Ok(0.0);
            };
            if x.is_empty() {
                return Ok(0.0);
            }
            with_scratch(dev, x.len(), |dev, ones| {
                fill_ones(dev, ones, cfg)?;
                Ok(dev.sdot(x.len(), x, ones)?)
            })
        })
    }

    /// Sum of absolute values.
    pub fn abs_sum(&self) -> Result<f32> {
        let r = self.region.clone();
        self.sync(move |dev| match r.ptr()? {
            Some(x) if !x.is_empty() => Ok(dev.sasum(x.len(), x)?),
            _ => Ok(0.0),
        })
    }

    /// Euclidean norm.
    pub fn norm(&self) -> Result<f32> {
        let r = self.region.clone();
        self.sync(move |dev| match r.ptr()? {
            Some(x) if !x.is_empty() => Ok(dev.snrm2(x.len(), x)?),
            _ => Ok(0.0),
        })
    }

    /// Largest absolute value.
    pub fn abs_max(&self) -> Result<f32> {
        let r = self.region.clone();
        self.sync(move |dev| {
            let Some(x) = r.ptr()? else {
                return Ok(0.0);
            };
            let idx = if x.is_empty() { 0 } else { dev.isamax(x.len(), x)? };
            if idx == 0 {
                return Ok(0.0);
            }
            let mut out = [0.0f32];
            dev.read_f32(&mut out, x.slice(idx - 1, idx)?)?;
            Ok(out[0].abs())
        })
    }
}

/// Fill `p` with ones.
pub(crate) fn fill_ones(dev: &mut dyn Device, p: DevicePtr, cfg: LaunchConfig) -> Result<()> {
    dev.clear(p)?;
    dev.launch(Kernel::AddScaler, cfg, &[1.0f32.into(), p.into(), p.len().into()])?;
    Ok(())
}

impl std::fmt::Debug for Vector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vector")
            .field("len", &self.len())
            .field("offset", &self.region.offset())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::emulated().unwrap()
    }

    #[test]
    fn test_fresh_vector_reads_zero_without_allocating() {
        let dev = gvec_kernels::EmulatedDevice::new();
        let stats = dev.stats();
        let s = Session::new(dev).unwrap();
        let v = s.make_vector(5);
        assert_eq!(v.data().unwrap(), vec![0.0; 5]);
        assert_eq!(v.abs_sum().unwrap(), 0.0);
        assert!(!v.is_materialized().unwrap());
        assert_eq!(stats.allocations(), 0);
    }

    #[test]
    fn test_set_data_shorter_clears_tail() {
        let v = session().make_vector(4);
        v.set_data(&[1.0, 2.0]).unwrap().wait().unwrap();
        assert_eq!(v.data().unwrap(), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_set_data_too_long_is_violation() {
        let v = session().make_vector(2);
        assert!(v.set_data(&[1.0, 2.0, 3.0]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_set_rejects_self_and_overlap() {
        let s = session();
        let v = s.make_vector(4);
        assert!(v.set(&v).is_err());
        let a = v.slice(0, 2).unwrap();
        let b = v.slice(1, 3).unwrap();
        assert!(a.set(&b).unwrap_err().is_fatal());
        let c = v.slice(2, 4).unwrap();
        assert!(a.set(&c).is_ok());
    }

    #[test]
    fn test_set_from_zero_clears() {
        let s = session();
        let v = s.make_vector_data(&[1.0, 2.0]).unwrap();
        let z = s.make_vector(2);
        v.set(&z).unwrap().wait().unwrap();
        assert_eq!(v.data().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_slice_writes_through() {
        let s = session();
        let v = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mid = v.slice(1, 3).unwrap();
        mid.scale(10.0);
        assert_eq!(v.data().unwrap(), vec![1.0, 20.0, 30.0, 4.0]);
    }

    #[test]
    fn test_slice_of_unmaterialized_parent() {
        let s = session();
        let v = s.make_vector(4);
        let tail = v.slice(2, 4).unwrap();
        tail.add_scalar(1.0);
        assert_eq!(v.data().unwrap(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_slice_bounds() {
        let v = session().make_vector(3);
        assert!(v.slice(2, 1).is_err());
        assert!(v.slice(0, 4).is_err());
        assert_eq!(v.slice(3, 3).unwrap().len(), 0);
    }

    #[test]
    fn test_set_slice_negative_start_clips() {
        let s = session();
        let v = s.make_vector(3);
        let src = s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap();
        v.set_slice(-1, &src).unwrap().wait().unwrap();
        assert_eq!(v.data().unwrap(), vec![2.0, 3.0, 0.0]);
        v.set_slice(-3, &src).unwrap().wait().unwrap();
        assert_eq!(v.data().unwrap(), vec![2.0, 3.0, 0.0]);
        assert!(v.set_slice(1, &src).is_err());
    }

    #[test]
    fn test_set_slice_within_one_root() {
        let s = session();
        let v = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let head = v.slice(0, 2).unwrap();
        v.set_slice(2, &head).unwrap().wait().unwrap();
        assert_eq!(v.data().unwrap(), vec![1.0, 2.0, 1.0, 2.0]);
        assert!(v.set_slice(1, &head).is_err());
    }

    #[test]
    fn test_add_fast_path_matches_general_path() {
        let s = session();
        let x = s.make_vector_data(&[0.5, -1.25, 3.0]).unwrap();
        let fast = s.make_vector(3);
        fast.sub(&x).unwrap();
        let general = s.make_vector_data(&[0.0; 3]).unwrap();
        general.sub(&x).unwrap();
        assert_eq!(fast.data().unwrap(), general.data().unwrap());
    }

    #[test]
    fn test_fast_path_normalizes_signed_zero() {
        let s = session();
        let neg = s.make_vector_data(&[-0.0, 2.0]).unwrap();
        let pos = s.make_vector_data(&[0.0, 2.0]).unwrap();
        for (x, op) in [(&neg, "add"), (&pos, "sub")] {
            let fast = s.make_vector(2);
            let general = s.make_vector_data(&[0.0; 2]).unwrap();
            for v in [&fast, &general] {
                if op == "add" { v.add(x).unwrap() } else { v.sub(x).unwrap() };
            }
            let fast = fast.data().unwrap();
            assert_eq!(fast[0].to_bits(), 0.0f32.to_bits(), "{op}");
            assert_eq!(fast[0].to_bits(), general.data().unwrap()[0].to_bits(), "{op}");
        }
    }

    #[test]
    fn test_set_slice_of_nothing_allocates_nothing() {
        let dev = gvec_kernels::EmulatedDevice::new();
        let stats = dev.stats();
        let s = Session::new(dev).unwrap();
        let src = s.make_vector_data(&[1.0, 2.0]).unwrap();
        let v = s.make_vector(4);
        v.set_slice(4, &src.slice(0, 0).unwrap()).unwrap().wait().unwrap();
        v.set_slice(-2, &src).unwrap().wait().unwrap();
        assert!(!v.is_materialized().unwrap());
        assert_eq!(stats.allocations(), 1);
    }

    #[test]
    fn test_mul_and_div() {
        let s = session();
        let a = s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap();
        let b = s.make_vector_data(&[2.0, 4.0, 6.0]).unwrap();
        a.mul(&b).unwrap();
        assert_eq!(a.data().unwrap(), vec![2.0, 8.0, 18.0]);
        a.div(&b).unwrap();
        assert_eq!(a.data().unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(a.mul(&a).is_err());
    }

    #[test]
    fn test_norms() {
        let v = session().make_vector_data(&[3.0, -4.0]).unwrap();
        assert_eq!(v.abs_sum().unwrap(), 7.0);
        assert!((v.norm().unwrap() - 5.0).abs() < 1e-6);
        assert_eq!(v.abs_max().unwrap(), 4.0);
        assert_eq!(v.sum().unwrap(), -1.0);
    }

    #[test]
    fn test_dot_allows_self() {
        let v = session().make_vector_data(&[1.0, 2.0]).unwrap();
        assert_eq!(v.dot(&v).unwrap(), 5.0);
    }

    #[test]
    fn test_copy_is_independent() {
        let v = session().make_vector_data(&[1.0, 2.0]).unwrap();
        let c = v.copy().unwrap();
        v.scale(3.0);
        assert_eq!(c.data().unwrap(), vec![1.0, 2.0]);
        assert!(!c.overlaps(&v));
    }
}
