//! Lazily materialized device storage and aliasing identity.
//!
//! A [`LazyBuffer`] is the root of every vector derived from the same source.
//! Until something writes to it, it holds no device memory and reads as all
//! zeros. A [`Region`] is a `[offset, offset + len)` window onto a root; two
//! regions alias iff they share a root and their windows intersect.

use std::sync::Arc;

use gvec_kernels::{Device, DeviceMemory, DevicePtr, DeviceResult, ElemKind};
use parking_lot::Mutex;

use crate::error::Result;
use crate::executor::{Job, QueueSender};

/// Shared, possibly unallocated device storage.
///
/// The slot is only touched by jobs running on the command queue, so its
/// state always reflects every operation submitted before the current one.
pub(crate) struct LazyBuffer {
    kind: ElemKind,
    len: usize,
    slot: Mutex<Option<DevicePtr>>,
    queue: Option<QueueSender>,
}

impl LazyBuffer {
    /// An unmaterialized root of `len` f32 elements.
    pub fn new(len: usize, queue: Option<QueueSender>) -> Arc<Self> {
        Self::with_kind(ElemKind::F32, len, queue)
    }

    pub fn with_kind(kind: ElemKind, len: usize, queue: Option<QueueSender>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            len,
            slot: Mutex::new(None),
            queue,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The backing allocation, if one exists.
    pub fn get(&self) -> Option<DevicePtr> {
        *self.slot.lock()
    }

    /// Allocate the root if needed, zero-filling a fresh allocation when
    /// `clear` is set.
    pub fn materialize(&self, dev: &mut dyn Device, clear: bool) -> DeviceResult<DevicePtr> {
        let mut slot = self.slot.lock();
        if let Some(ptr) = *slot {
            return Ok(ptr);
        }
        let ptr = dev.alloc(self.kind, self.len)?;
        *slot = Some(ptr);
        if clear {
            dev.clear(ptr)?;
        }
        Ok(ptr)
    }
}

impl Drop for LazyBuffer {
    fn drop(&mut self) {
        let Some(ptr) = self.slot.get_mut().take() else {
            return;
        };
        let Some(queue) = &self.queue else {
            return;
        };
        let job: Job = Box::new(move |dev| {
            if let Err(e) = dev.free(ptr) {
                tracing::warn!(error = %e, ?ptr, "failed to release device buffer");
            }
        });
        // A closed queue means the device, and all its memory, is gone.
        let _ = queue.send(job);
    }
}

impl std::fmt::Debug for LazyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyBuffer")
            .field("kind", &self.kind)
            .field("len", &self.len)
            .field("slot", &self.get())
            .finish()
    }
}

/// A window onto a [`LazyBuffer`].
///
/// Regions are what queued jobs capture: they keep the root alive until the
/// job has run, without holding on to the session.
#[derive(Debug, Clone)]
pub(crate) struct Region {
    root: Arc<LazyBuffer>,
    offset: usize,
    len: usize,
}

impl Region {
    /// The whole of `root`.
    pub fn whole(root: Arc<LazyBuffer>) -> Self {
        let len = root.len();
        Self { root, offset: 0, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Sub-window `[start, end)` of this region, relative to its own start.
    /// Bounds are checked by the caller.
    pub fn sub(&self, start: usize, end: usize) -> Self {
        Self {
            root: Arc::clone(&self.root),
            offset: self.offset + start,
            len: end - start,
        }
    }

    pub fn same_root(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Whether the two windows share at least one element of one root.
    pub fn overlaps(&self, other: &Region) -> bool {
        self.same_root(other)
            && self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }

    /// Device view of this window, if the root has been allocated.
    pub fn ptr(&self) -> DeviceResult<Option<DevicePtr>> {
        self.root
            .get()
            .map(|p| p.slice(self.offset, self.offset + self.len))
            .transpose()
    }

    pub fn is_materialized(&self) -> bool {
        self.root.get().is_some()
    }

    /// Device view of this window, allocating the root first if needed.
    ///
    /// A window narrower than its root always zero-fills a fresh allocation,
    /// since the rest of the root must keep reading as zero.
    pub fn materialize(&self, dev: &mut dyn Device, clear: bool) -> DeviceResult<DevicePtr> {
        let whole = self.offset == 0 && self.len == self.root.len();
        let root = self.root.materialize(dev, clear || !whole)?;
        root.slice(self.offset, self.offset + self.len)
    }
}

/// Run `f` with a temporary f32 allocation of `len` elements, releasing it
/// whether or not `f` succeeds.
pub(crate) fn with_scratch<T>(
    dev: &mut dyn Device,
    len: usize,
    f: impl FnOnce(&mut dyn Device, DevicePtr) -> Result<T>,
) -> Result<T> {
    let scratch = dev.alloc(ElemKind::F32, len)?;
    let res = f(dev, scratch);
    let freed = dev.free(scratch);
    let value = res?;
    freed?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvec_kernels::EmulatedDevice;

    #[test]
    fn test_overlap_relation() {
        let root = LazyBuffer::new(10, None);
        let whole = Region::whole(Arc::clone(&root));
        let left = whole.sub(0, 4);
        let right = whole.sub(4, 10);
        assert!(whole.overlaps(&left));
        assert!(!left.overlaps(&right));
        assert!(right.sub(0, 2).overlaps(&whole.sub(5, 6)));
        let other = Region::whole(LazyBuffer::new(10, None));
        assert!(!whole.overlaps(&other));
    }

    #[test]
    fn test_empty_windows_never_overlap() {
        let whole = Region::whole(LazyBuffer::new(4, None));
        assert!(!whole.overlaps(&whole.sub(2, 2)));
    }

    #[test]
    fn test_partial_materialize_clears_rest_of_root() {
        let mut dev = EmulatedDevice::new();
        let whole = Region::whole(LazyBuffer::new(4, None));
        let tail = whole.sub(2, 4);
        let ptr = tail.materialize(&mut dev, false).unwrap();
        dev.write_f32(ptr, &[5.0, 6.0]).unwrap();
        let mut out = [1.0f32; 4];
        dev.read_f32(&mut out, whole.ptr().unwrap().unwrap()).unwrap();
        assert_eq!(out, [0.0, 0.0, 5.0, 6.0]);
    }

    #[test]
    fn test_scratch_released_on_error() {
        let mut dev = EmulatedDevice::new();
        let stats = dev.stats();
        let res: Result<()> = with_scratch(&mut dev, 8, |_, _| {
            Err(crate::VecError::Contract("fail".into()))
        });
        assert!(res.is_err());
        assert_eq!(stats.live_elements(), 0);
        assert_eq!(stats.frees(), 1);
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let mut dev = EmulatedDevice::new();
        let stats = dev.stats();
        let whole = Region::whole(LazyBuffer::new(3, None));
        assert!(whole.ptr().unwrap().is_none());
        let a = whole.materialize(&mut dev, true).unwrap();
        let b = whole.materialize(&mut dev, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(stats.allocations(), 1);
    }
}
