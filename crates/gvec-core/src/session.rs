//! Device sessions: the factory for vectors and mappers.

use std::sync::Arc;

use gvec_kernels::{Device, DeviceMemory, EmulatedDevice, RandomSource};

use crate::buffer::{LazyBuffer, Region};
use crate::config::SessionConfig;
use crate::error::{ensure, Result, VecError};
use crate::executor::{Completion, Executor};
use crate::mapper::Mapper;
use crate::vector::{Vector, MAX_LEN};

struct SessionInner {
    executor: Executor,
    config: SessionConfig,
    device_name: String,
}

/// Owner of one device and its ordered command queue.
///
/// Cheap to clone; every clone, vector and mapper created from it shares the
/// same queue. The device is released once the last of them is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start a session on `device` with the default configuration.
    pub fn new(device: impl Device + 'static) -> Result<Self> {
        Self::with_config(device, SessionConfig::default())
    }

    pub fn with_config(device: impl Device + 'static, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let mut device = device;
        if let Some(seed) = config.seed {
            device
                .seed(seed)
                .map_err(|e| VecError::Configuration(format!("seeding generator: {e}")))?;
        }
        let device_name = device.name();
        let executor = Executor::start(Box::new(device))?;
        tracing::debug!(device = %device_name, ?config, "session started");
        Ok(Self {
            inner: Arc::new(SessionInner {
                executor,
                config,
                device_name,
            }),
        })
    }

    /// A session on a fresh [`EmulatedDevice`].
    pub fn emulated() -> Result<Self> {
        Self::new(EmulatedDevice::new())
    }

    /// A session on CUDA GPU `device_idx`.
    #[cfg(feature = "cuda")]
    pub fn cuda(device_idx: usize, config: SessionConfig) -> Result<Self> {
        let device = gvec_kernels::cuda::CudaBackend::new(device_idx)
            .map_err(|e| VecError::Configuration(e.to_string()))?;
        Self::with_config(device, config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Whether `other` is a handle to this same session.
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn new_root(&self, len: usize) -> Arc<LazyBuffer> {
        LazyBuffer::new(len, self.inner.executor.sender())
    }

    /// A zero vector of `len` elements. Allocates nothing.
    pub fn make_vector(&self, len: usize) -> Vector {
        Vector::from_region(self.clone(), Region::whole(self.new_root(len)))
    }

    /// A vector holding a copy of `data`.
    pub fn make_vector_data(&self, data: &[f32]) -> Result<Vector> {
        ensure!(data.len() <= MAX_LEN, "{} elements exceed the device index range", data.len());
        let v = self.make_vector(data.len());
        v.set_data(data)?.wait()?;
        Ok(v)
    }

    /// A new materialized vector holding the parts end to end.
    pub fn concat(&self, parts: &[&Vector]) -> Result<Vector> {
        for p in parts {
            ensure!(p.session().same(self), "cannot concatenate vectors from another session");
        }
        let total: usize = parts.iter().map(|p| p.len()).sum();
        ensure!(total <= MAX_LEN, "{total} elements exceed the device index range");
        let out = self.make_vector(total);
        let dst = out.region().clone();
        let srcs: Vec<_> = parts.iter().map(|p| p.region().clone()).collect();
        self.executor().submit_sync(move |dev| {
            let whole = dst.materialize(dev, false)?;
            let mut offset = 0;
            for src in &srcs {
                let window = whole.slice(offset, offset + src.len())?;
                match src.ptr()? {
                    Some(p) => dev.copy(window, p)?,
                    None => dev.clear(window)?,
                }
                offset += src.len();
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// A mapper gathering `table.len()` outputs from an input of `in_size`.
    pub fn make_mapper(&self, in_size: usize, table: &[usize]) -> Result<Mapper> {
        Mapper::new(self.clone(), in_size, table)
    }

    /// Reseed the random generator; ordered after everything queued so far.
    pub fn seed(&self, seed: u64) -> Completion<()> {
        self.executor().submit(move |dev| Ok(dev.seed(seed)?))
    }

    /// Block until every queued operation has finished on the device.
    pub fn synchronize(&self) -> Result<()> {
        self.executor().submit_sync(|dev| Ok(dev.synchronize()?))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.inner.device_name)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_beyond_index_range_is_violation() {
        let s = Session::emulated().unwrap();
        let huge = s.make_vector(MAX_LEN);
        let err = s.concat(&[&huge, &s.make_vector(1)]).unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[test]
    fn test_rejects_invalid_config() {
        let cfg = SessionConfig {
            reduce_width: 3,
            ..Default::default()
        };
        let err = Session::with_config(EmulatedDevice::new(), cfg).unwrap_err();
        assert!(matches!(err, VecError::Configuration(_)));
    }

    #[test]
    fn test_concat_mixes_empty_and_materialized() {
        let s = Session::emulated().unwrap();
        let a = s.make_vector_data(&[1.0, 2.0]).unwrap();
        let b = s.make_vector(3);
        let c = s.make_vector_data(&[7.0]).unwrap();
        let joined = s.concat(&[&a, &b, &c]).unwrap();
        assert_eq!(joined.data().unwrap(), vec![1.0, 2.0, 0.0, 0.0, 0.0, 7.0]);
        assert!(joined.is_materialized().unwrap());
    }

    #[test]
    fn test_concat_rejects_foreign_vectors() {
        let s1 = Session::emulated().unwrap();
        let s2 = Session::emulated().unwrap();
        let a = s2.make_vector(2);
        assert!(s1.concat(&[&a]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_seeded_sessions_agree() {
        use crate::ProbDist;
        let cfg = SessionConfig::default().with_seed(11);
        let s1 = Session::with_config(EmulatedDevice::new(), cfg.clone()).unwrap();
        let s2 = Session::with_config(EmulatedDevice::new(), cfg).unwrap();
        let a = s1.make_vector(16);
        let b = s2.make_vector(16);
        let _ = a.rand(ProbDist::Normal);
        let _ = b.rand(ProbDist::Normal);
        assert_eq!(a.data().unwrap(), b.data().unwrap());
    }

    #[test]
    fn test_device_name() {
        let s = Session::emulated().unwrap();
        assert_eq!(s.device_name(), "emulated");
        s.synchronize().unwrap();
    }
}
