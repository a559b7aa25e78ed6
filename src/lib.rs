//! # gvec
//!
//! Lazily materialized, alias-checked f32 vectors executed on an ordered
//! device command queue.
//!
//! ```no_run
//! use gvec::{Session, ProbDist};
//!
//! let session = Session::emulated()?;
//! let v = session.make_vector_data(&[1.0, 2.0, 3.0, 4.0])?;
//! v.scale(2.0);
//! v.add_scalar(1.0);
//! assert_eq!(v.sum()?, 24.0);
//!
//! let noise = session.make_vector(1024);
//! noise.rand(ProbDist::Normal).wait()?;
//! # Ok::<(), gvec::VecError>(())
//! ```

pub use gvec_core::*;

/// The device boundary: contract traits, launch geometry and devices.
pub mod kernels {
    pub use gvec_kernels::*;
}
