//! # gvec-core
//!
//! Dense f32 vectors whose storage and arithmetic live on a device reached
//! only through an ordered command queue.
//!
//! - [`Session`] owns the device and its queue, and creates vectors and mappers
//! - [`Vector`] storage is allocated on first write; until then it reads as zeros
//! - Slices share storage; overlapping destinations are rejected up front
//! - Mutations return a [`Completion`] that can be waited on or awaited

mod buffer;
pub mod config;
mod elementwise;
pub mod error;
pub mod executor;
mod gemm;
mod mapper;
mod reduce;
mod session;
mod vector;

pub use config::SessionConfig;
pub use elementwise::ProbDist;
pub use error::{Result, VecError};
pub use executor::{Completion, Executor};
pub use gemm::{BatchedGemm, Gemm, Gemv};
pub use mapper::Mapper;
pub use session::Session;
pub use vector::Vector;

pub use gvec_kernels::{DeviceError, DeviceStats, EmulatedDevice};
