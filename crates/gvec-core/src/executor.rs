//! The command queue.
//!
//! A single worker thread owns the [`Device`] and runs queued jobs strictly
//! in submission order. Every device effect in a session goes through here,
//! so host threads can submit concurrently without locks of their own.
//!
//! ```text
//! host threads ──submit──▶ [ job | job | job ] ──▶ worker(&mut dyn Device)
//!       ▲                                               │
//!       └────────────── Completion (oneshot) ◀──────────┘
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};

use gvec_kernels::Device;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, VecError};

pub(crate) type Job = Box<dyn FnOnce(&mut dyn Device) + Send>;

/// Sending half of the queue, held by anything that must enqueue work after
/// its session handle may be gone (deferred buffer release).
pub(crate) type QueueSender = mpsc::UnboundedSender<Job>;

/// Handle to the eventual result of a queued operation.
///
/// Dropping it without waiting is fine for pure mutations: the operation
/// still runs, and later operations still observe its effect.
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Block the calling thread until the operation has run.
    ///
    /// Also callable from async code. A multi-threaded runtime's worker is
    /// released through `block_in_place`; any other thread parks until the
    /// queue replies.
    pub fn wait(self) -> Result<T> {
        let rx = self.rx;
        let recv = move || pollster::block_on(rx).unwrap_or(Err(VecError::QueueClosed));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(recv)
            }
            _ => recv(),
        }
    }

    /// A completion that has already resolved.
    pub(crate) fn ready(value: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(VecError::QueueClosed)))
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Owner of the worker thread and the device it drives.
pub struct Executor {
    tx: Option<QueueSender>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl Executor {
    /// Move `device` onto a new worker thread and start draining jobs.
    pub fn start(device: Box<dyn Device>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = thread::Builder::new()
            .name("gvec-queue".into())
            .spawn(move || {
                let mut device = device;
                while let Some(job) = rx.blocking_recv() {
                    job(device.as_mut());
                }
                tracing::debug!(device = %device.name(), "command queue drained");
            })
            .map_err(|e| VecError::Configuration(format!("spawning queue worker: {e}")))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            worker_id,
        })
    }

    pub(crate) fn sender(&self) -> Option<QueueSender> {
        self.tx.clone()
    }

    /// Enqueue `op` and return immediately.
    pub fn submit<T, F>(&self, op: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Device) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |dev| {
            let res = panic::catch_unwind(AssertUnwindSafe(|| op(dev))).unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                tracing::error!(%msg, "queued operation panicked");
                Err(VecError::Panicked(msg))
            });
            // the caller may have dropped its completion
            let _ = tx.send(res);
        });
        if let Some(queue) = &self.tx {
            // a closed queue drops the job, and with it `tx`
            let _ = queue.send(job);
        }
        Completion { rx }
    }

    /// Enqueue `op` and block until it has run.
    pub fn submit_sync<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Device) -> Result<T> + Send + 'static,
    {
        self.submit(op).wait()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // The worker exits once every sender (ours and those held by live
        // buffers) is gone.
        self.tx.take();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("command queue worker terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvec_kernels::{DeviceMemory, ElemKind, EmulatedDevice};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let exec = Executor::start(Box::new(EmulatedDevice::new())).unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..50 {
            let log = Arc::clone(&log);
            let _ = exec.submit(move |_| {
                log.lock().push(i);
                Ok(())
            });
        }
        exec.submit_sync(|_| Ok(())).unwrap();
        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_device_error_reaches_completion() {
        let exec = Executor::start(Box::new(EmulatedDevice::with_capacity(8))).unwrap();
        let err = exec
            .submit_sync(|dev| Ok(dev.alloc(ElemKind::F32, 100)?))
            .unwrap_err();
        assert!(matches!(err, VecError::Device(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_panicking_job_is_reported_and_queue_survives() {
        let exec = Executor::start(Box::new(EmulatedDevice::new())).unwrap();
        let err = exec
            .submit_sync(|_| -> Result<()> { panic!("boom") })
            .unwrap_err();
        assert_eq!(err, VecError::Panicked("boom".into()));
        assert_eq!(exec.submit_sync(|dev| Ok(dev.name())).unwrap(), "emulated");
    }

    #[test]
    fn test_concurrent_submitters() {
        let exec = Arc::new(Executor::start(Box::new(EmulatedDevice::new())).unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let exec = Arc::clone(&exec);
                let count = Arc::clone(&count);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let count = Arc::clone(&count);
                        let _ = exec.submit(move |_| {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        exec.submit_sync(|_| Ok(())).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_blocking_wait_inside_current_thread_runtime() {
        let exec = Executor::start(Box::new(EmulatedDevice::new())).unwrap();
        assert_eq!(exec.submit_sync(|dev| Ok(dev.name())).unwrap(), "emulated");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_wait_inside_multi_thread_runtime() {
        let exec = Executor::start(Box::new(EmulatedDevice::new())).unwrap();
        assert_eq!(exec.submit(|_| Ok(7)).wait().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_completion_is_awaitable() {
        let exec = Executor::start(Box::new(EmulatedDevice::new())).unwrap();
        let v = exec.submit(|_| Ok(41 + 1)).await.unwrap();
        assert_eq!(v, 42);
    }
}
