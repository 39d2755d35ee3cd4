//! Bounded worker pools. Each route binds one; a full queue is the
//! backpressure signal and surfaces to the client as an overload result.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("worker pool `{0}` queue is full")]
    QueueFull(String),
    #[error("worker pool `{0}` is shut down")]
    Shutdown(String),
}

/// A fixed set of named OS threads draining one bounded queue. Processors
/// are allowed to block on these threads; nothing here runs on the
/// connection I/O tasks.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize, queue_capacity: usize) -> io::Result<Arc<WorkerPool>> {
        let (sender, receiver) = bounded::<Job>(queue_capacity.max(1));
        let mut handles = Vec::with_capacity(workers.max(1));
        for idx in 0..workers.max(1) {
            let receiver: Receiver<Job> = receiver.clone();
            let pool_name = name.to_owned();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, idx))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!(pool = pool_name.as_str(), "worker task panicked");
                        }
                    }
                })?;
            handles.push(handle);
        }
        Ok(Arc::new(WorkerPool {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job without blocking. A full queue or a shut-down pool
    /// hands the rejection back to the caller.
    pub fn try_submit<F>(&self, job: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            None => Err(SubmitError::Shutdown(self.name.clone())),
            Some(tx) => match tx.try_send(Box::new(job)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull(self.name.clone())),
                Err(TrySendError::Disconnected(_)) => {
                    Err(SubmitError::Shutdown(self.name.clone()))
                }
            },
        }
    }

    /// Stops accepting work, drains the queue and joins the workers.
    /// Idempotent; callers racing on shutdown all return once the pool is
    /// down.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);
        let handles: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers holding a live receiver would otherwise linger forever.
        if let Some(sender) = self.sender.lock().unwrap().take() {
            drop(sender);
        }
    }
}
