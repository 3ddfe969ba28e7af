// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Background worker pool for kernel write requests
//!
//! A write costs a read and an atomic replace against the store. Running it
//! on a worker keeps the kernel request loop free for other callbacks.

use crossbeam_queue::SegQueue;
use std::sync::{
    Arc, Condvar, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Environment override for the worker count
pub const WRITE_THREADS_ENV: &str = "SQLFS_FUSE_WRITE_THREADS";

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WriteDispatcher {
    queue: Arc<SegQueue<Job>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WriteDispatcher {
    pub fn new(thread_count: usize) -> Self {
        let queue = Arc::new(SegQueue::<Job>::new());
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(thread_count.max(1));

        for worker in 0..thread_count.max(1) {
            let queue = Arc::clone(&queue);
            let signal = Arc::clone(&signal);
            let shutdown = Arc::clone(&shutdown);
            handles.push(thread::spawn(move || {
                loop {
                    match queue.pop() {
                        Some(job) => job(),
                        // Queued jobs still run after shutdown is requested
                        None if shutdown.load(Ordering::Acquire) => break,
                        None => {
                            let (lock, cvar) = &*signal;
                            let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
                            if !*pending {
                                pending = cvar
                                    .wait_timeout(pending, Duration::from_millis(5))
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .0;
                            }
                            *pending = false;
                        }
                    }
                }
                debug!(target: "sqlfs::write", worker, "write worker stopped");
            }));
        }

        Self {
            queue,
            signal,
            shutdown,
            handles,
        }
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(job));
        let (lock, cvar) = &*self.signal;
        let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        cvar.notify_one();
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WriteDispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &*self.signal;
            let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = true;
            cvar.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Worker count: configured value, then the environment, then CPU count
pub fn write_worker_count(configured: Option<usize>) -> usize {
    let from_env = || {
        std::env::var(WRITE_THREADS_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
    };
    configured
        .filter(|n| *n > 0)
        .or_else(from_env)
        .unwrap_or_else(|| thread::available_parallelism().map(|p| p.get()).unwrap_or(1).max(2))
}
