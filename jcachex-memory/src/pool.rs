//  Copyright 2025 JCacheX Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

pub(crate) enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

/// Fixed-size thread pool with a bounded job queue.
///
/// Loader invocations and asynchronous completions run here so they never
/// occupy a caller thread or the maintenance thread. A full queue rejects
/// the submission instead of blocking the submitter.
pub(crate) struct WorkerPool {
    tx: flume::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = flume::bounded::<Job>(queue_capacity.max(workers));
        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("jcachex-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            match job {
                                Job::Run(f) => {
                                    if catch_unwind(AssertUnwindSafe(f)).is_err() {
                                        tracing::warn!("worker job panicked");
                                    }
                                }
                                Job::Stop => break,
                            }
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self { tx, handles }
    }

    pub fn sender(&self) -> flume::Sender<Job> {
        self.tx.clone()
    }

    pub fn request_stop(&self) {
        for _ in 0..self.handles.len() {
            let _ = self.tx.send(Job::Stop);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.request_stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Enqueue a job, mapping queue pressure to the public error surface.
pub(crate) fn submit(tx: &flume::Sender<Job>, f: impl FnOnce() + Send + 'static) -> Result<()> {
    tx.try_send(Job::Run(Box::new(f))).map_err(|err| match err {
        flume::TrySendError::Full(_) => Error::Overloaded,
        flume::TrySendError::Disconnected(_) => Error::ShuttingDown,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_jobs_run() {
        let pool = WorkerPool::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            submit(&pool.sender(), move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        drop(pool); // joins, draining queued jobs first
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        submit(&pool.sender(), || panic!("job bug")).unwrap();
        let c = counter.clone();
        submit(&pool.sender(), move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        drop(pool);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_overload_rejects() {
        let pool = WorkerPool::new(1, 1);
        let (block_tx, block_rx) = flume::bounded::<()>(0);

        // Occupy the only worker.
        submit(&pool.sender(), move || {
            let _ = block_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();

        // Fill the queue, then overflow it.
        let mut overloaded = false;
        for _ in 0..16 {
            if let Err(Error::Overloaded) = submit(&pool.sender(), || {}) {
                overloaded = true;
                break;
            }
        }
        assert!(overloaded);
        let _ = block_tx.send(());
    }
}
