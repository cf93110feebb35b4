//! A bounded worker pool for expensive cryptographic jobs.
//!
//! The protocol reactors must never stall on a public-key operation:
//! answering an onionskin or checking a certificate chain can take
//! milliseconds, and a busy relay sees thousands of cells in that
//! time.  Instead, the reactor hands the pool an immutable request
//! and a token; a worker thread runs the job; and the result comes
//! back over a completion queue, tagged with the token so the reactor
//! can match it to the circuit or channel that asked.
//!
//! Jobs are order-independent: completions may be delivered in any
//! order, and a completion whose circuit has since been destroyed is
//! simply dropped by the receiver.

use crate::{Error, Result};

use futures::channel::mpsc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::trace;

/// An opaque token correlating a submitted job with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CryptoToken(u64);

/// Maximum number of jobs that may be waiting for a worker before we
/// refuse new submissions.
const MAX_QUEUED_JOBS: usize = 1024;

/// A boxed unit of work, ready to run on a worker thread.
type Job<O> = (CryptoToken, Box<dyn FnOnce() -> O + Send + 'static>);

/// Shared state between the pool handle and its worker threads.
struct PoolShared<O> {
    /// Jobs waiting for a worker.
    queue: Mutex<PoolQueue<O>>,
    /// Signalled when a job is queued or the pool shuts down.
    wakeup: Condvar,
}

/// The queue inside [`PoolShared`], guarded by its mutex.
struct PoolQueue<O> {
    /// Pending jobs, oldest first.
    jobs: VecDeque<Job<O>>,
    /// True when the pool is shutting down and workers should exit.
    shutdown: bool,
}

/// A bounded pool of OS threads for running cryptographic jobs.
///
/// The pool is generic over the output type `O` of its jobs; each
/// completed job is delivered as a `(CryptoToken, O)` pair on the
/// completion queue supplied at construction time.
pub struct CryptoPool<O: Send + 'static> {
    /// State shared with the workers.
    shared: Arc<PoolShared<O>>,
    /// Worker thread handles, joined on drop.
    workers: Vec<thread::JoinHandle<()>>,
    /// Source of fresh tokens.
    next_token: AtomicU64,
}

impl<O: Send + 'static> CryptoPool<O> {
    /// Construct a new pool with `n_workers` threads.
    ///
    /// Results are sent to `completions`; the caller keeps the
    /// receiving end and is responsible for correlating tokens.
    pub fn new(n_workers: usize, completions: mpsc::UnboundedSender<(CryptoToken, O)>) -> Self {
        assert!(n_workers > 0);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(n_workers);
        for idx in 0..n_workers {
            let shared = Arc::clone(&shared);
            let completions = completions.clone();
            let handle = thread::Builder::new()
                .name(format!("crypto-worker-{}", idx))
                .spawn(move || worker_loop(&shared, &completions))
                .expect("failed to spawn crypto worker");
            workers.push(handle);
        }
        CryptoPool {
            shared,
            workers,
            next_token: AtomicU64::new(1),
        }
    }

    /// Submit a job to the pool.
    ///
    /// Returns the token that the completion will carry, or a
    /// resource error if the job queue is full.
    pub fn submit<F>(&self, job: F) -> Result<CryptoToken>
    where
        F: FnOnce() -> O + Send + 'static,
    {
        let token = CryptoToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        {
            let mut q = self
                .shared
                .queue
                .lock()
                .map_err(|_| Error::InternalError("crypto pool lock poisoned".into()))?;
            if q.jobs.len() >= MAX_QUEUED_JOBS {
                return Err(Error::ResourceLimit("crypto job queue full"));
            }
            q.jobs.push_back((token, Box::new(job)));
        }
        self.shared.wakeup.notify_one();
        Ok(token)
    }
}

impl<O: Send + 'static> Drop for CryptoPool<O> {
    fn drop(&mut self) {
        if let Ok(mut q) = self.shared.queue.lock() {
            q.shutdown = true;
            q.jobs.clear();
        }
        self.shared.wakeup.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Body of each worker thread: pull jobs until shutdown.
fn worker_loop<O: Send + 'static>(
    shared: &PoolShared<O>,
    completions: &mpsc::UnboundedSender<(CryptoToken, O)>,
) {
    loop {
        let (token, job) = {
            let mut q = match shared.queue.lock() {
                Ok(q) => q,
                Err(_) => return,
            };
            loop {
                if q.shutdown {
                    return;
                }
                if let Some(job) = q.jobs.pop_front() {
                    break job;
                }
                q = match shared.wakeup.wait(q) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        };
        let output = job();
        // If the receiver is gone, the whole core is shutting down;
        // nothing to do with the result.
        if completions.unbounded_send((token, output)).is_err() {
            trace!("crypto pool completion queue closed; worker exiting");
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::stream::StreamExt;

    #[test]
    fn jobs_complete_with_matching_tokens() {
        let (snd, rcv) = mpsc::unbounded();
        let pool = CryptoPool::new(3, snd);

        let mut expected = std::collections::HashMap::new();
        for i in 0_u64..20 {
            let token = pool.submit(move || i * i).unwrap();
            expected.insert(token, i * i);
        }

        let got: Vec<(CryptoToken, u64)> =
            futures::executor::block_on(rcv.take(20).collect::<Vec<_>>());
        assert_eq!(got.len(), 20);
        for (token, val) in got {
            assert_eq!(expected.remove(&token), Some(val));
        }
        assert!(expected.is_empty());
    }

    #[test]
    fn shutdown_is_clean() {
        let (snd, _rcv) = mpsc::unbounded();
        let pool: CryptoPool<u32> = CryptoPool::new(2, snd);
        let _ = pool.submit(|| 99);
        drop(pool); // must not hang.
    }
}
