//! Multi-worker timed job executor
//!
//! Jobs are ordered by `(due time, id)` and run on a fixed pool of worker
//! threads. A job scheduled on a *strand* is hash-assigned to a single
//! worker, so all jobs sharing that strand run serially. Repeating jobs are
//! rescheduled at their previous due time plus the period, which keeps the
//! cadence stable regardless of how long the closure ran. Cancellation takes
//! effect at the next due time without disturbing other jobs.
//!
//! The index uses this as a timer fallback for its event-driven maintenance
//! workers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Handle for cancelling a scheduled job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// When and how often to run a job.
#[derive(Clone, Debug, Default)]
pub struct Schedule {
    /// Delay before the first run
    pub after: Duration,
    /// Period for repeating jobs
    pub repeat: Option<Duration>,
    /// Jobs with the same strand run on the same worker, serially
    pub strand: Option<String>,
}

struct Job {
    at: Instant,
    id: u64,
    repeat: Option<Duration>,
    work: Arc<dyn Fn() + Send + Sync>,
}

impl Eq for Job {}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

// BinaryHeap is a max-heap; invert so the earliest (at, id) pops first
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct WorkerQueue {
    jobs: Mutex<BinaryHeap<Job>>,
    wakeup: Condvar,
}

struct SchedulerInner {
    queues: Vec<WorkerQueue>,
    cancelled: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    next_worker: AtomicU64,
    shutdown: AtomicBool,
}

/// Fixed pool of worker threads executing timed jobs.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with `num_threads` workers named `fpindex-timer-N`.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let inner = Arc::new(SchedulerInner {
            queues: (0..num_threads)
                .map(|_| WorkerQueue {
                    jobs: Mutex::new(BinaryHeap::new()),
                    wakeup: Condvar::new(),
                })
                .collect(),
            cancelled: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            next_worker: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("fpindex-timer-{}", i))
                .spawn(move || worker_loop(&inner_clone, i))
                .expect("failed to spawn scheduler worker thread");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `work` according to `schedule`, returning a cancellable id.
    pub fn schedule<F>(&self, work: F, schedule: Schedule) -> JobId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let worker = match &schedule.strand {
            Some(strand) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                strand.hash(&mut hasher);
                (hasher.finish() % self.inner.queues.len() as u64) as usize
            }
            None => {
                let n = self.inner.next_worker.fetch_add(1, AtomicOrdering::Relaxed);
                (n % self.inner.queues.len() as u64) as usize
            }
        };

        let job = Job {
            at: Instant::now() + schedule.after,
            id,
            repeat: schedule.repeat,
            work: Arc::new(work),
        };

        let queue = &self.inner.queues[worker];
        queue.jobs.lock().push(job);
        queue.wakeup.notify_one();
        JobId(id)
    }

    /// Cancel a job. It will not run again after its next due time.
    pub fn cancel(&self, id: JobId) {
        self.inner.cancelled.lock().insert(id.0);
    }

    /// Signal workers to exit and join them. Pending jobs are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        for queue in &self.inner.queues {
            // Hold the lock while notifying so a worker between its shutdown
            // check and wait cannot miss the wakeup
            let _jobs = queue.jobs.lock();
            queue.wakeup.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &SchedulerInner, worker_idx: usize) {
    let queue = &inner.queues[worker_idx];
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                let now = Instant::now();
                match jobs.peek() {
                    Some(job) if job.at <= now => break jobs.pop().unwrap(),
                    Some(job) => {
                        let timeout = job.at - now;
                        queue.wakeup.wait_for(&mut jobs, timeout);
                    }
                    None => {
                        queue.wakeup.wait(&mut jobs);
                    }
                }
            }
        };

        if inner.cancelled.lock().remove(&job.id) {
            continue;
        }

        (job.work)();

        if let Some(period) = job.repeat {
            let mut jobs = queue.jobs.lock();
            jobs.push(Job {
                at: job.at + period,
                id: job.id,
                repeat: job.repeat,
                work: job.work,
            });
        }
    }
}
