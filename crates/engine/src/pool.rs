//! Fixed-size worker pool for background jobs and data-parallel fan-out.
//!
//! Jobs are pulled from one shared `crossbeam-channel` queue. The pool is
//! an explicit value passed to whoever needs it (programs use one for stage
//! disposal, image stages for per-row work).
//!
//! Do not block inside a job on work queued to the same pool: with every
//! worker busy waiting, nothing is left to run the queued jobs.

use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use framepump_common::config::PoolConfig;
use framepump_common::error::{MediaError, MediaResult};

use crate::sync::{lock, panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of jobs queued or running.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *lock(&self.count) += 1;
    }

    fn done(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = lock(&self.count);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

pub struct TaskPool {
    name: String,
    sender: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl TaskPool {
    /// Spawn `threads` workers (at least one) named `{name}-{index}`.
    pub fn new(threads: usize, name: &str) -> MediaResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let mut handles = Vec::new();

        for worker_id in 0..threads.max(1) {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || worker_loop(receiver, pending))
                .map_err(|e| MediaError::pool(format!("Failed to spawn worker: {e}")))?;
            handles.push(handle);
        }

        tracing::debug!(pool = name, threads = handles.len(), "Task pool started");

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            handles,
            pending,
        })
    }

    pub fn from_config(config: &PoolConfig, name: &str) -> MediaResult<Self> {
        Self::new(config.threads, name)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue a job.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.add();
        let job: Job = Box::new(f);
        let rejected = match &self.sender {
            Some(sender) => sender.send(job).err().map(|e| e.into_inner()),
            None => Some(job),
        };
        // Only reachable while the pool is being torn down.
        if let Some(job) = rejected {
            run_job(job);
            self.pending.done();
        }
    }

    /// Split `0..len` into ranges of `chunk` items, run `f` on each range
    /// across the workers, and return the results in range order.
    pub fn map_ranges<T, F>(&self, len: usize, chunk: usize, f: F) -> MediaResult<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Range<usize>) -> T + Send + Sync + 'static,
    {
        if len == 0 {
            return Ok(Vec::new());
        }
        let chunk = chunk.max(1);
        let f = Arc::new(f);
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut tasks = 0;
        for start in (0..len).step_by(chunk) {
            let range = start..(start + chunk).min(len);
            let f = Arc::clone(&f);
            let tx = tx.clone();
            let index = tasks;
            self.execute(move || {
                let _ = tx.send((index, f(range)));
            });
            tasks += 1;
        }
        drop(tx);

        let mut slots: Vec<Option<T>> = (0..tasks).map(|_| None).collect();
        for (index, value) in rx.iter() {
            slots[index] = Some(value);
        }
        slots
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| MediaError::pool(format!("A job on pool '{}' panicked", self.name)))
    }

    /// Block until every queued job has finished.
    pub fn wait_idle(&self) {
        self.pending.wait_zero();
    }
}

fn worker_loop(receiver: Receiver<Job>, pending: Arc<Pending>) {
    while let Ok(job) = receiver.recv() {
        run_job(job);
        pending.done();
    }
}

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::warn!(panic = %panic_message(payload.as_ref()), "Pool job panicked");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!(pool = %self.name, "Task pool stopped");
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("threads", &self.handles.len())
            .finish()
    }
}
