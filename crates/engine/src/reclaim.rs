//! Generation-based reclamation of stages removed from a program.
//!
//! Every snapshot a program publishes carries a generation. A drive cycle
//! pins the generation it runs; a stage that disappears in the step to
//! generation `g` is retired with tag `g` and may only be disposed once no
//! cycle pinned to a generation below `g` is still running.
//!
//! Pins are taken under the program's snapshot read lock and retirement
//! happens under its write lock, so a cycle either sees the new snapshot or
//! its pin is visible to the collector.
//!
//! A stage put back into the program before its disposal ran is revived on
//! its slot. A batch already handed to a worker then skips it, because the
//! slot no longer carries the generation the batch retired it with.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use crate::pool::TaskPool;
use crate::stage::{Handle, Stage, StageId};
use crate::sync::lock;

/// Type-erased view of a program slot for disposal.
pub(crate) trait Reclaim: Send + Sync {
    fn id(&self) -> StageId;
    fn mark_retired(&self, generation: u64);
    fn dispose_retired(&self, generation: u64) -> bool;
    fn dispose_once(&self) -> bool;
}

impl<S: Stage + ?Sized> Reclaim for Handle<S> {
    fn id(&self) -> StageId {
        Handle::id(self)
    }

    fn mark_retired(&self, generation: u64) {
        Handle::mark_retired(self, generation)
    }

    fn dispose_retired(&self, generation: u64) -> bool {
        Handle::dispose_retired(self, generation)
    }

    fn dispose_once(&self) -> bool {
        Handle::dispose_once(self)
    }
}

struct Retired {
    generation: u64,
    stage: Box<dyn Reclaim>,
}

/// Disposal batches handed to a worker but not finished yet.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
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
            count = self.idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub(crate) struct Reclaimer {
    pins: Mutex<BTreeMap<u64, usize>>,
    retired: Mutex<Vec<Retired>>,
    pool: Option<Arc<TaskPool>>,
    in_flight: Arc<InFlight>,
}

/// Keeps a generation pinned while a cycle runs against it.
pub(crate) struct Pin<'a> {
    reclaimer: &'a Reclaimer,
    generation: u64,
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.reclaimer.unpin(self.generation);
        self.reclaimer.collect();
    }
}

impl Reclaimer {
    pub(crate) fn new(pool: Option<Arc<TaskPool>>) -> Self {
        Self {
            pins: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            pool,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub(crate) fn pin(&self, generation: u64) -> Pin<'_> {
        *lock(&self.pins).entry(generation).or_insert(0) += 1;
        Pin {
            reclaimer: self,
            generation,
        }
    }

    fn unpin(&self, generation: u64) {
        let mut pins = lock(&self.pins);
        if let Some(count) = pins.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&generation);
            }
        }
    }

    /// Tag stages that left the program in the step to `generation`.
    pub(crate) fn retire(&self, generation: u64, stages: Vec<Box<dyn Reclaim>>) {
        let mut retired = lock(&self.retired);
        for stage in stages {
            stage.mark_retired(generation);
            match retired.iter_mut().find(|r| r.stage.id() == stage.id()) {
                Some(entry) => entry.generation = generation,
                None => retired.push(Retired { generation, stage }),
            }
        }
    }

    /// Stages put back into the program are live again and must not be disposed.
    pub(crate) fn unretire(&self, ids: &[StageId]) {
        if ids.is_empty() {
            return;
        }
        lock(&self.retired).retain(|r| !ids.contains(&r.stage.id()));
    }

    /// Hand every retired stage no running cycle can reach to a disposal worker.
    pub(crate) fn collect(&self) {
        let batch: Vec<Retired> = {
            let pins = lock(&self.pins);
            let mut retired = lock(&self.retired);
            if retired.is_empty() {
                return;
            }
            let oldest_pin = pins.keys().next().copied();
            let (ready, waiting): (Vec<Retired>, Vec<Retired>) = retired
                .drain(..)
                .partition(|r| oldest_pin.map_or(true, |oldest| oldest >= r.generation));
            *retired = waiting;
            ready
        };
        if batch.is_empty() {
            return;
        }

        tracing::debug!(stages = batch.len(), "Disposing retired stages");
        self.in_flight.add();
        let in_flight = Arc::clone(&self.in_flight);
        let job = move || {
            for r in &batch {
                r.stage.dispose_retired(r.generation);
            }
            in_flight.done();
        };

        match &self.pool {
            Some(pool) => pool.execute(job),
            None => {
                let job = Arc::new(Mutex::new(Some(job)));
                let spawned = {
                    let job = Arc::clone(&job);
                    thread::Builder::new()
                        .name("stage-reclaim".to_string())
                        .spawn(move || {
                            if let Some(job) = lock(&job).take() {
                                job();
                            }
                        })
                };
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "Cannot spawn disposal thread; disposing inline");
                    if let Some(job) = lock(&job).take() {
                        job();
                    }
                }
            }
        }
    }

    /// Collect, then wait for every disposal handed out so far.
    pub(crate) fn quiesce(&self) {
        self.collect();
        self.in_flight.wait_zero();
    }

    /// Dispose everything still owned, on the calling thread. Only valid once
    /// no cycle can run any more.
    pub(crate) fn dispose_all_now(&self, live: Vec<Box<dyn Reclaim>>) {
        let retired: Vec<Retired> = lock(&self.retired).drain(..).collect();
        for r in retired {
            r.stage.dispose_retired(r.generation);
        }
        for stage in live {
            stage.dispose_once();
        }
    }

    pub(crate) fn retired_len(&self) -> usize {
        lock(&self.retired).len()
    }
}
