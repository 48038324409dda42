//! Hot-swappable render programs.
//!
//! A program is a frame source followed by an ordered list of stages. Edits
//! never mutate the live list: each one clones the current [`Snapshot`],
//! applies its [`Update`]s and publishes the result as a new generation. A
//! drive cycle reads the snapshot once and runs against it to the end, so an
//! edit published mid-cycle only shows up on the next cycle.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use framepump_common::error::{MediaError, MediaResult};

use crate::pool::TaskPool;
use crate::reclaim::{Reclaim, Reclaimer};
use crate::stage::{SourceHandle, StageHandle, StageId};
use crate::sync::{lock, read, write};
use crate::target::{MediaTarget, WeakTarget};

/// The immutable stage list one drive cycle runs against.
#[derive(Debug, Clone)]
pub struct Snapshot {
    generation: u64,
    source: SourceHandle,
    stages: Vec<StageHandle>,
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    /// Stages after the source, in run order.
    pub fn stages(&self) -> &[StageHandle] {
        &self.stages
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.source.id() == id || self.stages.iter().any(|s| s.id() == id)
    }

    fn ids(&self) -> HashSet<StageId> {
        std::iter::once(self.source.id())
            .chain(self.stages.iter().map(StageHandle::id))
            .collect()
    }

    fn slots(&self) -> Vec<Box<dyn Reclaim>> {
        let mut slots: Vec<Box<dyn Reclaim>> = vec![Box::new(self.source.clone())];
        slots.extend(
            self.stages
                .iter()
                .map(|s| Box::new(s.clone()) as Box<dyn Reclaim>),
        );
        slots
    }
}

/// One structural edit.
#[derive(Debug, Clone)]
pub enum Update {
    /// Insert a stage right after the source (`first`) or at the end.
    Add { stage: StageHandle, first: bool },
    Replace { old: StageHandle, new: StageHandle },
    Remove(StageHandle),
    ReplaceSource(SourceHandle),
}

impl Update {
    pub fn add_first(stage: StageHandle) -> Self {
        Update::Add { stage, first: true }
    }

    pub fn add_last(stage: StageHandle) -> Self {
        Update::Add {
            stage,
            first: false,
        }
    }

    pub fn replace(old: StageHandle, new: StageHandle) -> Self {
        Update::Replace { old, new }
    }

    pub fn remove(stage: StageHandle) -> Self {
        Update::Remove(stage)
    }

    pub fn replace_source(source: SourceHandle) -> Self {
        Update::ReplaceSource(source)
    }

    fn apply(self, source: &mut SourceHandle, stages: &mut Vec<StageHandle>) -> MediaResult<()> {
        match self {
            Update::Add { stage, first: true } => stages.insert(0, stage),
            Update::Add {
                stage,
                first: false,
            } => stages.push(stage),
            Update::Replace { old, new } => {
                let pos = stages
                    .iter()
                    .position(|s| *s == old)
                    .ok_or_else(|| MediaError::UnknownStage {
                        stage: old.name().to_string(),
                        id: old.id().get(),
                    })?;
                stages[pos] = new;
            }
            // Removing a stage that is not there is a no-op.
            Update::Remove(stage) => stages.retain(|s| *s != stage),
            Update::ReplaceSource(new) => *source = new,
        }
        Ok(())
    }
}

/// An ordered, hot-swappable pipeline led by a frame source.
pub struct Program {
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes edits and target binding.
    edit: Mutex<()>,
    target: Mutex<Option<WeakTarget>>,
    reclaimer: Reclaimer,
}

impl Program {
    /// A program whose retired stages are disposed on a short-lived thread.
    pub fn new(source: SourceHandle, stages: Vec<StageHandle>) -> Self {
        Self::build(source, stages, None)
    }

    /// A program that disposes retired stages on `pool`.
    pub fn with_pool(source: SourceHandle, stages: Vec<StageHandle>, pool: Arc<TaskPool>) -> Self {
        Self::build(source, stages, Some(pool))
    }

    fn build(source: SourceHandle, stages: Vec<StageHandle>, pool: Option<Arc<TaskPool>>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                generation: 0,
                source,
                stages,
            })),
            edit: Mutex::new(()),
            target: Mutex::new(None),
            reclaimer: Reclaimer::new(pool),
        }
    }

    pub fn add_first(&self, stage: StageHandle) -> MediaResult<()> {
        self.update([Update::add_first(stage)])
    }

    pub fn add_last(&self, stage: StageHandle) -> MediaResult<()> {
        self.update([Update::add_last(stage)])
    }

    pub fn remove(&self, stage: StageHandle) -> MediaResult<()> {
        self.update([Update::remove(stage)])
    }

    pub fn replace(&self, old: StageHandle, new: StageHandle) -> MediaResult<()> {
        self.update([Update::replace(old, new)])
    }

    pub fn replace_source(&self, source: SourceHandle) -> MediaResult<()> {
        self.update([Update::replace_source(source)])
    }

    /// Apply `updates` in order to a copy of the current snapshot and publish
    /// the result. Nothing is published if any update fails.
    ///
    /// When the program is bound, newly added stages are initialized before
    /// the new snapshot becomes visible to the pump. A failing `init` is
    /// logged and the stage stays in the program. A stage that comes back
    /// after removal cancels its pending disposal, or is initialized afresh
    /// if it was already disposed.
    pub fn update(&self, updates: impl IntoIterator<Item = Update>) -> MediaResult<()> {
        let _edit = lock(&self.edit);
        let current = self.snapshot();

        let mut source = current.source.clone();
        let mut stages = current.stages.clone();
        for update in updates {
            update.apply(&mut source, &mut stages)?;
        }
        let next = Snapshot {
            generation: current.generation + 1,
            source,
            stages,
        };

        let old_ids = current.ids();
        let new_ids = next.ids();
        let added: Vec<StageId> = new_ids.difference(&old_ids).copied().collect();
        let removed: Vec<Box<dyn Reclaim>> = current
            .slots()
            .into_iter()
            .filter(|slot| !new_ids.contains(&slot.id()))
            .collect();

        let fresh_source = added.contains(&next.source.id());
        let mut seen = HashSet::new();
        let fresh: Vec<&StageHandle> = next
            .stages
            .iter()
            .filter(|s| added.contains(&s.id()) && seen.insert(s.id()))
            .collect();

        // Before init, so a disposal already running on a worker finishes first.
        if fresh_source {
            next.source.revive();
        }
        for stage in &fresh {
            stage.revive();
        }

        if let Some(target) = self.target() {
            if fresh_source {
                if let Err(e) = next.source.init(&target) {
                    tracing::error!(stage = %next.source.name(), error = %e, "Init of new frame source failed");
                }
            }
            for stage in &fresh {
                if let Err(e) = stage.init(&target) {
                    tracing::error!(stage = %stage.name(), error = %e, "Init of added stage failed");
                }
            }
        }

        let generation = next.generation;
        let removed_count = removed.len();
        {
            let mut live = write(&self.snapshot);
            *live = Arc::new(next);
            self.reclaimer.unretire(&added);
            self.reclaimer.retire(generation, removed);
        }
        tracing::debug!(
            generation,
            added = added.len(),
            removed = removed_count,
            "Program published"
        );

        self.reclaimer.collect();
        Ok(())
    }

    /// Run one drive cycle: the source, then every stage not marked skip,
    /// all against the snapshot current at entry.
    pub fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        let (snapshot, _pin) = {
            let live = read(&self.snapshot);
            let pin = self.reclaimer.pin(live.generation);
            (Arc::clone(&live), pin)
        };

        let source = snapshot.source();
        if !source.is_skip() {
            source.run_internal(target)?;
        }
        for stage in snapshot.stages() {
            if stage.is_skip() {
                continue;
            }
            stage.run_internal(target)?;
        }
        Ok(())
    }

    /// The live snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&read(&self.snapshot))
    }

    pub fn generation(&self) -> u64 {
        read(&self.snapshot).generation
    }

    pub fn frame_source(&self) -> SourceHandle {
        read(&self.snapshot).source.clone()
    }

    pub fn stages(&self) -> Vec<StageHandle> {
        read(&self.snapshot).stages.clone()
    }

    /// Bind to `target` and initialize every current stage.
    ///
    /// Binding is once per program: rebinding the same target is a no-op,
    /// binding a different live target fails with [`MediaError::TargetRebind`].
    /// Every stage gets its `init` even when an earlier one fails; the
    /// binding is only recorded if all of them succeed, so a retry
    /// initializes the whole program again. The first failure is returned.
    pub fn set_target(&self, target: &MediaTarget) -> MediaResult<()> {
        let _edit = lock(&self.edit);
        if let Some(existing) = self.target() {
            if existing.ptr_eq(target) {
                return Ok(());
            }
            return Err(MediaError::TargetRebind {
                bound: existing.name().to_string(),
                requested: target.name().to_string(),
            });
        }

        let snapshot = self.snapshot();
        let mut failures = Vec::new();
        if let Err(e) = snapshot.source.init(target) {
            tracing::error!(stage = %snapshot.source.name(), error = %e, "Init of frame source failed");
            failures.push(e);
        }
        let mut seen = HashSet::new();
        for stage in snapshot.stages.iter().filter(|s| seen.insert(s.id())) {
            if let Err(e) = stage.init(target) {
                tracing::error!(stage = %stage.name(), error = %e, "Init of stage failed");
                failures.push(e);
            }
        }
        if let Some(first) = failures.into_iter().next() {
            return Err(first);
        }

        *lock(&self.target) = Some(target.downgrade());
        tracing::debug!(media = %target.name(), generation = snapshot.generation, "Program bound");
        Ok(())
    }

    /// The bound target, if it is still alive.
    pub fn target(&self) -> Option<MediaTarget> {
        lock(&self.target).as_ref().and_then(WeakTarget::upgrade)
    }

    /// Block until every removed stage that no cycle can reach has been disposed.
    pub fn quiesce(&self) {
        self.reclaimer.quiesce();
    }

    /// Removed stages still waiting for a cycle to finish.
    pub fn retired_count(&self) -> usize {
        self.reclaimer.retired_len()
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        let live = self.snapshot().slots();
        self.reclaimer.quiesce();
        self.reclaimer.dispose_all_now(live);
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Program")
            .field("generation", &snapshot.generation)
            .field("source", &snapshot.source.name())
            .field(
                "stages",
                &snapshot.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
