//! Stages (render commands) and the handles a program stores them in.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use framepump_common::error::{MediaError, MediaResult};

use crate::param::Parameters;
use crate::source::FrameSource;
use crate::sync::{lock, panic_message};
use crate::target::MediaTarget;

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a stage handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

impl StageId {
    fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of pipeline work.
///
/// Stages are shared between the pump thread and whatever thread edits the
/// program or tweaks parameters, so every method takes `&self`; keep mutable
/// state behind atomics or locks.
pub trait Stage: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Bind to a target. Called once per bind event; a stage that is removed
    /// and re-added is initialized again.
    fn init(&self, target: &MediaTarget) -> MediaResult<()> {
        let _ = target;
        Ok(())
    }

    /// One unit of work per drive cycle.
    fn run(&self, target: &MediaTarget) -> MediaResult<()>;

    /// Free resources after removal from a program.
    fn dispose(&self) -> MediaResult<()> {
        Ok(())
    }

    fn parameters(&self) -> Option<&Parameters> {
        None
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Where a slot is between insertion into a program and disposal.
#[derive(Debug, Default)]
struct Lifecycle {
    /// Generation whose publish dropped the slot; `None` while it is live.
    retired_at: Option<u64>,
    disposed: bool,
}

/// Program slot holding a stage and the flags the framework observes.
pub(crate) struct StageSlot<S: ?Sized> {
    id: StageId,
    enabled: AtomicBool,
    skip: AtomicBool,
    /// Held across `Stage::dispose`, so a revive waits for a running disposal.
    life: Mutex<Lifecycle>,
    stage: Arc<S>,
}

impl<S: Stage + ?Sized> StageSlot<S> {
    fn new(stage: Arc<S>) -> Self {
        Self {
            id: StageId::next(),
            enabled: AtomicBool::new(true),
            skip: AtomicBool::new(false),
            life: Mutex::new(Lifecycle::default()),
            stage,
        }
    }

    /// Framework entry point for a cycle. No-op while disabled; any error
    /// surfaces as a typed stage failure, and so does a panic.
    fn run_internal(&self, target: &MediaTarget) -> MediaResult<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        match catch_unwind(AssertUnwindSafe(|| self.stage.run(target))) {
            Ok(result) => result.map_err(|e| self.as_stage_failure(e)),
            Err(payload) => Err(MediaError::stage_panicked(
                self.stage.name(),
                panic_message(payload.as_ref()),
            )),
        }
    }

    fn init(&self, target: &MediaTarget) -> MediaResult<()> {
        self.stage.init(target).map_err(|e| self.as_stage_failure(e))
    }

    fn as_stage_failure(&self, error: MediaError) -> MediaError {
        if error.is_pipeline_failure() {
            error
        } else {
            MediaError::stage(self.stage.name(), error.to_string())
        }
    }

    fn mark_retired(&self, generation: u64) {
        lock(&self.life).retired_at = Some(generation);
    }

    /// Back in a program: cancel a pending disposal, or start a new lifecycle
    /// if the stage was already disposed.
    fn revive(&self) {
        let mut life = lock(&self.life);
        life.retired_at = None;
        life.disposed = false;
    }

    /// Dispose the stage if it is still retired by `generation` and not yet
    /// disposed. Returns whether this call did it.
    fn dispose_retired(&self, generation: u64) -> bool {
        let mut life = lock(&self.life);
        if life.disposed || life.retired_at != Some(generation) {
            return false;
        }
        self.dispose_locked(&mut life);
        true
    }

    /// Dispose the stage unless that already happened. Returns whether this call did it.
    fn dispose_once(&self) -> bool {
        let mut life = lock(&self.life);
        if life.disposed {
            return false;
        }
        self.dispose_locked(&mut life);
        true
    }

    fn dispose_locked(&self, life: &mut Lifecycle) {
        life.disposed = true;
        if let Err(e) = self.stage.dispose() {
            tracing::warn!(stage = %self.stage.name(), id = %self.id, error = %e, "Stage disposal failed");
        }
    }
}

/// Shared, clonable reference to a program slot. Equality is identity.
pub struct Handle<S: ?Sized>(Arc<StageSlot<S>>);

/// Handle to a processing stage.
pub type StageHandle = Handle<dyn Stage>;

/// Handle to the frame source in a program's first slot.
pub type SourceHandle = Handle<dyn FrameSource>;

impl StageHandle {
    pub fn new<T: Stage + 'static>(stage: T) -> Self {
        Self::from_arc(Arc::new(stage))
    }

    /// Wrap a stage the caller keeps its own reference to (e.g. to reach its parameters).
    pub fn from_arc(stage: Arc<dyn Stage>) -> Self {
        Self(Arc::new(StageSlot::new(stage)))
    }
}

impl SourceHandle {
    pub fn new<T: FrameSource + 'static>(source: T) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn FrameSource>) -> Self {
        Self(Arc::new(StageSlot::new(source)))
    }
}

impl<S: Stage + ?Sized> Handle<S> {
    pub fn id(&self) -> StageId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        self.0.stage.name()
    }

    pub fn get(&self) -> &Arc<S> {
        &self.0.stage
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Acquire)
    }

    /// Disabled stages stay in the program but their `run` is not called.
    pub fn set_enabled(&self, state: bool) {
        self.0.enabled.store(state, Ordering::Release);
    }

    pub fn is_skip(&self) -> bool {
        self.0.skip.load(Ordering::Acquire)
    }

    /// Skipped stages are passed over by the program.
    pub fn set_skip(&self, state: bool) {
        self.0.skip.store(state, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.0.life).disposed
    }

    pub(crate) fn run_internal(&self, target: &MediaTarget) -> MediaResult<()> {
        self.0.run_internal(target)
    }

    pub(crate) fn init(&self, target: &MediaTarget) -> MediaResult<()> {
        self.0.init(target)
    }

    pub(crate) fn dispose_once(&self) -> bool {
        self.0.dispose_once()
    }

    pub(crate) fn mark_retired(&self, generation: u64) {
        self.0.mark_retired(generation)
    }

    pub(crate) fn revive(&self) {
        self.0.revive()
    }

    pub(crate) fn dispose_retired(&self, generation: u64) -> bool {
        self.0.dispose_retired(generation)
    }
}

impl<S: ?Sized> Clone for Handle<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S: ?Sized> PartialEq for Handle<S> {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl<S: ?Sized> Eq for Handle<S> {}

impl<S: ?Sized> Hash for Handle<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl<S: Stage + ?Sized> fmt::Debug for Handle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("enabled", &self.is_enabled())
            .field("skip", &self.is_skip())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        runs: AtomicUsize,
        disposals: AtomicUsize,
    }

    impl Stage for Counting {
        fn run(&self, _target: &MediaTarget) -> MediaResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dispose(&self) -> MediaResult<()> {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl Stage for Failing {
        fn run(&self, _target: &MediaTarget) -> MediaResult<()> {
            Err(MediaError::parameter("gain out of range"))
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            runs: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_default_name_is_short_type_name() {
        let handle = StageHandle::new(Failing);
        assert_eq!(handle.name(), "Failing");
    }

    #[test]
    fn test_disabled_stage_does_not_run() {
        let target = MediaTarget::new("test", false);
        let stage = counting();
        let handle = StageHandle::from_arc(stage.clone());

        handle.run_internal(&target).unwrap();
        handle.set_enabled(false);
        handle.run_internal(&target).unwrap();
        assert_eq!(stage.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_errors_become_stage_failures() {
        let target = MediaTarget::new("test", false);
        let err = StageHandle::new(Failing).run_internal(&target).unwrap_err();
        assert!(matches!(err, MediaError::Stage { ref stage, .. } if stage == "Failing"));
    }

    struct Panicking;

    impl Stage for Panicking {
        fn run(&self, _target: &MediaTarget) -> MediaResult<()> {
            panic!("index out of bounds");
        }
    }

    #[test]
    fn test_panics_become_stage_failures() {
        let target = MediaTarget::new("test", false);
        let err = StageHandle::new(Panicking).run_internal(&target).unwrap_err();
        assert!(matches!(err, MediaError::StagePanicked { ref message, .. } if message == "index out of bounds"));
    }

    #[test]
    fn test_dispose_once() {
        let stage = counting();
        let handle = StageHandle::from_arc(stage.clone());
        assert!(handle.dispose_once());
        assert!(!handle.clone().dispose_once());
        assert!(handle.is_disposed());
        assert_eq!(stage.disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retired_disposal_skips_revived_stage() {
        let stage = counting();
        let handle = StageHandle::from_arc(stage.clone());

        handle.mark_retired(3);
        handle.revive();
        assert!(!handle.dispose_retired(3));
        assert!(!handle.is_disposed());

        // A later retirement only honours its own generation.
        handle.mark_retired(5);
        assert!(!handle.dispose_retired(3));
        assert!(handle.dispose_retired(5));
        assert!(!handle.dispose_retired(5));
        assert_eq!(stage.disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_revive_after_disposal_starts_new_lifecycle() {
        let stage = counting();
        let handle = StageHandle::from_arc(stage.clone());

        handle.mark_retired(1);
        assert!(handle.dispose_retired(1));
        handle.revive();
        assert!(!handle.is_disposed());

        handle.mark_retired(2);
        assert!(handle.dispose_retired(2));
        assert_eq!(stage.disposals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handles_compare_by_identity() {
        let stage = counting();
        let a = StageHandle::from_arc(stage.clone());
        let b = StageHandle::from_arc(stage);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
