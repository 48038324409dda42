//! Media targets: the pump thread, the current-frame slot, pipeline time and
//! cross-thread waits on it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use framepump_common::clock::{Deadline, Timebase};
use framepump_common::config::PumpConfig;
use framepump_common::error::{MediaError, MediaResult};
use serde::Serialize;

use crate::events::{Registration, TimeEventQueue, WaitCallback};
use crate::frame::FrameRef;
use crate::priority;
use crate::program::Program;
use crate::source::{effective_frame_rate, FrameCount, FrameSource};
use crate::sync::{lock, panic_message, read, write};

/// Target-specific output step, run once per cycle on the published frame
/// before it is disposed (present a buffer, flush a device, write a file).
pub trait RenderOutput: Send + Sync {
    fn render(&self, target: &MediaTarget, frame: &FrameRef) -> MediaResult<()>;
}

/// Output that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl RenderOutput for NullOutput {
    fn render(&self, _target: &MediaTarget, _frame: &FrameRef) -> MediaResult<()> {
        Ok(())
    }
}

/// Called with every pipeline failure that stops rendering.
pub type FailureObserver = Arc<dyn Fn(&MediaError) + Send + Sync>;

/// Point-in-time view of a target, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStats {
    pub name: String,
    pub rendering: bool,
    pub real_time: bool,
    pub time_secs: f64,
    pub total_frames: u64,
    pub relative_frames: u64,
    pub pending_waits: usize,
    pub generation: Option<u64>,
    pub last_failure: Option<String>,
}

pub struct TargetBuilder {
    name: String,
    config: PumpConfig,
    real_time: Option<bool>,
    timebase: Option<Arc<dyn Timebase>>,
    output: Arc<dyn RenderOutput>,
    on_failure: Option<FailureObserver>,
}

impl TargetBuilder {
    /// Pump settings. `real_time` here applies unless set explicitly.
    pub fn config(mut self, config: PumpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn real_time(mut self, real_time: bool) -> Self {
        self.real_time = Some(real_time);
        self
    }

    pub fn timebase(mut self, timebase: Arc<dyn Timebase>) -> Self {
        self.timebase = Some(timebase);
        self
    }

    pub fn output(mut self, output: impl RenderOutput + 'static) -> Self {
        self.output = Arc::new(output);
        self
    }

    pub fn on_failure(mut self, observer: impl Fn(&MediaError) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> MediaTarget {
        let real_time = self.real_time.unwrap_or(self.config.real_time);
        MediaTarget {
            inner: Arc::new(TargetInner {
                name: self.name,
                config: self.config,
                real_time,
                output: self.output,
                on_failure: self.on_failure,
                timebase: RwLock::new(self.timebase),
                program: RwLock::new(None),
                rendering: AtomicBool::new(false),
                frame: RwLock::new(None),
                events: TimeEventQueue::default(),
                started: Mutex::new(None),
                pump: Mutex::new(None),
                pump_thread: Mutex::new(None),
                total_frames: AtomicU64::new(0),
                relative_frames: AtomicU64::new(0),
                last_failure: Mutex::new(None),
            }),
        }
    }
}

struct TargetInner {
    name: String,
    config: PumpConfig,
    real_time: bool,
    output: Arc<dyn RenderOutput>,
    on_failure: Option<FailureObserver>,
    timebase: RwLock<Option<Arc<dyn Timebase>>>,
    program: RwLock<Option<Arc<Program>>>,
    rendering: AtomicBool,
    /// Replaced wholesale each cycle; readers get whatever frame is current.
    frame: RwLock<Option<FrameRef>>,
    events: TimeEventQueue,
    started: Mutex<Option<Instant>>,
    /// Join handle of the last pump thread. Also serializes `start`.
    pump: Mutex<Option<JoinHandle<()>>>,
    pump_thread: Mutex<Option<ThreadId>>,
    total_frames: AtomicU64,
    relative_frames: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl Drop for TargetInner {
    fn drop(&mut self) {
        self.rendering.store(false, Ordering::SeqCst);
        self.events.release_all();
    }
}

/// Drives a [`Program`] and owns pipeline time.
///
/// Cloning is cheap and every clone refers to the same target. The pump
/// thread only holds a weak reference between cycles, so dropping the last
/// handle stops it.
#[derive(Clone)]
pub struct MediaTarget {
    inner: Arc<TargetInner>,
}

/// Non-owning reference held by the program a target runs.
#[derive(Clone)]
pub(crate) struct WeakTarget(Weak<TargetInner>);

impl WeakTarget {
    pub(crate) fn upgrade(&self) -> Option<MediaTarget> {
        self.0.upgrade().map(|inner| MediaTarget { inner })
    }
}

impl MediaTarget {
    pub fn builder(name: impl Into<String>) -> TargetBuilder {
        TargetBuilder {
            name: name.into(),
            config: PumpConfig::default(),
            real_time: None,
            timebase: None,
            output: Arc::new(NullOutput),
            on_failure: None,
        }
    }

    /// A target with default pump settings and no output.
    pub fn new(name: impl Into<String>, real_time: bool) -> Self {
        Self::builder(name).real_time(real_time).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ptr_eq(&self, other: &MediaTarget) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakTarget {
        WeakTarget(Arc::downgrade(&self.inner))
    }

    /// Bind `program` to this target and make it the one the pump runs.
    /// Takes effect on the next cycle when called while rendering.
    pub fn use_program(&self, program: Arc<Program>) -> MediaResult<()> {
        if let Some(current) = self.program() {
            if Arc::ptr_eq(&current, &program) {
                return Ok(());
            }
        }
        program.set_target(self)?;
        *write(&self.inner.program) = Some(program);
        Ok(())
    }

    pub fn program(&self) -> Option<Arc<Program>> {
        read(&self.inner.program).clone()
    }

    /// Start rendering.
    ///
    /// A program whose source has exactly one frame runs one cycle on the
    /// calling thread and returns its result. Otherwise a pump thread is
    /// spawned and this returns once it is live.
    pub fn start(&self) -> MediaResult<()> {
        let program = self.program().ok_or_else(|| MediaError::NoProgram {
            target: self.inner.name.clone(),
        })?;

        // A single-shot cycle holds the pump lock while it runs.
        if self.on_pump_thread() {
            return Err(MediaError::AlreadyRendering {
                target: self.inner.name.clone(),
            });
        }
        let mut pump = lock(&self.inner.pump);
        if self.is_rendering() {
            return Err(MediaError::AlreadyRendering {
                target: self.inner.name.clone(),
            });
        }
        if let Some(previous) = pump.take() {
            if previous.thread().id() != thread::current().id() {
                let _ = previous.join();
            }
        }

        let single_shot = program
            .frame_source()
            .get()
            .length_in_frames()
            .is_single_shot();
        drop(program);
        if single_shot {
            return self.run_single_shot();
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let weak = self.downgrade();
        let handle = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || pump_loop(weak, ready_tx))?;
        *pump = Some(handle);

        // The pump signals once it has marked itself rendering.
        let _ = ready_rx.recv();
        Ok(())
    }

    fn run_single_shot(&self) -> MediaResult<()> {
        tracing::debug!(media = %self.inner.name, "Single-shot render on calling thread");
        *lock(&self.inner.pump_thread) = Some(thread::current().id());
        *lock(&self.inner.started) = Some(Instant::now());
        self.inner.rendering.store(true, Ordering::SeqCst);

        let result = self.run_guarded();

        self.set_rendering(false);
        *lock(&self.inner.pump_thread) = None;
        if let Err(e) = &result {
            self.report_failure(e);
        }
        result
    }

    /// Stop rendering. The pump exits at the next cycle boundary; every
    /// pending wait is released now.
    pub fn stop(&self) {
        self.set_rendering(false);
    }

    /// Wait for the last pump thread to exit. No-op on the pump thread itself.
    pub fn join_pump(&self) {
        let handle = lock(&self.inner.pump).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                *lock(&self.inner.pump) = Some(handle);
            } else {
                let _ = handle.join();
            }
        }
    }

    pub fn is_rendering(&self) -> bool {
        self.inner.rendering.load(Ordering::SeqCst)
    }

    fn set_rendering(&self, state: bool) {
        let was = self.inner.rendering.swap(state, Ordering::SeqCst);
        if !state {
            // The flag flips before the sweep so late registrations resolve on their own.
            let released = self.inner.events.release_all();
            if was {
                tracing::info!(
                    media = %self.inner.name,
                    total_frames = self.total_elapsed_frames(),
                    released_waits = released,
                    "Rendering stopped"
                );
            }
        }
    }

    /// Whether pipeline time follows the wall clock.
    pub fn is_real_time(&self) -> bool {
        match self.timebase() {
            Some(timebase) => timebase.is_real_time(),
            None => self.inner.real_time,
        }
    }

    pub fn set_timebase(&self, timebase: Option<Arc<dyn Timebase>>) {
        *write(&self.inner.timebase) = timebase;
    }

    fn timebase(&self) -> Option<Arc<dyn Timebase>> {
        read(&self.inner.timebase).clone()
    }

    /// Current pipeline time in seconds.
    ///
    /// An attached timebase wins. Otherwise real-time targets use wall time
    /// since start and offline targets use elapsed frames over the source's
    /// effective frame rate.
    pub fn time(&self) -> f64 {
        if let Some(timebase) = self.timebase() {
            return timebase.time();
        }
        if self.inner.real_time {
            let started = *lock(&self.inner.started);
            return started.map_or(0.0, |start| start.elapsed().as_secs_f64());
        }
        let rate = self
            .program()
            .map(|program| program.frame_source())
            .and_then(|source| effective_frame_rate(source.get().as_ref()));
        match rate {
            Some(rate) => self.total_elapsed_frames() as f64 / rate,
            None => 0.0,
        }
    }

    /// Block until `deadline`.
    ///
    /// Other threads park until the pump releases them, and return at once
    /// when the target is not rendering or the time has passed. On the pump
    /// thread this paces in bounded sleeps instead.
    pub fn sleep_until(&self, deadline: Deadline) {
        self.wait(deadline, None);
    }

    /// Like [`sleep_until`](Self::sleep_until), running `callback` on release.
    /// A released event runs it on the pump thread before waking the caller.
    pub fn sleep_until_then(&self, deadline: Deadline, callback: impl FnOnce() + Send + 'static) {
        self.wait(deadline, Some(Box::new(callback)));
    }

    fn wait(&self, deadline: Deadline, callback: Option<WaitCallback>) {
        if deadline == Deadline::Asap {
            if let Some(callback) = callback {
                callback();
            }
            return;
        }
        if self.on_pump_thread() {
            self.self_wait(deadline);
            if let Some(callback) = callback {
                callback();
            }
            return;
        }
        let registration = self.inner.events.register(
            deadline,
            callback,
            || self.time(),
            || self.is_rendering(),
        );
        match registration {
            Registration::Resolved(callback) => {
                if let Some(callback) = callback {
                    callback();
                }
            }
            Registration::Pending(released) => {
                let _ = released.recv();
            }
        }
    }

    fn self_wait(&self, deadline: Deadline) {
        let nap = Duration::from_micros(self.inner.config.nap_micros.max(1));
        match deadline {
            Deadline::Asap => {}
            Deadline::NotRendering => {
                while self.is_rendering() {
                    thread::sleep(nap);
                }
            }
            Deadline::At(time) => {
                // Offline time only moves when the pump finishes a cycle.
                if time.is_nan() || !self.is_real_time() {
                    return;
                }
                let nap_secs = nap.as_secs_f64();
                let max_slice = Duration::from_millis(self.inner.config.max_sleep_slice_ms.max(1))
                    .as_secs_f64();
                while self.is_rendering() {
                    let remaining = time - self.time();
                    if remaining <= 0.0 {
                        break;
                    }
                    let slice = if remaining > 2.0 * nap_secs {
                        (remaining - nap_secs).min(max_slice)
                    } else {
                        nap_secs
                    };
                    thread::sleep(Duration::from_secs_f64(slice));
                }
            }
        }
    }

    /// Whether the calling thread is the one driving this target.
    pub fn on_pump_thread(&self) -> bool {
        *lock(&self.inner.pump_thread) == Some(thread::current().id())
    }

    /// Number of callers currently parked in `sleep_until`.
    pub fn pending_waits(&self) -> usize {
        self.inner.events.len()
    }

    /// Publish `frame` as the current frame and advance the frame counters.
    ///
    /// The relative counter wraps to 0 when it reaches a bounded source's length.
    pub fn set_frame(&self, source: &dyn FrameSource, frame: impl Into<FrameRef>) {
        *write(&self.inner.frame) = Some(frame.into());
        self.inner.total_frames.fetch_add(1, Ordering::SeqCst);
        let relative = self.inner.relative_frames.fetch_add(1, Ordering::SeqCst) + 1;
        if let FrameCount::Finite(length) = source.length_in_frames() {
            if length > 0 && relative >= length {
                self.inner.relative_frames.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Swap in a derived frame without touching the counters.
    pub fn replace_frame(&self, frame: impl Into<FrameRef>) {
        *write(&self.inner.frame) = Some(frame.into());
    }

    /// The most recently published frame. It may be replaced at any moment.
    pub fn frame(&self) -> Option<FrameRef> {
        read(&self.inner.frame).clone()
    }

    pub fn total_elapsed_frames(&self) -> u64 {
        self.inner.total_frames.load(Ordering::SeqCst)
    }

    pub fn relative_elapsed_frames(&self) -> u64 {
        self.inner.relative_frames.load(Ordering::SeqCst)
    }

    /// Message of the last failure that stopped rendering.
    pub fn last_failure(&self) -> Option<String> {
        lock(&self.inner.last_failure).clone()
    }

    pub fn stats(&self) -> TargetStats {
        TargetStats {
            name: self.inner.name.clone(),
            rendering: self.is_rendering(),
            real_time: self.is_real_time(),
            time_secs: self.time(),
            total_frames: self.total_elapsed_frames(),
            relative_frames: self.relative_elapsed_frames(),
            pending_waits: self.pending_waits(),
            generation: self.program().map(|p| p.generation()),
            last_failure: self.last_failure(),
        }
    }

    /// One drive cycle: run the program, output and dispose the frame it
    /// published, then release waits that are due.
    fn run_one_cycle(&self) -> MediaResult<()> {
        let program = self.program().ok_or_else(|| MediaError::NoProgram {
            target: self.inner.name.clone(),
        })?;
        let before = self.total_elapsed_frames();
        let result = program.run(self);
        drop(program);

        let published = if self.total_elapsed_frames() != before {
            self.frame()
        } else {
            None
        };
        if let Some(frame) = published {
            if result.is_ok() {
                let output = self.inner.output.render(self, &frame);
                if frame.is_last() {
                    self.set_rendering(false);
                }
                frame.dispose();
                output.map_err(|e| {
                    if e.is_pipeline_failure() {
                        e
                    } else {
                        MediaError::stage("RenderOutput", e.to_string())
                    }
                })?;
            } else {
                frame.dispose();
            }
        }
        result?;

        let now = self.time();
        self.inner.events.drain(now, self.is_rendering());
        Ok(())
    }

    fn run_guarded(&self) -> MediaResult<()> {
        match catch_unwind(AssertUnwindSafe(|| self.run_one_cycle())) {
            Ok(result) => result,
            Err(payload) => Err(MediaError::stage_panicked(
                "RenderOutput",
                panic_message(payload.as_ref()),
            )),
        }
    }

    fn report_failure(&self, error: &MediaError) {
        tracing::error!(media = %self.inner.name, error = %error, "Pipeline failure; rendering stopped");
        *lock(&self.inner.last_failure) = Some(error.to_string());
        if let Some(observer) = &self.inner.on_failure {
            observer(error);
        }
    }
}

fn pump_loop(weak: WeakTarget, ready: Sender<()>) {
    let Some(target) = weak.upgrade() else {
        return;
    };
    *lock(&target.inner.pump_thread) = Some(thread::current().id());
    if let Some(nice) = target.inner.config.nice {
        priority::apply_nice(nice);
    }
    *lock(&target.inner.started) = Some(Instant::now());
    target.inner.rendering.store(true, Ordering::SeqCst);
    tracing::info!(
        media = %target.inner.name,
        real_time = target.is_real_time(),
        "Pump started"
    );
    let _ = ready.send(());
    drop(target);

    while let Some(target) = weak.upgrade() {
        if !target.is_rendering() {
            break;
        }
        if let Err(e) = target.run_guarded() {
            target.set_rendering(false);
            target.report_failure(&e);
            break;
        }
    }

    if let Some(target) = weak.upgrade() {
        target.set_rendering(false);
        *lock(&target.inner.pump_thread) = None;
        tracing::debug!(media = %target.inner.name, "Pump exited");
    }
}

impl fmt::Debug for MediaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTarget")
            .field("name", &self.inner.name)
            .field("rendering", &self.is_rendering())
            .field("real_time", &self.inner.real_time)
            .field("total_frames", &self.total_elapsed_frames())
            .finish()
    }
}
