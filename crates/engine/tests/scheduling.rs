use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framepump_engine::{
    ClockSource, Deadline, FrameTap, ManualClock, MediaError, MediaResult, MediaTarget, Program,
    SourceHandle, Stage, StageHandle,
};

fn program_with(target: &MediaTarget, source: ClockSource, stages: Vec<StageHandle>) -> Arc<Program> {
    let program = Arc::new(Program::new(SourceHandle::new(source), stages));
    target
        .use_program(program.clone())
        .expect("program should bind");
    program
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn ten_frames_at_ten_fps_wrap_once_and_stop() {
    let target = MediaTarget::new("pump", true);
    let tap = Arc::new(FrameTap::counting());
    program_with(
        &target,
        ClockSource::new(10.0, 10).expect("valid clock"),
        vec![StageHandle::from_arc(tap.clone())],
    );

    let started = Instant::now();
    target.start().expect("start should spawn a pump");
    let waiter = {
        let target = target.clone();
        thread::spawn(move || target.sleep_until(Deadline::NotRendering))
    };
    target.sleep_until(Deadline::NotRendering);
    waiter.join().expect("waiter should be released");
    target.join_pump();

    assert!(started.elapsed() >= Duration::from_millis(850));
    assert!(!target.is_rendering());
    assert_eq!(target.total_elapsed_frames(), 10);
    assert_eq!(target.relative_elapsed_frames(), 0);
    assert_eq!(tap.seen(), 10);
    assert!(target.frame().expect("last frame").is_last());
    assert_eq!(target.pending_waits(), 0);
}

#[test]
fn sleep_until_blocks_until_pipeline_time_and_past_times_return_at_once() {
    let target = MediaTarget::new("pacing", true);
    program_with(&target, ClockSource::infinite(100.0).expect("valid clock"), Vec::new());
    target.start().expect("start");

    target.sleep_until(Deadline::At(0.2));
    assert!(target.time() >= 0.2);

    let late = {
        let target = target.clone();
        thread::spawn(move || {
            target.sleep_until(Deadline::At(0.5));
            target.time()
        })
    };
    let early = {
        let target = target.clone();
        thread::spawn(move || {
            let asked = Instant::now();
            target.sleep_until(Deadline::At(0.1));
            asked.elapsed()
        })
    };

    let early_wait = early.join().expect("early waiter");
    assert!(early_wait < Duration::from_millis(100));

    let released_at = late.join().expect("late waiter");
    assert!(released_at >= 0.5);

    target.stop();
    target.join_pump();
}

#[test]
fn single_shot_source_renders_inline_without_pump_thread() {
    let target = MediaTarget::new("still", true);
    let caller = thread::current().id();
    let threads = Arc::new(Mutex::new(Vec::new()));
    let recorded = threads.clone();
    let tap = FrameTap::new(move |_| {
        recorded
            .lock()
            .expect("lock")
            .push(thread::current().id())
    });
    program_with(
        &target,
        ClockSource::new(24.0, 1).expect("valid clock"),
        vec![StageHandle::new(tap)],
    );

    target.start().expect("single-shot cycle");

    assert_eq!(*threads.lock().expect("lock"), vec![caller]);
    assert_eq!(target.total_elapsed_frames(), 1);
    assert!(!target.is_rendering());
    assert!(!target.on_pump_thread());
}

struct FailAt {
    cycle: usize,
    runs: AtomicUsize,
}

impl Stage for FailAt {
    fn run(&self, _target: &MediaTarget) -> MediaResult<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run == self.cycle {
            return Err(MediaError::stage("FailAt", "shader compile failed"));
        }
        Ok(())
    }
}

#[test]
fn failure_stops_rendering_reports_and_allows_explicit_restart() {
    let (failures_tx, failures_rx) = crossbeam_channel::unbounded();
    let target = MediaTarget::builder("fragile")
        .real_time(false)
        .on_failure(move |e| {
            let _ = failures_tx.send(e.to_string());
        })
        .build();
    let failing = StageHandle::new(FailAt {
        cycle: 5,
        runs: AtomicUsize::new(0),
    });
    let program = program_with(
        &target,
        ClockSource::infinite(1000.0).expect("valid clock"),
        vec![failing.clone()],
    );

    target.start().expect("start");
    let blocked = {
        let target = target.clone();
        thread::spawn(move || target.sleep_until(Deadline::NotRendering))
    };
    blocked.join().expect("waiter released by the failure");
    target.join_pump();

    let reported = failures_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("observer called");
    assert!(reported.contains("shader compile failed"));
    assert!(!target.is_rendering());
    assert_eq!(target.total_elapsed_frames(), 6);
    assert!(target.last_failure().is_some());

    // No automatic restart; a repaired program runs again on request.
    program.remove(failing).expect("remove");
    target.start().expect("restart");
    assert!(wait_for(
        || target.total_elapsed_frames() > 50,
        Duration::from_secs(5)
    ));
    target.stop();
    target.join_pump();
    assert!(failures_rx.try_recv().is_err());
}

#[test]
fn offline_time_is_frames_over_effective_rate() {
    let target = MediaTarget::new("export", false);
    program_with(&target, ClockSource::new(50.0, 100).expect("valid clock"), Vec::new());

    target.start().expect("start");
    target.sleep_until(Deadline::NotRendering);
    target.join_pump();

    assert_eq!(target.total_elapsed_frames(), 100);
    assert!((target.time() - 2.0).abs() < 1e-9);
}

#[test]
fn stop_releases_every_pending_wait() {
    let target = MediaTarget::new("long", true);
    program_with(&target, ClockSource::infinite(10.0).expect("valid clock"), Vec::new());
    target.start().expect("start");

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let target = target.clone();
            thread::spawn(move || target.sleep_until(Deadline::At(1_000.0)))
        })
        .collect();
    assert!(wait_for(
        || target.pending_waits() == 3,
        Duration::from_secs(5)
    ));

    target.stop();
    for waiter in waiters {
        waiter.join().expect("waiter released by stop");
    }
    target.join_pump();
    assert_eq!(target.pending_waits(), 0);
}

#[test]
fn waits_follow_an_attached_timebase() {
    let clock = Arc::new(ManualClock::new(0.0));
    let target = MediaTarget::builder("slaved")
        .real_time(false)
        .timebase(clock.clone())
        .build();
    program_with(&target, ClockSource::infinite(100.0).expect("valid clock"), Vec::new());
    target.start().expect("start");

    let callbacks = Arc::new(AtomicUsize::new(0));
    let waiter = {
        let target = target.clone();
        let callbacks = callbacks.clone();
        thread::spawn(move || {
            target.sleep_until_then(Deadline::At(5.0), move || {
                callbacks.fetch_add(1, Ordering::SeqCst);
            });
        })
    };
    assert!(wait_for(
        || target.pending_waits() == 1,
        Duration::from_secs(5)
    ));
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);

    clock.set(5.0);
    waiter.join().expect("waiter released once the clock reaches 5s");
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);

    target.stop();
    target.join_pump();
}
