//! FramePump Engine
//!
//! The frame-scheduling core of the media engine. A [`MediaTarget`] owns a
//! pump thread that runs a [`Program`] once per cycle. The program is an
//! ordered, hot-swappable list of stages led by a [`FrameSource`]; edits are
//! published as immutable snapshots so a cycle in flight never observes a
//! half-applied change. Any thread can synchronize to pipeline time with
//! [`MediaTarget::sleep_until`].
//!
//! # Drive cycle
//!
//! ```text
//!  caller threads              pump thread
//!  ──────────────              ───────────
//!  program.add_last(s) ──┐     loop while rendering {
//!  program.remove(s)   ──┼──►    snapshot = program.snapshot()   (pinned)
//!                        │       source.run  ──► target.set_frame(f)
//!                        │       stage.run … (snapshot order)
//!                        │       output.render(f); f.dispose()
//!  sleep_until(t) ───────┼──►    release waits with time >= t
//!        ▲               │     }
//!        └───── released ┘     stop ──► release every pending wait
//! ```
//!
//! Stages removed from a program are disposed once no cycle can still hold
//! the snapshot that contained them.

pub mod frame;
pub mod param;
pub mod pool;
pub mod program;
pub mod source;
pub mod sources;
pub mod stage;
pub mod stages;
pub mod target;

mod events;
mod priority;
mod reclaim;
mod sync;

pub use frame::{AudioBuffer, Frame, FrameRef, ImageBuffer, Payload};
pub use param::{Parameter, ParameterKind, Parameters};
pub use pool::TaskPool;
pub use program::{Program, Snapshot, Update};
pub use source::{effective_frame_rate, FrameCount, FrameSource};
pub use stage::{SourceHandle, Stage, StageHandle, StageId};
pub use sources::{ClockSource, ImageSequenceSource, SampleArraySource};
pub use stages::{FrameTap, GainStage, InvertStage};
pub use target::{
    FailureObserver, MediaTarget, NullOutput, RenderOutput, TargetBuilder, TargetStats,
};

pub use framepump_common::clock::{Deadline, ManualClock, Timebase, WallClock};
pub use framepump_common::error::{MediaError, MediaResult};
