//! The frame source contract.

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Length of a frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameCount {
    Finite(u64),
    Unknown,
    Infinite,
}

impl FrameCount {
    pub fn finite(&self) -> Option<u64> {
        match self {
            FrameCount::Finite(n) => Some(*n),
            _ => None,
        }
    }

    /// A source with exactly one frame is rendered inline by `start()`,
    /// without a pump thread.
    pub fn is_single_shot(&self) -> bool {
        matches!(self, FrameCount::Finite(1))
    }
}

/// The leading stage of every program. Produces frames and publishes them
/// into the target with [`MediaTarget::set_frame`](crate::MediaTarget::set_frame).
pub trait FrameSource: Stage {
    /// Nominal frames per second, `None` when unknown.
    fn frame_rate(&self) -> Option<f64>;

    fn length_in_frames(&self) -> FrameCount;

    /// Length in seconds, `None` for unknown or infinite sources.
    fn length_in_seconds(&self) -> Option<f64> {
        let frames = self.length_in_frames().finite()?;
        let rate = self.frame_rate().filter(|r| *r > 0.0)?;
        Some(frames as f64 / rate)
    }
}

/// The rate used to turn elapsed frames into pipeline time.
///
/// Bounded sources use `frames / seconds`, everything else falls back to the
/// nominal rate.
pub fn effective_frame_rate(source: &dyn FrameSource) -> Option<f64> {
    let bounded = match (source.length_in_frames(), source.length_in_seconds()) {
        (FrameCount::Finite(frames), Some(secs)) if frames > 0 && secs > 0.0 => {
            Some(frames as f64 / secs)
        }
        _ => None,
    };
    bounded
        .or_else(|| source.frame_rate())
        .filter(|r| r.is_finite() && *r > 0.0)
}
