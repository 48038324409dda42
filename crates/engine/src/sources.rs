//! Built-in frame sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use framepump_common::clock::Deadline;
use framepump_common::error::{MediaError, MediaResult};

use crate::frame::{AudioBuffer, Frame, ImageBuffer, Payload};
use crate::source::{FrameCount, FrameSource};
use crate::stage::Stage;
use crate::sync::lock;
use crate::target::MediaTarget;

/// Samples per channel in one frame of a [`SampleArraySource`].
pub const AUDIO_FRAME_SAMPLES: usize = 128;

/// Hold a real-time target back until `play_out_time`.
fn pace(target: &MediaTarget, play_out_time: f64) {
    if target.is_real_time() {
        target.sleep_until(Deadline::At(play_out_time));
    }
}

/// A bounded source with nothing left to play ends rendering, so a restarted
/// target does not spin on empty cycles.
fn exhausted(target: &MediaTarget, source: &str) -> MediaResult<()> {
    tracing::debug!(media = %target.name(), source, "Source exhausted, stopping");
    target.stop();
    Ok(())
}

fn validate_rate(name: &str, rate: f64) -> MediaResult<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(MediaError::stage(name, format!("Invalid frame rate {rate}")))
    }
}

/// Emits empty timing frames at a fixed rate.
///
/// A bounded clock plays its `frames` `plays` times and marks the very last
/// frame; an infinite one never ends.
#[derive(Debug)]
pub struct ClockSource {
    rate: f64,
    frames: FrameCount,
    plays: u64,
    next: AtomicU64,
}

impl ClockSource {
    pub fn new(rate: f64, frames: u64) -> MediaResult<Self> {
        validate_rate("ClockSource", rate)?;
        if frames == 0 {
            return Err(MediaError::stage("ClockSource", "A bounded clock needs at least one frame"));
        }
        Ok(Self {
            rate,
            frames: FrameCount::Finite(frames),
            plays: 1,
            next: AtomicU64::new(0),
        })
    }

    pub fn infinite(rate: f64) -> MediaResult<Self> {
        validate_rate("ClockSource", rate)?;
        Ok(Self {
            rate,
            frames: FrameCount::Infinite,
            plays: 1,
            next: AtomicU64::new(0),
        })
    }

    /// Loop a bounded clock `plays` times (at least once).
    pub fn with_plays(mut self, plays: u64) -> Self {
        self.plays = plays.max(1);
        self
    }

    /// Frames emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    fn total(&self) -> Option<u64> {
        self.frames.finite().map(|n| n.saturating_mul(self.plays))
    }
}

impl Stage for ClockSource {
    fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        let total = self.total();
        let sequence = self.next.load(Ordering::SeqCst);
        if total.is_some_and(|total| sequence >= total) {
            return exhausted(target, "ClockSource");
        }
        self.next.store(sequence + 1, Ordering::SeqCst);

        let play_out_time = sequence as f64 / self.rate;
        pace(target, play_out_time);
        let frame = Frame::new(sequence, play_out_time, Payload::Empty)
            .with_last(total == Some(sequence + 1));
        target.set_frame(self, frame);
        Ok(())
    }
}

impl FrameSource for ClockSource {
    fn frame_rate(&self) -> Option<f64> {
        Some(self.rate)
    }

    fn length_in_frames(&self) -> FrameCount {
        self.frames
    }
}

struct PlayState {
    plays_left: u64,
    read: usize,
    sample_frames: u64,
    sequence: u64,
}

/// Cuts an interleaved sample buffer into audio frames of
/// [`AUDIO_FRAME_SAMPLES`] samples per channel and plays it `plays` times.
pub struct SampleArraySource {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: f32,
    frame_size: usize,
    frames: u64,
    state: Mutex<PlayState>,
}

impl SampleArraySource {
    pub fn new(
        samples: impl Into<Arc<[f32]>>,
        channels: u16,
        sample_rate: f32,
        plays: u64,
    ) -> MediaResult<Self> {
        let samples = samples.into();
        if samples.is_empty() {
            return Err(MediaError::stage("SampleArraySource", "No samples"));
        }
        if channels == 0 {
            return Err(MediaError::stage("SampleArraySource", "Zero channels"));
        }
        if samples.len() % channels as usize != 0 {
            return Err(MediaError::stage(
                "SampleArraySource",
                format!(
                    "{} samples do not interleave evenly over {channels} channels",
                    samples.len()
                ),
            ));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(MediaError::stage(
                "SampleArraySource",
                format!("Invalid sample rate {sample_rate}"),
            ));
        }
        let frame_size = AUDIO_FRAME_SAMPLES * channels as usize;
        let frames = samples.len().div_ceil(frame_size) as u64;
        Ok(Self {
            samples,
            channels,
            sample_rate,
            frame_size,
            frames,
            state: Mutex::new(PlayState {
                plays_left: plays.max(1),
                read: 0,
                sample_frames: 0,
                sequence: 0,
            }),
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }
}

impl Stage for SampleArraySource {
    fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        let frame = {
            let mut state = lock(&self.state);
            if state.plays_left == 0 {
                drop(state);
                return exhausted(target, "SampleArraySource");
            }
            let len = self.samples.len();
            let end = (state.read + self.frame_size).min(len);
            if end >= len {
                state.plays_left -= 1;
            }
            let chunk: Arc<[f32]> = self.samples[state.read..end].into();
            let play_out_time = state.sample_frames as f64 / self.sample_rate as f64;
            let buffer = AudioBuffer {
                samples: chunk,
                channels: self.channels,
                sample_rate: self.sample_rate,
            };
            state.sample_frames += buffer.sample_frames() as u64;
            state.read = end % len;
            let frame = Frame::new(state.sequence, play_out_time, Payload::Audio(buffer))
                .with_last(state.plays_left == 0);
            state.sequence += 1;
            frame
        };
        target.set_frame(self, frame);
        Ok(())
    }
}

impl FrameSource for SampleArraySource {
    fn frame_rate(&self) -> Option<f64> {
        let secs = self.length_in_seconds()?;
        Some(self.frames as f64 / secs)
    }

    fn length_in_frames(&self) -> FrameCount {
        FrameCount::Finite(self.frames)
    }

    fn length_in_seconds(&self) -> Option<f64> {
        let per_channel = self.samples.len() / self.channels as usize;
        Some(per_channel as f64 / self.sample_rate as f64)
    }
}

/// Shows a fixed list of images at a constant rate, looping `plays` times.
pub struct ImageSequenceSource {
    images: Vec<ImageBuffer>,
    rate: f64,
    plays: u64,
    next: AtomicU64,
}

impl ImageSequenceSource {
    pub fn new(images: Vec<ImageBuffer>, rate: f64, plays: u64) -> MediaResult<Self> {
        validate_rate("ImageSequenceSource", rate)?;
        if images.is_empty() {
            return Err(MediaError::stage("ImageSequenceSource", "No images"));
        }
        Ok(Self {
            images,
            rate,
            plays: plays.max(1),
            next: AtomicU64::new(0),
        })
    }
}

impl Stage for ImageSequenceSource {
    fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        let count = self.images.len() as u64;
        let total = count.saturating_mul(self.plays);
        let sequence = self.next.load(Ordering::SeqCst);
        if sequence >= total {
            return exhausted(target, "ImageSequenceSource");
        }
        self.next.store(sequence + 1, Ordering::SeqCst);

        let play_out_time = sequence as f64 / self.rate;
        pace(target, play_out_time);
        let image = self.images[(sequence % count) as usize].clone();
        let frame = Frame::new(sequence, play_out_time, Payload::Image(image))
            .with_last(sequence + 1 == total);
        target.set_frame(self, frame);
        Ok(())
    }
}

impl FrameSource for ImageSequenceSource {
    fn frame_rate(&self) -> Option<f64> {
        Some(self.rate)
    }

    fn length_in_frames(&self) -> FrameCount {
        FrameCount::Finite(self.images.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use crate::stage::SourceHandle;

    fn offline_with(source: SourceHandle) -> (MediaTarget, Arc<Program>) {
        let target = MediaTarget::new("test", false);
        let program = Arc::new(Program::new(source, Vec::new()));
        target.use_program(program.clone()).unwrap();
        (target, program)
    }

    #[test]
    fn test_clock_marks_last_frame_of_final_play() {
        let (target, program) = offline_with(SourceHandle::new(ClockSource::new(10.0, 3).unwrap().with_plays(2)));

        let mut last_flags = Vec::new();
        for _ in 0..6 {
            program.run(&target).unwrap();
            last_flags.push(target.frame().unwrap().is_last());
        }
        assert_eq!(last_flags, vec![false, false, false, false, false, true]);
        assert_eq!(target.total_elapsed_frames(), 6);
        assert_eq!(target.relative_elapsed_frames(), 0);

        // Exhausted: no further frames.
        program.run(&target).unwrap();
        assert_eq!(target.total_elapsed_frames(), 6);
    }

    #[test]
    fn test_clock_rejects_bad_rate() {
        assert!(ClockSource::infinite(0.0).is_err());
        assert!(ClockSource::infinite(f64::NAN).is_err());
        assert!(ClockSource::new(30.0, 0).is_err());
    }

    #[test]
    fn test_sample_array_chunks_and_lengths() {
        let source = SampleArraySource::new(vec![0.5f32; 300], 1, 100.0, 1).unwrap();
        assert_eq!(source.length_in_frames(), FrameCount::Finite(3));
        assert_eq!(source.length_in_seconds(), Some(3.0));
        assert_eq!(source.frame_rate(), Some(1.0));

        let (target, program) = offline_with(SourceHandle::new(source));
        let mut sizes = Vec::new();
        for _ in 0..3 {
            program.run(&target).unwrap();
            let frame = target.frame().unwrap();
            match frame.payload() {
                Payload::Audio(buffer) => sizes.push(buffer.samples.len()),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert_eq!(sizes, vec![128, 128, 44]);
        assert!(target.frame().unwrap().is_last());
    }

    #[test]
    fn test_sample_array_play_out_follows_samples() {
        let source = SampleArraySource::new(vec![0.0f32; 512], 2, 128.0, 2).unwrap();
        let (target, program) = offline_with(SourceHandle::new(source));

        let mut times = Vec::new();
        for _ in 0..4 {
            program.run(&target).unwrap();
            times.push(target.frame().unwrap().play_out_time());
        }
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0]);
        assert!(target.frame().unwrap().is_last());
    }

    #[test]
    fn test_sample_array_rejects_empty_input() {
        assert!(SampleArraySource::new(Vec::<f32>::new(), 1, 44_100.0, 1).is_err());
        assert!(SampleArraySource::new(vec![0.0f32; 4], 0, 44_100.0, 1).is_err());
    }

    #[test]
    fn test_sample_array_rejects_partial_sample_frames() {
        assert!(SampleArraySource::new(vec![0.0f32; 1], 2, 44_100.0, 1).is_err());
        assert!(SampleArraySource::new(vec![0.0f32; 7], 2, 44_100.0, 1).is_err());

        let source = SampleArraySource::new(vec![0.0f32; 6], 2, 3.0, 1).unwrap();
        assert_eq!(source.length_in_seconds(), Some(1.0));
        assert_eq!(source.frame_rate(), Some(1.0));
    }

    #[test]
    fn test_exhausted_clock_stops_a_restarted_target() {
        let (target, _program) = offline_with(SourceHandle::new(ClockSource::new(100.0, 3).unwrap()));

        target.start().unwrap();
        target.sleep_until(Deadline::NotRendering);
        target.join_pump();
        assert_eq!(target.total_elapsed_frames(), 3);

        target.start().unwrap();
        target.sleep_until(Deadline::NotRendering);
        target.join_pump();
        assert!(!target.is_rendering());
        assert_eq!(target.total_elapsed_frames(), 3);
        assert!(target.last_failure().is_none());
    }

    #[test]
    fn test_image_sequence_loops() {
        let images = vec![
            ImageBuffer::filled(2, 2, [255, 0, 0, 255]),
            ImageBuffer::filled(2, 2, [0, 255, 0, 255]),
        ];
        let source = ImageSequenceSource::new(images, 25.0, 2).unwrap();
        let (target, program) = offline_with(SourceHandle::new(source));

        let mut reds = Vec::new();
        for _ in 0..4 {
            program.run(&target).unwrap();
            match target.frame().unwrap().payload() {
                Payload::Image(image) => reds.push(image.rgba[0]),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert_eq!(reds, vec![255, 0, 255, 0]);
        assert_eq!(target.relative_elapsed_frames(), 0);
        assert!(target.frame().unwrap().is_last());
    }
}
