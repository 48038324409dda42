//! Built-in processing stages.
//!
//! Transforming stages read the frame the source published this cycle and
//! swap a derived frame into the target with [`MediaTarget::replace_frame`].
//! A frame that is already disposed belongs to an earlier cycle and is left
//! alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use framepump_common::error::MediaResult;

use crate::frame::{AudioBuffer, FrameRef, ImageBuffer, Payload};
use crate::param::{Parameter, Parameters};
use crate::pool::TaskPool;
use crate::stage::Stage;
use crate::target::MediaTarget;

fn current_frame(target: &MediaTarget) -> Option<FrameRef> {
    target.frame().filter(|frame| !frame.is_disposed())
}

/// Scales audio samples by the `gain` parameter.
#[derive(Debug)]
pub struct GainStage {
    params: Parameters,
}

impl GainStage {
    pub const GAIN: &'static str = "gain";

    pub fn new(gain: f32) -> MediaResult<Self> {
        let params = Parameters::new(vec![Parameter::range(
            Self::GAIN,
            "Linear gain",
            0.0,
            4.0,
            gain,
        )?])?;
        Ok(Self { params })
    }

    pub fn gain(&self) -> MediaResult<f32> {
        self.params.value(Self::GAIN)
    }

    pub fn set_gain(&self, gain: f32) -> MediaResult<()> {
        self.params.set(Self::GAIN, gain)
    }
}

impl Stage for GainStage {
    fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        let Some(frame) = current_frame(target) else {
            return Ok(());
        };
        let Payload::Audio(buffer) = frame.payload() else {
            return Ok(());
        };
        let gain = self.gain()?;
        if gain == 1.0 {
            return Ok(());
        }
        let samples: Arc<[f32]> = buffer.samples.iter().map(|s| s * gain).collect();
        let scaled = AudioBuffer {
            samples,
            ..buffer.clone()
        };
        target.replace_frame(frame.derive(Payload::Audio(scaled)));
        Ok(())
    }

    fn parameters(&self) -> Option<&Parameters> {
        Some(&self.params)
    }
}

/// Inverts the colour channels of image frames, one pool task per band of rows.
#[derive(Debug)]
pub struct InvertStage {
    pool: Arc<TaskPool>,
    rows_per_task: usize,
}

impl InvertStage {
    pub fn new(pool: Arc<TaskPool>) -> Self {
        Self {
            pool,
            rows_per_task: 16,
        }
    }

    pub fn with_rows_per_task(mut self, rows: usize) -> Self {
        self.rows_per_task = rows.max(1);
        self
    }

    fn invert(&self, image: &ImageBuffer) -> MediaResult<ImageBuffer> {
        let rgba = Arc::clone(&image.rgba);
        let row_bytes = image.row_bytes();
        let bands = self
            .pool
            .map_ranges(image.height as usize, self.rows_per_task, move |rows| {
                rgba[rows.start * row_bytes..rows.end * row_bytes]
                    .chunks_exact(4)
                    .flat_map(|px| [255 - px[0], 255 - px[1], 255 - px[2], px[3]])
                    .collect::<Vec<u8>>()
            })?;
        ImageBuffer::new(image.width, image.height, bands.concat())
    }
}

impl Stage for InvertStage {
    fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        let Some(frame) = current_frame(target) else {
            return Ok(());
        };
        let Payload::Image(image) = frame.payload() else {
            return Ok(());
        };
        let inverted = self.invert(image)?;
        target.replace_frame(frame.derive(Payload::Image(inverted)));
        Ok(())
    }
}

type TapCallback = Box<dyn Fn(&FrameRef) + Send + Sync>;

/// Hands every frame it sees to a callback. Used for monitoring.
pub struct FrameTap {
    callback: TapCallback,
    seen: AtomicU64,
}

impl FrameTap {
    pub fn new(callback: impl Fn(&FrameRef) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            seen: AtomicU64::new(0),
        }
    }

    /// A tap that only counts.
    pub fn counting() -> Self {
        Self::new(|_| {})
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::SeqCst)
    }
}

impl Stage for FrameTap {
    fn run(&self, target: &MediaTarget) -> MediaResult<()> {
        if let Some(frame) = current_frame(target) {
            (self.callback)(&frame);
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::source::{FrameCount, FrameSource};
    use crate::stage::StageHandle;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Fixed;

    impl Stage for Fixed {
        fn run(&self, _target: &MediaTarget) -> MediaResult<()> {
            Ok(())
        }
    }

    impl FrameSource for Fixed {
        fn frame_rate(&self) -> Option<f64> {
            Some(1.0)
        }

        fn length_in_frames(&self) -> FrameCount {
            FrameCount::Unknown
        }
    }

    fn audio_frame(samples: Vec<f32>) -> Frame {
        Frame::new(
            0,
            0.0,
            Payload::Audio(AudioBuffer {
                samples: samples.into(),
                channels: 1,
                sample_rate: 48_000.0,
            }),
        )
    }

    #[test]
    fn test_gain_scales_samples() {
        let target = MediaTarget::new("test", false);
        target.set_frame(&Fixed, audio_frame(vec![0.5, -0.25]));

        let gain = GainStage::new(1.0).unwrap();
        gain.parameters().unwrap().set("gain", 2.0).unwrap();
        gain.run(&target).unwrap();

        match target.frame().unwrap().payload() {
            Payload::Audio(buffer) => assert_eq!(&buffer.samples[..], &[1.0, -0.5]),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(target.total_elapsed_frames(), 1);
    }

    #[test]
    fn test_gain_moves_release_hook_to_derived_frame() {
        let target = MediaTarget::new("test", false);
        let releases = Arc::new(AtomicUsize::new(0));
        let counted = releases.clone();
        let frame = audio_frame(vec![1.0]).with_release(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let original = frame.into_ref();
        target.set_frame(&Fixed, original.clone());

        GainStage::new(0.5).unwrap().run(&target).unwrap();
        original.dispose();
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        target.frame().unwrap().dispose();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gain_is_clamped() {
        let gain = GainStage::new(9.0).unwrap();
        assert_eq!(gain.gain().unwrap(), 4.0);
        gain.set_gain(-1.0).unwrap();
        assert_eq!(gain.gain().unwrap(), 0.0);
    }

    #[test]
    fn test_invert_uses_pool_bands() {
        let pool = Arc::new(TaskPool::new(2, "test-invert").unwrap());
        let target = MediaTarget::new("test", false);
        let image = ImageBuffer::filled(3, 5, [10, 20, 30, 40]);
        target.set_frame(&Fixed, Frame::new(0, 0.0, Payload::Image(image)));

        InvertStage::new(pool)
            .with_rows_per_task(2)
            .run(&target)
            .unwrap();

        match target.frame().unwrap().payload() {
            Payload::Image(image) => {
                assert_eq!(image.rgba.len(), 3 * 5 * 4);
                assert!(image
                    .rgba
                    .chunks_exact(4)
                    .all(|px| px == [245, 235, 225, 40]));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_tap_skips_disposed_frames() {
        let target = MediaTarget::new("test", false);
        let sequences = Arc::new(Mutex::new(Vec::new()));
        let recorded = sequences.clone();
        let tap = Arc::new(FrameTap::new(move |f| recorded.lock().unwrap().push(f.sequence())));
        let handle = StageHandle::from_arc(tap.clone());

        target.set_frame(&Fixed, Frame::new(7, 0.0, Payload::Empty));
        handle.run_internal(&target).unwrap();
        target.frame().unwrap().dispose();
        handle.run_internal(&target).unwrap();

        assert_eq!(*sequences.lock().unwrap(), vec![7]);
        assert_eq!(tap.seen(), 1);
    }
}
