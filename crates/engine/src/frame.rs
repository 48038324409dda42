//! Frames flowing through a program.
//!
//! A frame is immutable once published. Stages that transform a frame build
//! a new one with [`Frame::derive`] and swap it into the target's slot.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use framepump_common::error::{MediaError, MediaResult};

use crate::sync::lock;

/// Shared handle to a published frame.
pub type FrameRef = Arc<Frame>;

type ReleaseHook = Box<dyn FnOnce() -> MediaResult<()> + Send>;

/// Interleaved audio samples.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Arc<[f32]>,
    pub channels: u16,
    pub sample_rate: f32,
}

impl AudioBuffer {
    /// Number of sample frames (samples per channel).
    pub fn sample_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate <= 0.0 {
            return 0.0;
        }
        self.sample_frames() as f64 / self.sample_rate as f64
    }
}

/// Tightly packed 8-bit RGBA pixels.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub rgba: Arc<[u8]>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, rgba: impl Into<Arc<[u8]>>) -> MediaResult<Self> {
        let rgba = rgba.into();
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(MediaError::stage(
                "ImageBuffer",
                format!(
                    "{}x{} image needs {expected} bytes, got {}",
                    width,
                    height,
                    rgba.len()
                ),
            ));
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// A single-colour image.
    pub fn filled(width: u32, height: u32, pixel: [u8; 4]) -> Self {
        let rgba: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            width,
            height,
            rgba: rgba.into(),
        }
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * 4
    }
}

/// What a frame carries.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Pure timing tick.
    Empty,
    Audio(AudioBuffer),
    Image(ImageBuffer),
}

/// A timed unit of media produced by a frame source.
pub struct Frame {
    sequence: u64,
    play_out_time: f64,
    last: bool,
    payload: Payload,
    disposed: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

impl Frame {
    pub fn new(sequence: u64, play_out_time: f64, payload: Payload) -> Self {
        Self {
            sequence,
            play_out_time,
            last: false,
            payload,
            disposed: AtomicBool::new(false),
            release: Mutex::new(None),
        }
    }

    /// Mark this frame as the final one of the stream.
    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    /// Attach a hook that frees backing resources (native buffers, pooled memory).
    /// Runs exactly once, from [`Frame::dispose`].
    pub fn with_release(self, hook: impl FnOnce() -> MediaResult<()> + Send + 'static) -> Self {
        *lock(&self.release) = Some(Box::new(hook));
        self
    }

    /// Build a frame with the same timing and a new payload.
    ///
    /// The release hook moves to the derived frame, since that is the one the
    /// target will dispose.
    pub fn derive(&self, payload: Payload) -> Frame {
        let hook = lock(&self.release).take();
        Frame {
            sequence: self.sequence,
            play_out_time: self.play_out_time,
            last: self.last,
            payload,
            disposed: AtomicBool::new(false),
            release: Mutex::new(hook),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Pipeline time at which this frame is due, in seconds.
    pub fn play_out_time(&self) -> f64 {
        self.play_out_time
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Release backing resources. Later calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = lock(&self.release).take();
        if let Some(hook) = hook {
            if let Err(e) = hook() {
                tracing::warn!(sequence = self.sequence, error = %e, "Frame release failed");
            }
        }
    }

    pub fn into_ref(self) -> FrameRef {
        Arc::new(self)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("play_out_time", &self.play_out_time)
            .field("last", &self.last)
            .field("payload", &self.payload)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
