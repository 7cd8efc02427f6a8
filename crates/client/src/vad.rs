//! Voice activity detection
//!
//! Frame-based detector over fixed-size windows of microphone samples.
//! Each frame's RMS energy is compared against an adaptive threshold
//! derived from a rolling energy history; hysteresis keeps a single noisy
//! frame from toggling the speaking state. Time advances with the frames
//! themselves (one frame = `frame_size / sample_rate` seconds), so the
//! detector is deterministic and independent of wall-clock scheduling.

use meshvoice_core::{Error, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

/// Configuration for the voice activity detector
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Input sample rate in Hz
    pub sample_rate: u32,

    /// Samples per analysis frame (512 @ 16 kHz ≈ 32 ms)
    pub frame_size: usize,

    /// Rolling energy history length, in frames
    pub history_frames: usize,

    /// Fixed minimum threshold component; keeps the adaptive threshold
    /// from collapsing to zero in sustained silence
    pub static_floor: f32,

    /// Blend between the static floor and the rolling average, in [0, 1].
    /// 0 = fixed threshold, 1 = fully adaptive.
    pub sensitivity: f32,

    /// How long energy must stay above threshold before speech is asserted
    pub min_speech_duration: Duration,

    /// How long energy must stay below threshold before speech is retracted
    pub min_silence_duration: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 512,
            history_frames: 30,
            static_floor: 0.02,
            sensitivity: 0.5,
            min_speech_duration: Duration::from_millis(250),
            min_silence_duration: Duration::from_millis(200),
        }
    }
}

impl VadConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidConfig("sample_rate must be non-zero".to_string()));
        }
        if self.frame_size == 0 {
            return Err(Error::InvalidConfig("frame_size must be non-zero".to_string()));
        }
        if self.history_frames == 0 {
            return Err(Error::InvalidConfig(
                "history_frames must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(Error::InvalidConfig(format!(
                "sensitivity must be in [0, 1], got {}",
                self.sensitivity
            )));
        }
        if !(0.0..1.0).contains(&self.static_floor) {
            return Err(Error::InvalidConfig(format!(
                "static_floor must be in [0, 1), got {}",
                self.static_floor
            )));
        }
        Ok(())
    }

    /// Duration of one analysis frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

/// Emitted when the speaking state flips.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadEvent {
    /// New speaking state
    pub speaking: bool,

    /// RMS energy of the frame that completed the transition
    pub energy: f32,

    /// How decisively the frame cleared (or undercut) the threshold, in [0, 1]
    pub confidence: f32,
}

/// Adaptive-energy voice activity detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    history: VecDeque<f32>,
    speaking: bool,

    /// Detector clock; advances one frame duration per processed frame
    clock: Duration,

    /// Start of the current uninterrupted above-threshold run
    above_since: Option<Duration>,

    /// Start of the current uninterrupted below-threshold run
    below_since: Option<Duration>,
}

impl VoiceActivityDetector {
    /// Create a detector with the given configuration.
    pub fn new(config: VadConfig) -> Result<Self> {
        config.validate()?;
        let history = VecDeque::with_capacity(config.history_frames);
        Ok(Self {
            config,
            history,
            speaking: false,
            clock: Duration::ZERO,
            above_since: None,
            below_since: None,
        })
    }

    /// Current speaking state.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Detector time: total duration of processed audio.
    pub fn elapsed(&self) -> Duration {
        self.clock
    }

    /// RMS energy of a frame, normalized to [0, 1] for full-scale input.
    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        (sum_squares / samples.len() as f32).sqrt().clamp(0.0, 1.0)
    }

    /// Current adaptive threshold:
    /// `static_floor * (1 - sensitivity) + avg_energy * sensitivity`.
    pub fn adaptive_threshold(&self) -> f32 {
        let avg = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f32>() / self.history.len() as f32
        };
        self.config.static_floor * (1.0 - self.config.sensitivity) + avg * self.config.sensitivity
    }

    /// Process one frame of samples. Returns an event only when the
    /// speaking state changes; a partial trailing frame is accepted.
    pub fn process_frame(&mut self, samples: &[f32]) -> Option<VadEvent> {
        let energy = Self::rms(samples);

        if self.history.len() == self.config.history_frames {
            self.history.pop_front();
        }
        self.history.push_back(energy);

        let threshold = self.adaptive_threshold();
        let frame_start = self.clock;
        self.clock += self.config.frame_duration();

        let above = energy > threshold;
        trace!(energy, threshold, above, "vad frame");

        if above {
            self.below_since = None;
            if !self.speaking {
                let run_start = *self.above_since.get_or_insert(frame_start);
                if self.clock - run_start >= self.config.min_speech_duration {
                    self.speaking = true;
                    self.above_since = None;
                    let confidence = if threshold > 0.0 {
                        ((energy / threshold).min(2.0) - 1.0).clamp(0.0, 1.0)
                    } else {
                        1.0
                    };
                    return Some(VadEvent {
                        speaking: true,
                        energy,
                        confidence,
                    });
                }
            }
        } else {
            self.above_since = None;
            if self.speaking {
                let run_start = *self.below_since.get_or_insert(frame_start);
                if self.clock - run_start >= self.config.min_silence_duration {
                    self.speaking = false;
                    self.below_since = None;
                    let confidence = if threshold > 0.0 {
                        (1.0 - energy / threshold).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    return Some(VadEvent {
                        speaking: false,
                        energy,
                        confidence,
                    });
                }
            }
        }

        None
    }

    /// Reset all detector state. Called when the stream stops.
    pub fn reset(&mut self) {
        self.history.clear();
        self.speaking = false;
        self.clock = Duration::ZERO;
        self.above_since = None;
        self.below_since = None;
    }
}
