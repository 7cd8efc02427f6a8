//! Opus encoding for the outbound voice track
//!
//! Capture frames arrive at whatever granularity the framer produces;
//! Opus only accepts fixed frame durations. The encoder buffers input
//! and emits one packet per 20ms of audio.

use crate::media::CAPTURE_SAMPLE_RATE;
use meshvoice_core::{Error, Result};
use std::time::Duration;

/// Opus frame duration used on the voice track.
pub const FRAME_DURATION_MS: u32 = 20;

/// Samples per Opus frame at the capture rate (20ms @ 16kHz).
pub const SAMPLES_PER_FRAME: usize =
    (CAPTURE_SAMPLE_RATE as usize / 1000) * FRAME_DURATION_MS as usize;

/// Maximum size of a single encoded Opus packet.
const MAX_PACKET_SIZE: usize = 4000;

/// Voice encoder configuration.
#[derive(Debug, Clone)]
pub struct VoiceEncoderConfig {
    /// Sample rate in Hz, must be an Opus rate (48000, 24000, 16000)
    pub sample_rate: u32,
    /// Channel count (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

impl Default for VoiceEncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            bitrate: 32_000,
        }
    }
}

/// One encoded Opus packet ready for the RTP track.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub duration: Duration,
}

/// Buffering Opus encoder for the local voice track.
pub struct VoiceEncoder {
    encoder: opus::Encoder,
    pending: Vec<f32>,
    frame_duration: Duration,
}

// SAFETY: the Opus encoder holds raw pointers into codec state but each
// instance is independent and only touched by the session loop.
unsafe impl Send for VoiceEncoder {}

impl VoiceEncoder {
    pub fn new(config: &VoiceEncoderConfig) -> Result<Self> {
        if config.sample_rate != 48_000
            && config.sample_rate != 24_000
            && config.sample_rate != 16_000
        {
            return Err(Error::InvalidConfig(
                "Opus sample rate must be 48000, 24000, or 16000 Hz".to_string(),
            ));
        }
        if config.channels != 1 && config.channels != 2 {
            return Err(Error::InvalidConfig(
                "Opus supports 1 (mono) or 2 (stereo) channels".to_string(),
            ));
        }

        let channels = match config.channels {
            1 => opus::Channels::Mono,
            _ => opus::Channels::Stereo,
        };
        let mut encoder =
            opus::Encoder::new(config.sample_rate, channels, opus::Application::Voip)
                .map_err(|e| Error::EncodingError(format!("encoder init failed: {e}")))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| Error::EncodingError(format!("set bitrate failed: {e}")))?;

        Ok(Self {
            encoder,
            pending: Vec::with_capacity(SAMPLES_PER_FRAME * 2),
            frame_duration: Duration::from_millis(u64::from(FRAME_DURATION_MS)),
        })
    }

    /// Buffer capture samples and encode every complete 20ms frame.
    ///
    /// Returns zero or more packets; a short push that does not fill a
    /// frame returns none and the remainder is kept for the next call.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<EncodedPacket>> {
        self.pending.extend_from_slice(samples);

        let mut packets = Vec::new();
        while self.pending.len() >= SAMPLES_PER_FRAME {
            let rest = self.pending.split_off(SAMPLES_PER_FRAME);
            let frame = std::mem::replace(&mut self.pending, rest);

            let mut output = vec![0u8; MAX_PACKET_SIZE];
            let len = self
                .encoder
                .encode_float(&frame, &mut output)
                .map_err(|e| Error::EncodingError(format!("Opus encoding failed: {e}")))?;
            output.truncate(len);
            packets.push(EncodedPacket {
                data: output,
                duration: self.frame_duration,
            });
        }
        Ok(packets)
    }

    /// Samples buffered but not yet encoded.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Drop buffered input. Called when transmission stops so stale
    /// tail samples do not leak into the next burst.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::CAPTURE_FRAME_SIZE;

    fn encoder() -> VoiceEncoder {
        VoiceEncoder::new(&VoiceEncoderConfig::default()).unwrap()
    }

    #[test]
    fn test_capture_frame_yields_one_packet_with_remainder() {
        let mut enc = encoder();
        // 512 capture samples = one 320-sample Opus frame + 192 pending
        let packets = enc.push(&vec![0.0; CAPTURE_FRAME_SIZE]).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].data.is_empty());
        assert_eq!(packets[0].duration, Duration::from_millis(20));
        assert_eq!(enc.pending_samples(), CAPTURE_FRAME_SIZE - SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_remainder_accumulates_across_pushes() {
        let mut enc = encoder();
        assert_eq!(enc.push(&vec![0.0; CAPTURE_FRAME_SIZE]).unwrap().len(), 1);
        // 192 pending + 512 = 704 = two frames + 64 pending
        assert_eq!(enc.push(&vec![0.0; CAPTURE_FRAME_SIZE]).unwrap().len(), 2);
        assert_eq!(enc.pending_samples(), 64);
    }

    #[test]
    fn test_short_push_buffers_without_output() {
        let mut enc = encoder();
        let packets = enc.push(&[0.1; 100]).unwrap();
        assert!(packets.is_empty());
        assert_eq!(enc.pending_samples(), 100);
    }

    #[test]
    fn test_reset_discards_pending_samples() {
        let mut enc = encoder();
        enc.push(&[0.1; 100]).unwrap();
        enc.reset();
        assert_eq!(enc.pending_samples(), 0);
        let packets = enc.push(&vec![0.0; SAMPLES_PER_FRAME]).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_rejects_non_opus_sample_rate() {
        let config = VoiceEncoderConfig {
            sample_rate: 44_100,
            ..Default::default()
        };
        assert!(matches!(
            VoiceEncoder::new(&config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_channel_count() {
        let config = VoiceEncoderConfig {
            channels: 3,
            ..Default::default()
        };
        assert!(matches!(
            VoiceEncoder::new(&config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
