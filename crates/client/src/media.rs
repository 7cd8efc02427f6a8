//! Microphone capture and device management
//!
//! Wraps cpal for device enumeration and input streaming. The cpal
//! stream is not `Send`, so it lives on a dedicated thread; captured
//! samples are chunked into fixed-size frames and handed to the async
//! side over a bounded channel. When the consumer stalls, frames are
//! dropped at the producer rather than buffering unboundedly.

use meshvoice_core::{DeviceErrorReason, Error, Result};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};

/// Display name for the platform default input device
pub const DEFAULT_DEVICE_NAME: &str = "System Default";

/// Capture sample rate expected by the voice pipeline
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per frame delivered to the pipeline (32 ms at 16 kHz)
pub const CAPTURE_FRAME_SIZE: usize = 512;

/// Frames buffered toward the async side before dropping
const FRAME_CHANNEL_CAPACITY: usize = 8;

/// One frame of mono capture samples, normalized to [-1, 1].
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

/// A selectable input device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

/// Enumerate input devices, default entry first.
pub fn list_input_devices() -> Vec<AudioDevice> {
    let mut devices = vec![AudioDevice {
        name: DEFAULT_DEVICE_NAME.to_string(),
        is_default: true,
    }];

    let host = cpal::default_host();
    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                if !devices.iter().any(|d| d.name == name) {
                    devices.push(AudioDevice {
                        name,
                        is_default: false,
                    });
                }
            }
        }
    }

    devices
}

/// Enumerate output devices, default entry first. Playback device
/// selection is handed to the platform audio path; enumeration exists so
/// the embedding application can present a picker.
pub fn list_output_devices() -> Vec<AudioDevice> {
    let mut devices = vec![AudioDevice {
        name: DEFAULT_DEVICE_NAME.to_string(),
        is_default: true,
    }];

    let host = cpal::default_host();
    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                if !devices.iter().any(|d| d.name == name) {
                    devices.push(AudioDevice {
                        name,
                        is_default: false,
                    });
                }
            }
        }
    }

    devices
}

fn find_input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    match name {
        None | Some("") | Some(DEFAULT_DEVICE_NAME) => host.default_input_device().ok_or_else(|| {
            Error::device(
                DeviceErrorReason::DeviceUnavailable,
                "no default input device",
            )
        }),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| Error::device(DeviceErrorReason::DeviceUnavailable, e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                Error::device(
                    DeviceErrorReason::DeviceUnavailable,
                    format!("input device '{wanted}' not found"),
                )
            }),
    }
}

/// Running capture session. Dropping the handle stops the stream thread.
pub struct CaptureHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop the capture stream and join its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// A handle with no backing stream, for driving the session loop
    /// without a microphone.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            stop_tx: None,
            thread: None,
        }
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owns microphone acquisition and frame delivery.
pub struct MediaStreamManager;

impl MediaStreamManager {
    /// Acquire the microphone and start delivering frames.
    ///
    /// Returns the capture handle and the frame receiver. Fails with a
    /// device error before any session state is touched, so callers can
    /// abort a join cleanly when the microphone is unavailable.
    pub fn start_capture(
        device_name: Option<&str>,
    ) -> Result<(CaptureHandle, mpsc::Receiver<AudioFrame>)> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let device_name = device_name.map(str::to_owned);
        let thread = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                run_capture_thread(device_name.as_deref(), frame_tx, stop_rx, ready_tx);
            })
            .map_err(Error::IoError)?;

        // The stream must open before we report success; a missing or
        // busy device aborts here instead of failing silently later.
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::device(
                    DeviceErrorReason::DeviceUnavailable,
                    "capture thread exited before opening the stream",
                ));
            }
        }

        info!("microphone capture started");
        Ok((
            CaptureHandle {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
            frame_rx,
        ))
    }
}

fn classify_build_error(e: cpal::BuildStreamError) -> Error {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => Error::device(
            DeviceErrorReason::DeviceUnavailable,
            "device disconnected while opening stream",
        ),
        cpal::BuildStreamError::StreamConfigNotSupported => Error::device(
            DeviceErrorReason::UnsupportedFormat,
            "16 kHz mono capture not supported by device",
        ),
        other => Error::device(DeviceErrorReason::DeviceUnavailable, other.to_string()),
    }
}

fn run_capture_thread(
    device_name: Option<&str>,
    frame_tx: mpsc::Sender<AudioFrame>,
    stop_rx: std_mpsc::Receiver<()>,
    ready_tx: std_mpsc::Sender<Result<()>>,
) {
    let stream = match open_stream(device_name, frame_tx) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!(error = %e, "failed to start capture stream");
        return;
    }

    // Block until told to stop; the stream runs on cpal's own callback
    let _ = stop_rx.recv();
    drop(stream);
    debug!("capture thread exiting");
}

fn open_stream(
    device_name: Option<&str>,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream> {
    let device = find_input_device(device_name)?;
    let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::device(DeviceErrorReason::PermissionDenied, e.to_string()))?
        .find(|c| {
            (c.channels() == 1 || c.channels() == 2)
                && c.min_sample_rate().0 <= CAPTURE_SAMPLE_RATE
                && c.max_sample_rate().0 >= CAPTURE_SAMPLE_RATE
                && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .ok_or_else(|| {
            Error::device(
                DeviceErrorReason::UnsupportedFormat,
                format!("'{name}' cannot capture 16 kHz mono or stereo"),
            )
        })?;

    let channels = supported.channels();
    let sample_format = supported.sample_format();
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(CAPTURE_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(device = %name, channels, ?sample_format, "opening capture stream");

    let mut framer = Framer::new(channels as usize, frame_tx);
    let err_fn = |e: cpal::StreamError| warn!(error = %e, "capture stream error");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| framer.push(data.iter().copied()),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                framer.push(data.iter().map(|&s| s as f32 / i16::MAX as f32))
            },
            err_fn,
            None,
        ),
        _ => unreachable!("format filtered above"),
    }
    .map_err(classify_build_error)?;

    Ok(stream)
}

/// Accumulates interleaved samples into mono frames of
/// [`CAPTURE_FRAME_SIZE`], downmixing stereo by averaging.
struct Framer {
    channels: usize,
    pending: Vec<f32>,
    frame_tx: mpsc::Sender<AudioFrame>,
}

impl Framer {
    fn new(channels: usize, frame_tx: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            channels,
            pending: Vec::with_capacity(CAPTURE_FRAME_SIZE * 2),
            frame_tx,
        }
    }

    fn push(&mut self, samples: impl Iterator<Item = f32>) {
        if self.channels == 1 {
            self.pending.extend(samples);
        } else {
            let interleaved: Vec<f32> = samples.collect();
            for pair in interleaved.chunks_exact(self.channels) {
                let sum: f32 = pair.iter().sum();
                self.pending.push(sum / self.channels as f32);
            }
        }

        while self.pending.len() >= CAPTURE_FRAME_SIZE {
            let rest = self.pending.split_off(CAPTURE_FRAME_SIZE);
            let samples = std::mem::replace(&mut self.pending, rest);
            // Dropping frames under backpressure keeps the audio
            // callback from ever blocking
            if self.frame_tx.try_send(AudioFrame { samples }).is_err() {
                return;
            }
        }
    }
}
