//! Camera and screen-capture acquisition
//!
//! Video sources are pluggable: a backend implements [`VideoSource`]
//! for the platform capture API and delivers encoded VP8 frames over a
//! bounded channel, mirroring the microphone plumbing in
//! [`crate::media`]. Acquisition failures carry the same device error
//! taxonomy as audio, so a join or mid-call enable aborts cleanly when
//! the camera or screen is unavailable.

use meshvoice_core::{Error, Result};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

/// Bounded frame channel; a slow consumer drops frames at the source.
pub const VIDEO_FRAME_CHANNEL_CAPACITY: usize = 8;

/// Which local surface to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSourceKind {
    /// A camera device
    Camera,
    /// The desktop or a window
    Screen,
}

impl std::fmt::Display for VideoSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoSourceKind::Camera => write!(f, "camera"),
            VideoSourceKind::Screen => write!(f, "screen"),
        }
    }
}

/// Requested capture parameters.
#[derive(Debug, Clone)]
pub struct VideoConstraints {
    /// Which surface to capture
    pub source: VideoSourceKind,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Target framerate (frames per second)
    pub framerate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            source: VideoSourceKind::Camera,
            width: 1280,
            height: 720,
            framerate: 30,
        }
    }
}

impl VideoConstraints {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(
                "video dimensions must be greater than 0".to_string(),
            ));
        }
        if self.framerate == 0 || self.framerate > 120 {
            return Err(Error::InvalidConfig(
                "video framerate must be 1-120".to_string(),
            ));
        }
        Ok(())
    }

    /// Duration of one frame at the requested framerate.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.framerate))
    }
}

/// One encoded VP8 frame ready for the RTP track.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Encoded VP8 payload
    pub data: Vec<u8>,
    /// Display duration
    pub duration: Duration,
    /// Whether this frame can start a decode
    pub is_keyframe: bool,
}

/// A platform capture backend (camera API, screen grabber).
///
/// `open` must fail with a device error before returning the handle if
/// the surface cannot be acquired; a handle means frames are flowing.
pub trait VideoSource: Send + Sync {
    fn open(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<(VideoCaptureHandle, mpsc::Receiver<VideoFrame>)>;
}

/// Validate constraints and acquire the source.
pub fn acquire(
    source: &dyn VideoSource,
    constraints: &VideoConstraints,
) -> Result<(VideoCaptureHandle, mpsc::Receiver<VideoFrame>)> {
    constraints.validate()?;
    source.open(constraints)
}

/// Running video capture. Dropping the handle stops the source thread.
#[derive(Debug)]
pub struct VideoCaptureHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl VideoCaptureHandle {
    /// Wrap a backend capture thread. The thread must exit promptly
    /// once the stop channel fires or its sender is dropped.
    pub fn new(stop_tx: std_mpsc::Sender<()>, thread: thread::JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    /// Stop the capture and join its thread.
    pub fn stop(mut self) {
        self.shutdown();
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

impl Drop for VideoCaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
