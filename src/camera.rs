// Camera contract and the background-capture wrapper.
//
// Frame acquisition runs on its own thread per camera, so observation reads
// return the most recent completed frame without waiting on the hardware.
// The trade is bounded staleness for a read that never stalls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

/// Pause before retrying after a failed hardware grab
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(10);

/// One captured image, packed RGB8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera is not connected")]
    NotConnected,

    #[error("camera is already connected")]
    AlreadyConnected,

    #[error("no frame captured yet")]
    NoFrame,

    #[error("capture failure: {0}")]
    Capture(String),
}

/// Camera contract consumed by the robot.
pub trait Camera {
    fn connect(&mut self) -> Result<(), CameraError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// Latest completed frame; never blocks on new hardware capture.
    fn read_latest_frame(&self) -> Result<Frame, CameraError>;
}

/// Blocking frame grabber backing an [`AsyncCamera`]. Implementations wrap
/// the actual capture hardware.
pub trait FrameSource: Send + 'static {
    fn open(&mut self) -> Result<(), CameraError>;

    /// Blocking capture of one frame.
    fn grab(&mut self) -> Result<Frame, CameraError>;

    fn close(&mut self);
}

/// Conforming [`Camera`] implementation: a capture thread keeps the latest
/// completed frame available for non-blocking reads.
pub struct AsyncCamera {
    source: Option<Box<dyn FrameSource>>,
    latest: Arc<Mutex<Option<Frame>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Box<dyn FrameSource>>>,
}

impl AsyncCamera {
    pub fn new(source: impl FrameSource) -> Self {
        Self {
            source: Some(Box::new(source)),
            latest: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Camera for AsyncCamera {
    fn connect(&mut self) -> Result<(), CameraError> {
        if self.worker.is_some() {
            return Err(CameraError::AlreadyConnected);
        }
        let mut source = self.source.take().ok_or(CameraError::AlreadyConnected)?;
        if let Err(e) = source.open() {
            self.source = Some(source);
            return Err(e);
        }

        self.stop.store(false, Ordering::Relaxed);
        let stop = self.stop.clone();
        let latest = self.latest.clone();
        self.worker = Some(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match source.grab() {
                    Ok(frame) => {
                        *latest.lock().unwrap() = Some(frame);
                    }
                    Err(e) => {
                        warn!("Frame capture failed: {e}");
                        thread::sleep(GRAB_RETRY_DELAY);
                    }
                }
            }
            source.close();
            source
        }));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => warn!("Capture thread panicked during disconnect"),
            }
        }
        *self.latest.lock().unwrap() = None;
    }

    fn is_connected(&self) -> bool {
        self.worker.is_some()
    }

    fn read_latest_frame(&self) -> Result<Frame, CameraError> {
        if self.worker.is_none() {
            return Err(CameraError::NotConnected);
        }
        self.latest
            .lock()
            .unwrap()
            .clone()
            .ok_or(CameraError::NoFrame)
    }
}
