//! Live video surface: the latest captured frame, shared between the
//! capture thread (single writer) and any number of readers.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Default)]
struct SurfaceState {
    frame: Option<Arc<Frame>>,
    fault: Option<CameraError>,
}

/// Write side of a surface, owned by the capture thread. Dropping it
/// closes the surface.
pub struct SurfaceWriter {
    tx: watch::Sender<SurfaceState>,
}

/// Read side of a live video surface. Cheap to clone; every clone
/// observes the same most-recent frame.
#[derive(Clone)]
pub struct VideoSurface {
    rx: watch::Receiver<SurfaceState>,
}

/// Create a connected writer/surface pair with no frame yet.
pub fn channel() -> (SurfaceWriter, VideoSurface) {
    let (tx, rx) = watch::channel(SurfaceState::default());
    (SurfaceWriter { tx }, VideoSurface { rx })
}

impl SurfaceWriter {
    /// Replace the current frame.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        self.tx.send_modify(|state| state.frame = Some(frame));
    }

    /// Record an unrecoverable capture error. Readers see it once the
    /// writer is dropped and the surface closes.
    pub fn fail(&self, err: CameraError) {
        self.tx.send_modify(|state| state.fault = Some(err));
    }
}

impl VideoSurface {
    /// The most recent frame, if the camera has produced one.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().frame.clone()
    }

    /// Current frame size, `(0, 0)` until the first frame arrives.
    pub fn dimensions(&self) -> (u32, u32) {
        self.rx
            .borrow()
            .frame
            .as_ref()
            .map(|f| (f.width, f.height))
            .unwrap_or((0, 0))
    }

    /// False once the capture thread has exited.
    pub fn is_live(&self) -> bool {
        self.rx.has_changed().is_ok()
    }

    /// Wait for the first frame. Returns `None` if the surface closes first.
    pub async fn first_frame(&self) -> Option<Arc<Frame>> {
        let mut rx = self.rx.clone();
        let state = rx.wait_for(|s| s.frame.is_some()).await.ok()?;
        state.frame.clone()
    }

    /// Resolve when the capture thread exits, yielding the fault that
    /// ended it (if any). A clean stop yields `None`.
    pub async fn closed(&self) -> Option<CameraError> {
        let mut rx = self.rx.clone();
        while rx.changed().await.is_ok() {}
        let fault = rx.borrow().fault.clone();
        fault
    }
}
