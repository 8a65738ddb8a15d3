//! Frame source: owns the camera session and its capture thread.
//!
//! The device is opened on a dedicated OS thread (blocking V4L2 reads
//! never run on the async runtime). `start` awaits the open result;
//! `stop` and `Drop` signal the thread and join it, so the hardware is
//! released before they return. `shutdown` does the same join on the
//! blocking pool so async callers do not stall their runtime.

use crate::camera::{CameraError, CaptureBackend};
use crate::surface::{self, SurfaceWriter, VideoSurface};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Owns the camera for a [`FrameSource`]. At most one exists per source.
pub struct CameraSession {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    surface: VideoSurface,
}

impl CameraSession {
    /// Spawn the capture thread and wait for the device to open.
    pub async fn open<B: CaptureBackend>(backend: Arc<B>) -> Result<Self, CameraError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (writer, surface) = surface::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("lookout-capture".into())
            .spawn(move || capture_loop(backend.as_ref(), writer, &thread_stop, ready_tx))
            .map_err(|e| CameraError::DeviceUnavailable(format!("failed to spawn capture thread: {e}")))?;

        // If this future is dropped mid-open, the thread sees the closed
        // channel and releases the device on its own.
        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                stop,
                thread: Some(thread),
                surface,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CameraError::DeviceUnavailable(
                    "capture thread exited during open".into(),
                ))
            }
        }
    }

    pub fn surface(&self) -> VideoSurface {
        self.surface.clone()
    }

    /// False once the capture thread has ended (device lost).
    pub fn is_live(&self) -> bool {
        self.surface.is_live()
    }

    /// Stop the capture thread and wait for it off the async runtime.
    /// `Drop` covers sessions that are never closed this way.
    pub async fn close(mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("capture thread panicked"),
            Err(e) => tracing::error!(error = %e, "capture thread join did not complete"),
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
        tracing::debug!("camera session released");
    }
}

fn capture_loop<B: CaptureBackend>(
    backend: &B,
    writer: SurfaceWriter,
    stop: &AtomicBool,
    ready: oneshot::Sender<Result<(), CameraError>>,
) {
    let mut device = match backend.open() {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!(backend = %backend.describe(), error = %e, "camera open failed");
            let _ = ready.send(Err(e));
            return;
        }
    };

    let (width, height) = device.resolution();
    tracing::info!(backend = %backend.describe(), width, height, "capture started");

    if ready.send(Ok(())).is_err() {
        tracing::debug!("start abandoned before camera opened; releasing device");
        return;
    }

    while !stop.load(Ordering::Acquire) {
        match device.next_frame() {
            Ok(Some(frame)) => writer.publish(frame),
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "capture failed; closing surface");
                writer.fail(e);
                break;
            }
        }
    }

    drop(device);
    tracing::info!("capture thread exiting");
}

/// Idempotent start/stop wrapper around a [`CameraSession`].
pub struct FrameSource<B: CaptureBackend> {
    backend: Arc<B>,
    session: Option<CameraSession>,
}

impl<B: CaptureBackend> FrameSource<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            session: None,
        }
    }

    /// Open the camera, or return the existing surface if already started.
    ///
    /// A session whose capture thread has died (device lost) is released
    /// and reopened.
    pub async fn start(&mut self) -> Result<VideoSurface, CameraError> {
        if let Some(session) = &self.session {
            if session.is_live() {
                return Ok(session.surface());
            }
            tracing::info!("previous camera session ended; reopening");
            self.session = None;
        }

        let session = CameraSession::open(self.backend.clone()).await?;
        let surface = session.surface();
        self.session = Some(session);
        Ok(surface)
    }

    /// Release the camera. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        if self.session.take().is_some() {
            tracing::info!("camera stopped");
        }
    }

    /// Async form of [`stop`](Self::stop): the capture thread is joined on
    /// the blocking pool.
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            tracing::info!("camera stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
