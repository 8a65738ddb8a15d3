//! Synthetic camera: a moving test pattern, for running without hardware.

use crate::camera::{CameraError, CaptureBackend, CaptureDevice};
use crate::frame::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Backend producing a scrolling gradient at a fixed frame rate.
///
/// Tracks how many devices it has opened and how many are still held,
/// so callers can check that the "hardware" is released.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    width: u32,
    height: u32,
    fps: u32,
    open_failure: Option<CameraError>,
    lose_after: Option<u32>,
    opens: Arc<AtomicUsize>,
    handles: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            open_failure: None,
            lose_after: None,
            opens: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every `open` fail with `err`.
    pub fn failing_open(mut self, err: CameraError) -> Self {
        self.open_failure = Some(err);
        self
    }

    /// Simulate the device disappearing after `frames` frames.
    pub fn lose_device_after(mut self, frames: u32) -> Self {
        self.lose_after = Some(frames);
        self
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }

    /// Number of devices currently held open.
    pub fn open_handles(&self) -> Arc<AtomicUsize> {
        self.handles.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn describe(&self) -> String {
        format!("synthetic {}x{}@{}", self.width, self.height, self.fps)
    }

    fn open(&self) -> Result<Box<dyn CaptureDevice>, CameraError> {
        if let Some(err) = &self.open_failure {
            return Err(err.clone());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticDevice {
            width: self.width,
            height: self.height,
            period: Duration::from_secs(1) / self.fps,
            sequence: 0,
            lose_after: self.lose_after,
            handles: self.handles.clone(),
        }))
    }
}

struct SyntheticDevice {
    width: u32,
    height: u32,
    period: Duration,
    sequence: u32,
    lose_after: Option<u32>,
    handles: Arc<AtomicUsize>,
}

impl CaptureDevice for SyntheticDevice {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.lose_after.is_some_and(|n| self.sequence >= n) {
            return Err(CameraError::DeviceUnavailable("synthetic device unplugged".into()));
        }
        std::thread::sleep(self.period);

        let shift = self.sequence;
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x.wrapping_add(shift) % 256) as u8);
                data.push((y % 256) as u8);
                data.push(((x + y) / 2 % 256) as u8);
            }
        }

        let frame = Frame::new(data, self.width, self.height, self.sequence)
            .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_counts_handles() {
        let backend = SyntheticBackend::new(2, 2, 1000);
        let handles = backend.open_handles();
        let device = backend.open().unwrap_or_else(|e| panic!("open failed: {e}"));
        assert_eq!(handles.load(Ordering::SeqCst), 1);
        drop(device);
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_frames_advance_sequence() {
        let backend = SyntheticBackend::new(3, 2, 1000);
        let mut device = backend.open().unwrap_or_else(|e| panic!("open failed: {e}"));
        let a = device.next_frame().unwrap().unwrap();
        let b = device.next_frame().unwrap().unwrap();
        assert_eq!(a.data.len(), 18);
        assert_eq!(b.sequence, a.sequence + 1);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_lose_device_after() {
        let backend = SyntheticBackend::new(2, 2, 1000).lose_device_after(1);
        let mut device = backend.open().unwrap_or_else(|e| panic!("open failed: {e}"));
        assert!(device.next_frame().is_ok());
        assert!(device.next_frame().is_err());
    }

    #[test]
    fn test_failing_open() {
        let backend = SyntheticBackend::new(2, 2, 30)
            .failing_open(CameraError::PermissionDenied("no".into()));
        assert!(backend.open().is_err());
        assert_eq!(backend.open_count().load(Ordering::SeqCst), 0);
    }
}
