//! Camera backends: the `CaptureBackend` seam and V4L2 capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Dequeue timeout, so the capture thread can observe a stop request
/// even when the device stops delivering frames.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
const MMAP_BUFFERS: u32 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// A camera opened by a [`CaptureBackend`]. Lives on the capture thread
/// and releases the hardware when dropped.
pub trait CaptureDevice {
    /// Negotiated frame size.
    fn resolution(&self) -> (u32, u32);

    /// Block until the next frame. `Ok(None)` means no frame arrived within
    /// the device's dequeue timeout; the caller should poll again.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// Opens camera devices. Implementations must be cheap to share; `open`
/// runs on the capture thread.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
}

/// V4L2 camera opened at a requested resolution.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl V4l2Backend {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CaptureBackend for V4l2Backend {
    fn describe(&self) -> String {
        format!("v4l2:{} {}x{}", self.device_path, self.width, self.height)
    }

    fn open(&self) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let camera = V4l2Camera::open(&self.device_path, self.width, self.height)?;
        Ok(Box::new(camera))
    }
}

/// Streaming V4L2 device handle. Field order matters: the stream is
/// dropped (stream off, buffers unmapped) before the device fd closes.
struct V4l2Camera {
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4l2Camera {
    fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceUnavailable(format!(
                "device not found: {device_path}"
            )));
        }

        let device = Device::with_path(device_path).map_err(|e| classify_open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::DeviceUnavailable(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path} does not support video capture"
            )));
        }

        // Ask for YUYV; webcams that only stream MJPG at this size negotiate that instead.
        let mut fmt = device.format().map_err(|e| {
            CameraError::DeviceUnavailable(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::DeviceUnavailable(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpg
        } else {
            return Err(CameraError::DeviceUnavailable(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or MJPG)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| classify_open_error(device_path, e))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        Ok(Self {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }
}

impl CaptureDevice for V4l2Camera {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(None);
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(CameraError::PermissionDenied(format!("failed to dequeue buffer: {e}")));
            }
            Err(e) => {
                return Err(CameraError::DeviceUnavailable(format!("failed to dequeue buffer: {e}")));
            }
        };
        let sequence = meta.sequence;
        let used = match (meta.bytesused as usize).min(buf.len()) {
            0 => buf.len(),
            n => n,
        };

        let rgb = buf_to_rgb(&buf[..used], self.pixel_format, self.width, self.height)?;
        // MJPG frames can decode at a size other than the negotiated one.
        let (width, height) = match self.pixel_format {
            PixelFormat::Yuyv => (self.width, self.height),
            PixelFormat::Mjpg => {
                let pixels = rgb.len() / 3;
                if pixels == (self.width * self.height) as usize {
                    (self.width, self.height)
                } else {
                    tracing::debug!(seq = sequence, "dropping MJPG frame with unexpected size");
                    return Ok(None);
                }
            }
        };

        Frame::new(rgb, width, height, sequence)
            .map(Some)
            .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))
    }
}

/// Convert a raw buffer to RGB based on the negotiated format.
fn buf_to_rgb(buf: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map_err(|e| CameraError::DeviceUnavailable(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Mjpg => {
            let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map_err(|e| CameraError::DeviceUnavailable(format!("MJPG decode failed: {e}")))?;
            Ok(img.to_rgb8().into_raw())
        }
    }
}

fn classify_open_error(device_path: &str, e: io::Error) -> CameraError {
    let text = e.to_string();
    if e.kind() == io::ErrorKind::PermissionDenied {
        CameraError::PermissionDenied(format!("{device_path}: {e}"))
    } else if text.contains("busy") || text.contains("EBUSY") {
        CameraError::DeviceUnavailable(format!("{device_path}: device busy"))
    } else {
        CameraError::DeviceUnavailable(format!("{device_path}: {e}"))
    }
}
