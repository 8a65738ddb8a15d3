//! lookout-hw: Hardware abstraction for live camera capture.
//!
//! Owns the camera device on a dedicated capture thread, exposes the most
//! recent frame through a shared [`VideoSurface`], and encodes frames into
//! transportable JPEG payloads on demand.

pub mod camera;
pub mod encoder;
pub mod frame;
pub mod source;
pub mod surface;
pub mod synthetic;

pub use camera::{CameraError, CaptureBackend, CaptureDevice, V4l2Backend};
pub use encoder::{EncodeError, FrameEncoder, ImagePayload};
pub use frame::Frame;
pub use source::{CameraSession, FrameSource};
pub use surface::{SurfaceWriter, VideoSurface};
pub use synthetic::SyntheticBackend;
