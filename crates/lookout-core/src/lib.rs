//! lookout-core: live face analysis over a remote inference backend.
//!
//! Ticks encoded camera frames out to the backend at a fixed interval,
//! keeps the latest result in a generation-stamped store, and paints it
//! over the live video at display rate.

pub mod client;
pub mod events;
pub mod overlay;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;

pub use client::{HttpInferenceClient, InferenceClient, RegisteredUser, RegisterOutcome, RequestError};
pub use events::SessionEvent;
pub use overlay::{paint, Canvas, FrameCanvas, OverlayRenderer, ScaleTransform};
pub use scheduler::{AnalysisScheduler, SchedulerState};
pub use session::{LiveSession, SessionConfig, SessionError};
pub use store::{Publication, ResultStore, StoreSnapshot};
pub use types::{
    AnalysisMode, AnalysisRequest, AnalysisRequestKind, AnalysisResult, BoundingBox, ConfidenceScale,
    DetectedFace,
};
