use crate::client::RequestError;
use lookout_hw::CameraError;
use tokio::sync::mpsc;

/// Notifications surfaced to whoever drives a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The camera could not be opened. Persistent until the user acts.
    CameraFailed(CameraError),
    /// The capture thread ended while the session was live.
    CameraLost(Option<CameraError>),
    /// A request failed; the scheduler keeps ticking.
    RequestFailed { generation: u64, error: RequestError },
    /// A result was applied to the store.
    ResultPublished { generation: u64, sequence: u64 },
}

/// Non-blocking send: a full or closed channel drops the event.
pub(crate) fn emit(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = tx.try_send(event) {
        tracing::debug!(error = %e, "session event dropped");
    }
}
