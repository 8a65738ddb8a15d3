//! Live session: wires camera, scheduler, store and renderer together.

use crate::client::InferenceClient;
use crate::events::{self, SessionEvent};
use crate::overlay::{Canvas, OverlayRenderer, DEFAULT_RENDER_FPS};
use crate::scheduler::{AnalysisScheduler, SchedulerState, DEFAULT_TICK_INTERVAL};
use crate::store::ResultStore;
use crate::types::AnalysisMode;
use lookout_hw::{CameraError, CaptureBackend, FrameEncoder, FrameSource, VideoSurface};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tick_interval: Duration,
    pub render_fps: u32,
    /// Buffered events before new ones are dropped.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            render_fps: DEFAULT_RENDER_FPS,
            event_capacity: 64,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("session not started")]
    NotStarted,
}

pub struct LiveSession<B, C, K>
where
    B: CaptureBackend,
    C: InferenceClient,
    K: Canvas + Send + 'static,
{
    source: FrameSource<B>,
    scheduler: AnalysisScheduler<C>,
    renderer: OverlayRenderer<K>,
    store: ResultStore,
    config: SessionConfig,
    surface: Option<VideoSurface>,
    mode: Option<AnalysisMode>,
    watcher: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl<B, C, K> LiveSession<B, C, K>
where
    B: CaptureBackend,
    C: InferenceClient,
    K: Canvas + Send + 'static,
{
    pub fn new(backend: B, client: Arc<C>, canvas: K, encoder: FrameEncoder, config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let store = ResultStore::new();
        let scheduler = AnalysisScheduler::new(client, store.clone(), encoder).with_events(events_tx.clone());
        Self {
            source: FrameSource::new(backend),
            scheduler,
            renderer: OverlayRenderer::new(canvas, config.render_fps),
            store,
            config,
            surface: None,
            mode: None,
            watcher: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// The event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Open the camera and begin analysing in `mode`. On a running
    /// session with a live camera this is a mode switch.
    ///
    /// A camera error aborts the start with nothing left acquired.
    pub async fn start(&mut self, mode: AnalysisMode) -> Result<(), SessionError> {
        match self.surface.as_ref().map(VideoSurface::is_live) {
            Some(true) => return self.switch_mode(mode),
            // Camera was lost; start over with a fresh device.
            Some(false) => self.shutdown().await,
            None => {}
        }

        let surface = match self.source.start().await {
            Ok(surface) => surface,
            Err(e) => {
                tracing::error!(backend = %self.source.backend().describe(), error = %e, "camera start failed");
                events::emit(&self.events_tx, SessionEvent::CameraFailed(e.clone()));
                return Err(e.into());
            }
        };

        self.scheduler
            .start(surface.clone(), mode.clone(), self.config.tick_interval);
        self.renderer.start(surface.clone(), self.store.clone());
        self.watcher = Some(spawn_loss_watcher(surface.clone(), self.events_tx.clone()));

        tracing::info!(
            backend = %self.source.backend().describe(),
            mode = %mode.kind(),
            "live session started"
        );
        self.surface = Some(surface);
        self.mode = Some(mode);
        Ok(())
    }

    /// Restart only the scheduler in `mode`; the camera stays open.
    pub fn switch_mode(&mut self, mode: AnalysisMode) -> Result<(), SessionError> {
        let surface = self.surface.clone().ok_or(SessionError::NotStarted)?;
        self.scheduler
            .start(surface, mode.clone(), self.config.tick_interval);
        tracing::info!(mode = %mode.kind(), "analysis mode switched");
        self.mode = Some(mode);
        Ok(())
    }

    /// Tear everything down and release the camera. Idempotent.
    ///
    /// Joins the capture thread on the calling thread; async callers
    /// should prefer [`shutdown`](Self::shutdown).
    pub fn stop(&mut self) {
        self.abort_watcher();
        self.scheduler.stop();
        self.renderer.stop();
        self.source.stop();
        self.clear();
    }

    /// [`stop`](Self::stop) that waits for the tick loop and joins the
    /// capture thread without blocking the runtime.
    pub async fn shutdown(&mut self) {
        self.abort_watcher();
        self.scheduler.shutdown().await;
        self.renderer.stop();
        self.source.shutdown().await;
        self.clear();
    }

    // The watcher would report the clean close as a loss.
    fn abort_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    fn clear(&mut self) {
        if self.surface.take().is_some() {
            tracing::info!("live session stopped");
        }
        self.mode = None;
    }

    /// True while the camera is delivering frames. A lost camera makes
    /// this false before `stop` is called.
    pub fn is_active(&self) -> bool {
        self.surface.as_ref().is_some_and(VideoSurface::is_live)
    }

    pub fn mode(&self) -> Option<&AnalysisMode> {
        self.mode.as_ref()
    }

    pub fn surface(&self) -> Option<&VideoSurface> {
        self.surface.as_ref()
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn renderer(&self) -> &OverlayRenderer<K> {
        &self.renderer
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn backend(&self) -> &B {
        self.source.backend()
    }
}

impl<B, C, K> Drop for LiveSession<B, C, K>
where
    B: CaptureBackend,
    C: InferenceClient,
    K: Canvas + Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reports the capture thread ending. The scheduler and renderer halt on
/// their own when the surface closes; this only tells the driver.
fn spawn_loss_watcher(surface: VideoSurface, tx: mpsc::Sender<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let fault = surface.closed().await;
        tracing::warn!(error = ?fault, "camera lost");
        // Waits for room: a full queue must not swallow the loss.
        if tx.send(SessionEvent::CameraLost(fault)).await.is_err() {
            tracing::debug!("camera loss not delivered; no event receiver");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RequestError;
    use crate::overlay::FrameCanvas;
    use crate::types::{AnalysisRequest, AnalysisRequestKind, AnalysisResult};
    use lookout_hw::SyntheticBackend;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct CountingClient {
        calls: AtomicUsize,
    }

    impl CountingClient {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InferenceClient for CountingClient {
        fn submit(
            &self,
            request: AnalysisRequest,
        ) -> impl Future<Output = Result<AnalysisResult, RequestError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match request.mode {
                    AnalysisMode::CrowdCount => Ok(AnalysisResult::Crowd {
                        total_count: 4,
                        annotated_image: None,
                    }),
                    _ => Ok(AnalysisResult::Identify { faces: vec![] }),
                }
            }
        }
    }

    type TestSession = LiveSession<SyntheticBackend, CountingClient, FrameCanvas>;

    fn session(backend: SyntheticBackend) -> TestSession {
        let config = SessionConfig {
            tick_interval: Duration::from_millis(50),
            render_fps: 20,
            event_capacity: 256,
        };
        session_with(backend, Arc::new(CountingClient::default()), config)
    }

    fn session_with(backend: SyntheticBackend, client: Arc<CountingClient>, config: SessionConfig) -> TestSession {
        LiveSession::new(
            backend,
            client,
            FrameCanvas::new(32, 24),
            FrameEncoder::default(),
            config,
        )
    }

    async fn wait_for_loss(events: &mut mpsc::Receiver<SessionEvent>) -> Option<CameraError> {
        timeout(Duration::from_secs(3), async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::CameraLost(fault) = event {
                    return fault;
                }
            }
            None
        })
        .await
        .unwrap()
    }

    async fn wait_for_kind(store: &ResultStore, kind: AnalysisRequestKind) -> bool {
        timeout(Duration::from_secs(3), async {
            loop {
                if store.latest().is_some_and(|r| r.kind() == kind) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_start_publishes_results() {
        let mut session = session(SyntheticBackend::new(32, 24, 30));
        let mut events = session.take_events().unwrap();
        session.start(AnalysisMode::Identify).await.unwrap();

        assert!(session.is_active());
        assert!(wait_for_kind(session.store(), AnalysisRequestKind::Identify).await);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ResultPublished { .. })
        ));
        assert!(session.renderer().frames() > 0);
        session.stop();
    }

    #[tokio::test]
    async fn test_camera_failure_leaves_nothing_acquired() {
        let backend = SyntheticBackend::new(32, 24, 30)
            .failing_open(CameraError::PermissionDenied("/dev/video0".into()));
        let handles = backend.open_handles();
        let mut session = session(backend);
        let mut events = session.take_events().unwrap();

        let err = session.start(AnalysisMode::Identify).await.unwrap_err();
        assert!(matches!(err, SessionError::Camera(CameraError::PermissionDenied(_))));
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::CameraFailed(CameraError::PermissionDenied("/dev/video0".into()))
        );
        assert!(!session.is_active());
        assert_eq!(session.scheduler_state(), SchedulerState::Idle);
        assert!(!session.renderer().is_running());
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_switch_mode_keeps_camera_open() {
        let backend = SyntheticBackend::new(32, 24, 30);
        let opens = backend.open_count();
        let mut session = session(backend);
        session.start(AnalysisMode::Identify).await.unwrap();
        assert!(wait_for_kind(session.store(), AnalysisRequestKind::Identify).await);

        session.switch_mode(AnalysisMode::CrowdCount).unwrap();
        assert_eq!(session.mode(), Some(&AnalysisMode::CrowdCount));
        assert!(wait_for_kind(session.store(), AnalysisRequestKind::CrowdCount).await);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        session.stop();
    }

    #[tokio::test]
    async fn test_switch_mode_requires_start() {
        let mut session = session(SyntheticBackend::new(32, 24, 30));
        assert_eq!(
            session.switch_mode(AnalysisMode::Identify),
            Err(SessionError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_stop_releases_camera_and_store() {
        let backend = SyntheticBackend::new(32, 24, 30);
        let handles = backend.open_handles();
        let mut session = session(backend);
        session.start(AnalysisMode::Identify).await.unwrap();
        assert_eq!(handles.load(Ordering::SeqCst), 1);

        session.stop();
        session.stop();
        assert_eq!(handles.load(Ordering::SeqCst), 0);
        assert!(!session.is_active());
        assert_eq!(session.store().active_generation(), None);
        assert!(session.store().latest().is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_camera() {
        let backend = SyntheticBackend::new(32, 24, 30);
        let handles = backend.open_handles();
        {
            let mut session = session(backend);
            session.start(AnalysisMode::GroupAnalyze).await.unwrap();
        }
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_device_loss_reported() {
        let mut session = session(SyntheticBackend::new(32, 24, 30).lose_device_after(3));
        let mut events = session.take_events().unwrap();
        session.start(AnalysisMode::Identify).await.unwrap();

        let lost = wait_for_loss(&mut events).await;
        assert!(matches!(lost, Some(CameraError::DeviceUnavailable(_))));
        session.stop();
    }

    #[tokio::test]
    async fn test_no_requests_after_camera_lost() {
        let client = Arc::new(CountingClient::default());
        // One-slot queue: result events fill it, the loss must still arrive.
        let config = SessionConfig {
            tick_interval: Duration::from_millis(20),
            render_fps: 50,
            event_capacity: 1,
        };
        let backend = SyntheticBackend::new(32, 24, 30).lose_device_after(10);
        let mut session = session_with(backend, client.clone(), config);
        let mut events = session.take_events().unwrap();
        session.start(AnalysisMode::Identify).await.unwrap();

        let lost = wait_for_loss(&mut events).await;
        assert!(matches!(lost, Some(CameraError::DeviceUnavailable(_))));
        assert!(client.calls() > 0);

        sleep(Duration::from_millis(50)).await;
        let submitted = client.calls();
        let painted = session.renderer().frames();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(client.calls(), submitted);
        assert_eq!(session.renderer().frames(), painted);
        assert_eq!(session.scheduler_state(), SchedulerState::Idle);
        assert!(!session.renderer().is_running());
        assert!(!session.is_active());

        // A fresh start reopens the device and resumes analysis.
        session.start(AnalysisMode::Identify).await.unwrap();
        assert!(session.is_active());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_camera() {
        let backend = SyntheticBackend::new(32, 24, 30);
        let handles = backend.open_handles();
        let mut session = session(backend);
        session.start(AnalysisMode::CrowdCount).await.unwrap();
        assert!(wait_for_kind(session.store(), AnalysisRequestKind::CrowdCount).await);

        session.shutdown().await;
        assert_eq!(handles.load(Ordering::SeqCst), 0);
        assert!(!session.is_active());
        assert_eq!(session.scheduler_state(), SchedulerState::Idle);
        assert!(!session.renderer().is_running());
        assert!(session.store().latest().is_none());
        session.shutdown().await;
    }
}
