//! Analysis scheduler: the fixed-interval network loop.
//!
//! Each tick encodes the current surface frame and submits it, with at
//! most one request in flight per generation. A tick that lands while a
//! request is outstanding is skipped, never queued. The submit runs on
//! its own task so the tick loop never awaits the network.
//!
//! Every `start` opens a new generation; `stop` cancels the tick loop
//! and revokes the store's write access. Requests still in flight drain
//! on their own and their results are discarded at publish time.

use crate::client::{InferenceClient, RequestError};
use crate::events::{self, SessionEvent};
use crate::store::{Publication, ResultStore};
use crate::types::{AnalysisMode, AnalysisRequest, AnalysisRequestKind, AnalysisResult};
use lookout_hw::{EncodeError, FrameEncoder, VideoSurface};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);
/// Shorter requested intervals are raised to this.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed {
        interval: Duration,
        kind: AnalysisRequestKind,
    },
    AwaitingResponse,
    /// Stop requested; the tick loop has not exited yet.
    Cancelled,
}

struct Shared {
    generation: u64,
    state: SchedulerState,
}

type SharedState = Arc<Mutex<Shared>>;

fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running tick loop and the token that cancels it.
struct Run {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct AnalysisScheduler<C: InferenceClient> {
    client: Arc<C>,
    encoder: FrameEncoder,
    store: ResultStore,
    events: Option<mpsc::Sender<SessionEvent>>,
    shared: SharedState,
    next_generation: u64,
    run: Option<Run>,
}

impl<C: InferenceClient> AnalysisScheduler<C> {
    pub fn new(client: Arc<C>, store: ResultStore, encoder: FrameEncoder) -> Self {
        Self {
            client,
            encoder,
            store,
            events: None,
            shared: Arc::new(Mutex::new(Shared {
                generation: 0,
                state: SchedulerState::Idle,
            })),
            next_generation: 0,
            run: None,
        }
    }

    /// Report request failures and publications on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> SchedulerState {
        lock(&self.shared).state.clone()
    }

    /// Generation of the running loop, if any.
    pub fn generation(&self) -> Option<u64> {
        self.run.as_ref().map(|_| lock(&self.shared).generation)
    }

    /// False once stopped, or once the loop ended because the camera closed.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.task.is_finished())
    }

    /// Start ticking against `surface`, replacing any running generation.
    /// Returns the new generation.
    pub fn start(&mut self, surface: VideoSurface, mode: AnalysisMode, interval: Duration) -> u64 {
        let _ = self.cancel_run();

        let interval = interval.max(MIN_TICK_INTERVAL);
        self.next_generation += 1;
        let generation = self.next_generation;
        let kind = mode.kind();
        self.store.activate(generation);
        {
            let mut shared = lock(&self.shared);
            shared.generation = generation;
            shared.state = SchedulerState::Armed { interval, kind };
        }

        let cycle = Arc::new(Cycle {
            generation,
            interval,
            mode,
            surface,
            encoder: self.encoder,
            client: self.client.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            shared: self.shared.clone(),
            busy: Arc::new(AtomicBool::new(false)),
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(tick_loop(cycle, stop_rx));
        self.run = Some(Run {
            stop: stop_tx,
            task,
        });

        tracing::info!(
            generation,
            kind = %kind,
            interval_ms = interval.as_millis() as u64,
            "analysis scheduler started"
        );
        generation
    }

    /// Halt the timer and revoke the current generation. In-flight
    /// requests are left to settle; their results are discarded.
    pub fn stop(&mut self) {
        let _ = self.cancel_run();
    }

    /// Stop and wait for the tick loop to exit.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.cancel_run() {
            let _ = task.await;
        }
    }

    /// Signal the running loop, if any, and retire its generation.
    fn cancel_run(&mut self) -> Option<JoinHandle<()>> {
        let run = self.run.take()?;
        lock(&self.shared).state = SchedulerState::Cancelled;
        let _ = run.stop.send(());
        self.next_generation += 1;
        self.store.deactivate();
        tracing::info!("analysis scheduler stopped");
        Some(run.task)
    }
}

impl<C: InferenceClient> Drop for AnalysisScheduler<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything one generation's tick loop needs.
struct Cycle<C: InferenceClient> {
    generation: u64,
    interval: Duration,
    mode: AnalysisMode,
    surface: VideoSurface,
    encoder: FrameEncoder,
    client: Arc<C>,
    store: ResultStore,
    events: Option<mpsc::Sender<SessionEvent>>,
    shared: SharedState,
    /// Set while this generation has a request outstanding.
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag when the request task ends, even by panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn tick_loop<C: InferenceClient>(cycle: Arc<Cycle<C>>, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(cycle.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence = 0u64;

    let closed = cycle.surface.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            // Fires on an explicit stop and when the scheduler is dropped.
            _ = &mut stop => break,
            fault = &mut closed => {
                tracing::warn!(generation = cycle.generation, error = ?fault, "camera closed; analysis halted");
                break;
            }
            _ = ticker.tick() => {}
        }
        sequence += 1;
        cycle.run_once(sequence);
    }

    let mut shared = lock(&cycle.shared);
    if shared.generation == cycle.generation {
        shared.state = SchedulerState::Idle;
    }
    drop(shared);
    tracing::debug!(generation = cycle.generation, ticks = sequence, "tick loop exited");
}

impl<C: InferenceClient> Cycle<C> {
    fn is_current(&self) -> bool {
        let shared = lock(&self.shared);
        shared.generation == self.generation && shared.state != SchedulerState::Cancelled
    }

    fn armed_state(&self) -> SchedulerState {
        SchedulerState::Armed {
            interval: self.interval,
            kind: self.mode.kind(),
        }
    }

    /// One tick: skip if busy or not ready, otherwise encode and submit.
    fn run_once(self: &Arc<Self>, sequence: u64) {
        if !self.is_current() {
            return;
        }
        if self.busy.load(Ordering::Acquire) {
            tracing::debug!(generation = self.generation, sequence, "request in flight; skipping tick");
            return;
        }

        let image = match self.encoder.encode(&self.surface) {
            Ok(image) => image,
            Err(EncodeError::NotReady) => {
                tracing::trace!(generation = self.generation, sequence, "surface not ready; skipping tick");
                return;
            }
            Err(e) => {
                tracing::warn!(generation = self.generation, error = %e, "frame encode failed; skipping tick");
                return;
            }
        };

        self.busy.store(true, Ordering::Release);
        {
            let mut shared = lock(&self.shared);
            if shared.generation == self.generation {
                shared.state = SchedulerState::AwaitingResponse;
            }
        }

        let request = AnalysisRequest {
            mode: self.mode.clone(),
            image,
        };
        let cycle = self.clone();
        let guard = InFlight(self.busy.clone());
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = cycle.client.submit(request).await;
            cycle.settle(sequence, outcome);
        });
    }

    fn settle(&self, sequence: u64, outcome: Result<AnalysisResult, RequestError>) {
        let generation = self.generation;
        match outcome {
            Ok(result) => {
                let faces = result.faces().len();
                if self.store.publish(generation, sequence, Publication::Result(result)) {
                    tracing::debug!(generation, sequence, faces, "result published");
                    if let Some(tx) = &self.events {
                        events::emit(tx, SessionEvent::ResultPublished { generation, sequence });
                    }
                }
            }
            Err(error) => {
                let applied = self
                    .store
                    .publish(generation, sequence, Publication::Failure(error.clone()));
                if applied {
                    tracing::warn!(generation, sequence, error = %error, "analysis request failed");
                    if let Some(tx) = &self.events {
                        events::emit(tx, SessionEvent::RequestFailed { generation, error });
                    }
                } else {
                    tracing::debug!(generation, error = %error, "stale request failed");
                }
            }
        }

        let mut shared = lock(&self.shared);
        if shared.generation == generation && shared.state == SchedulerState::AwaitingResponse {
            shared.state = self.armed_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, ConfidenceScale, DetectedFace};
    use lookout_hw::surface::{self, SurfaceWriter};
    use lookout_hw::Frame;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    /// Fake backend: fixed (or per-call) latency, tracks concurrency.
    struct FakeClient {
        latencies: Vec<Duration>,
        fail: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeClient {
        fn new(latency: Duration) -> Self {
            Self::with_latencies(vec![latency])
        }

        fn with_latencies(latencies: Vec<Duration>) -> Self {
            Self {
                latencies,
                fail: false,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InferenceClient for FakeClient {
        fn submit(
            &self,
            _request: AnalysisRequest,
        ) -> impl Future<Output = Result<AnalysisResult, RequestError>> + Send {
            async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);

                let latency = self.latencies[call.min(self.latencies.len() - 1)];
                sleep(latency).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.fail {
                    return Err(RequestError::Http {
                        status: 500,
                        message: "backend down".into(),
                    });
                }
                Ok(AnalysisResult::Identify {
                    faces: vec![DetectedFace {
                        name: format!("call{call}"),
                        confidence: 95.0,
                        scale: ConfidenceScale::Percent,
                        bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
                        distance: None,
                    }],
                })
            }
        }
    }

    fn live_surface() -> (SurfaceWriter, VideoSurface) {
        let (writer, surface) = surface::channel();
        writer.publish(Frame::new(vec![90; 8 * 6 * 3], 8, 6, 0).unwrap());
        (writer, surface)
    }

    fn latest_name(store: &ResultStore) -> Option<String> {
        store.latest().map(|r| r.faces()[0].name.clone())
    }

    fn scheduler(client: &Arc<FakeClient>, store: &ResultStore) -> AnalysisScheduler<FakeClient> {
        AnalysisScheduler::new(client.clone(), store.clone(), FrameEncoder::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_two_submissions_in_three_seconds() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(1500)));
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::from_millis(1000));
        sleep(Duration::from_millis(3000)).await;

        // t=0 submits; t=1000 is skipped (busy until 1500); t=2000 submits.
        assert_eq!(client.calls(), 2);
        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_on_busy_never_overlaps() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(5000)));
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::from_millis(100));
        sleep(Duration::from_millis(4900)).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(sched.state(), SchedulerState::AwaitingResponse);

        // Second request lands on the first tick after t=5000.
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(client.calls(), 2);
        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_surface_never_submits() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(10)));
        let store = ResultStore::new();
        let (_writer, surface) = surface::channel();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::from_millis(1000));
        sleep(Duration::from_millis(3500)).await;

        assert_eq!(client.calls(), 0);
        assert!(matches!(sched.state(), SchedulerState::Armed { .. }));
        assert!(store.latest().is_none());
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_published_and_state_rearmed() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(200)));
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::from_millis(1000));
        sleep(Duration::from_millis(500)).await;

        assert_eq!(latest_name(&store).as_deref(), Some("call0"));
        assert_eq!(
            sched.state(),
            SchedulerState::Armed {
                interval: Duration::from_millis(1000),
                kind: AnalysisRequestKind::Identify,
            }
        );
        sched.shutdown().await;
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_response_discarded() {
        // Generation 1's request takes 2s; generation 2's take 100ms.
        let client = Arc::new(FakeClient::with_latencies(vec![
            Duration::from_millis(2000),
            Duration::from_millis(100),
        ]));
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        let g1 = sched.start(surface.clone(), AnalysisMode::Identify, Duration::from_millis(1000));
        sleep(Duration::from_millis(500)).await;
        let g2 = sched.start(surface, AnalysisMode::GroupAnalyze, Duration::from_millis(1000));
        assert!(g2 > g1);

        sleep(Duration::from_millis(2000)).await;
        // call0 (generation 1) settled at t=2000 but must not overwrite.
        assert_eq!(latest_name(&store).as_deref(), Some("call2"));
        assert_eq!(store.active_generation(), Some(g2));
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_and_halts_timer() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(800)));
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::from_millis(1000));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(client.calls(), 1);

        sched.stop();
        assert!(!sched.is_running());
        sleep(Duration::from_millis(5000)).await;

        assert_eq!(client.calls(), 1);
        assert!(store.latest().is_none());
        assert_eq!(store.active_generation(), None);
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reported_and_scheduler_keeps_running() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(50)).failing());
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let (tx, mut rx) = mpsc::channel(16);
        let mut sched = scheduler(&client, &store).with_events(tx);

        let generation = sched.start(surface, AnalysisMode::Identify, Duration::from_millis(1000));
        sleep(Duration::from_millis(2500)).await;

        assert_eq!(client.calls(), 3);
        assert!(store.latest().is_none());
        assert!(matches!(store.last_error(), Some(RequestError::Http { status: 500, .. })));
        assert!(sched.is_running());

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            SessionEvent::RequestFailed {
                generation,
                error: RequestError::Http {
                    status: 500,
                    message: "backend down".into(),
                },
            }
        );
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_clamped() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(5)));
        let store = ResultStore::new();
        let (_writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::ZERO);
        assert_eq!(
            sched.state(),
            SchedulerState::Armed {
                interval: MIN_TICK_INTERVAL,
                kind: AnalysisRequestKind::Identify,
            }
        );
        sleep(Duration::from_millis(50)).await;

        assert!(sched.is_running());
        assert!(client.calls() >= 2);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_close_halts_ticks() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(10)));
        let store = ResultStore::new();
        let (writer, surface) = live_surface();
        let mut sched = scheduler(&client, &store);

        sched.start(surface, AnalysisMode::Identify, Duration::from_millis(100));
        sleep(Duration::from_millis(250)).await;
        assert_eq!(client.calls(), 3);

        writer.fail(lookout_hw::CameraError::DeviceUnavailable("unplugged".into()));
        drop(writer);
        sleep(Duration::from_millis(1000)).await;

        assert_eq!(client.calls(), 3);
        assert!(!sched.is_running());
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_is_noop() {
        let client = Arc::new(FakeClient::new(Duration::from_millis(10)));
        let store = ResultStore::new();
        let mut sched = scheduler(&client, &store);
        sched.stop();
        sched.stop();
        assert_eq!(sched.state(), SchedulerState::Idle);
        assert_eq!(sched.generation(), None);
    }
}
