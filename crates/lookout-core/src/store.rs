//! Result store: the latest analysis outcome, stamped with the scheduler
//! generation that produced it.
//!
//! Writes from any generation other than the active one are dropped, so a
//! response that outlives its scheduler can never overwrite a newer one.
//! The whole snapshot is replaced atomically; readers never see a partial
//! update.

use crate::client::RequestError;
use crate::types::AnalysisResult;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// What a settled request publishes.
#[derive(Debug, Clone)]
pub enum Publication {
    Result(AnalysisResult),
    Failure(RequestError),
}

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Generation allowed to write, `None` while no scheduler runs.
    pub generation: Option<u64>,
    /// Tick sequence of the last applied publication.
    pub sequence: u64,
    pub latest: Option<Arc<AnalysisResult>>,
    pub last_error: Option<RequestError>,
    pub updated_at: Option<Instant>,
}

/// Single-writer, multi-reader holder of the latest result.
#[derive(Clone)]
pub struct ResultStore {
    tx: Arc<watch::Sender<StoreSnapshot>>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StoreSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Hand write access to `generation`, clearing the previous result.
    pub fn activate(&self, generation: u64) {
        self.tx.send_modify(|s| {
            *s = StoreSnapshot {
                generation: Some(generation),
                ..StoreSnapshot::default()
            };
        });
    }

    /// Revoke write access from every generation and clear the result.
    pub fn deactivate(&self) {
        self.tx.send_modify(|s| *s = StoreSnapshot::default());
    }

    /// Apply a publication if `generation` is active and `sequence` is newer
    /// than the last applied one. Returns whether it was applied.
    pub fn publish(&self, generation: u64, sequence: u64, publication: Publication) -> bool {
        self.tx.send_if_modified(|s| {
            if s.generation != Some(generation) {
                tracing::debug!(
                    generation,
                    active = ?s.generation,
                    "discarding result from stale generation"
                );
                return false;
            }
            if sequence <= s.sequence {
                tracing::debug!(generation, sequence, last = s.sequence, "discarding out-of-order result");
                return false;
            }

            s.sequence = sequence;
            s.updated_at = Some(Instant::now());
            match publication {
                Publication::Result(result) => {
                    s.latest = Some(Arc::new(result));
                    s.last_error = None;
                }
                Publication::Failure(err) => {
                    s.latest = None;
                    s.last_error = Some(err);
                }
            }
            true
        })
    }

    pub fn latest(&self) -> Option<Arc<AnalysisResult>> {
        self.tx.borrow().latest.clone()
    }

    pub fn last_error(&self) -> Option<RequestError> {
        self.tx.borrow().last_error.clone()
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.tx.borrow().generation
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every applied change.
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, ConfidenceScale, DetectedFace};

    fn result(name: &str) -> AnalysisResult {
        AnalysisResult::Identify {
            faces: vec![DetectedFace {
                name: name.into(),
                confidence: 90.0,
                scale: ConfidenceScale::Percent,
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                distance: None,
            }],
        }
    }

    fn latest_name(store: &ResultStore) -> Option<String> {
        store.latest().map(|r| r.faces()[0].name.clone())
    }

    #[test]
    fn test_empty_store() {
        let store = ResultStore::new();
        assert!(store.latest().is_none());
        assert_eq!(store.active_generation(), None);
    }

    #[test]
    fn test_publish_requires_active_generation() {
        let store = ResultStore::new();
        assert!(!store.publish(1, 1, Publication::Result(result("alice"))));
        assert!(store.latest().is_none());

        store.activate(1);
        assert!(store.publish(1, 1, Publication::Result(result("alice"))));
        assert_eq!(latest_name(&store).as_deref(), Some("alice"));
    }

    #[test]
    fn test_stale_generation_rejected() {
        let store = ResultStore::new();
        store.activate(1);
        store.activate(2);
        assert!(store.publish(2, 1, Publication::Result(result("fresh"))));
        assert!(!store.publish(1, 5, Publication::Result(result("stale"))));
        assert_eq!(latest_name(&store).as_deref(), Some("fresh"));
    }

    #[test]
    fn test_out_of_order_sequence_rejected() {
        let store = ResultStore::new();
        store.activate(3);
        assert!(store.publish(3, 2, Publication::Result(result("second"))));
        assert!(!store.publish(3, 1, Publication::Result(result("first"))));
        assert_eq!(latest_name(&store).as_deref(), Some("second"));
    }

    #[test]
    fn test_failure_clears_result() {
        let store = ResultStore::new();
        store.activate(1);
        store.publish(1, 1, Publication::Result(result("alice")));
        store.publish(1, 2, Publication::Failure(RequestError::Network("down".into())));
        assert!(store.latest().is_none());
        assert_eq!(store.last_error(), Some(RequestError::Network("down".into())));

        store.publish(1, 3, Publication::Result(result("alice")));
        assert!(store.last_error().is_none());
    }

    #[test]
    fn test_deactivate_clears_and_blocks_writes() {
        let store = ResultStore::new();
        store.activate(1);
        store.publish(1, 1, Publication::Result(result("alice")));
        store.deactivate();
        assert!(store.latest().is_none());
        assert!(!store.publish(1, 2, Publication::Result(result("late"))));
        assert!(store.latest().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_applied_changes_only() {
        let store = ResultStore::new();
        let mut rx = store.subscribe();
        store.activate(1);
        rx.borrow_and_update();

        store.publish(2, 1, Publication::Result(result("stale")));
        assert!(!rx.has_changed().unwrap());

        store.publish(1, 1, Publication::Result(result("alice")));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_concurrent_writers_respect_generation() {
        let store = ResultStore::new();
        store.activate(7);
        let handles: Vec<_> = (0..8u64)
            .map(|g| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for seq in 1..50 {
                        store.publish(g, seq, Publication::Result(result(&format!("gen{g}"))));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(latest_name(&store).as_deref(), Some("gen7"));
        assert_eq!(store.snapshot().sequence, 49);
    }
}
