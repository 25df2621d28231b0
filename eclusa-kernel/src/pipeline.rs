/**
 * PIPELINE D'INGESTION - Decoder -> Detector -> file ordonnée -> Tracker
 *
 * FONCTIONNEMENT :
 * - decode_frame hors de tout verrou (pur)
 * - sous le verrou d'ingestion : détection + mise en file des transitions
 *   de la trame, donc l'ordre de persistance suit l'ordre de détection
 * - un worker unique (thread bloquant) vide la file et appelle le tracker
 * - une transition dont l'appel store échoue est rejouée sur place
 *   (max_retries, backoff linéaire) avant de passer à la suivante
 *
 * La file est bornée : si le store est lent, les lectures TCP finissent par
 * attendre ici (back-pressure), sans jamais réordonner les transitions.
 */

use crate::config::PipelineConf;
use crate::decoder::{decode_frame, has_trailing_byte};
use crate::detector::BitChangeDetector;
use crate::health::HealthTracker;
use crate::models::BitTransition;
use crate::tracker::{OccurrenceTracker, TrackOutcome};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

enum Job {
    Transitions(Vec<BitTransition>),
    Flush(oneshot::Sender<()>),
}

/// Résumé d'une trame ingérée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub words: usize,
    pub transitions: usize,
    /// Faux si le pipeline est fermé : rien n'a été mis en file
    pub queued: bool,
}

/// Plafond d'attente entre deux tentatives, quelle que soit la config
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// Backoff linéaire, saturé à MAX_RETRY_DELAY
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.checked_mul(attempt).map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
    }
}

/// Applique une transition, rejouée tant que le store échoue et que le budget le permet
fn persist(tracker: &OccurrenceTracker, transition: &BitTransition, retry: RetryPolicy) -> TrackOutcome {
    let mut attempt = 0;
    loop {
        let outcome = tracker.apply(transition);
        if !matches!(outcome, TrackOutcome::Failed { .. }) {
            return outcome;
        }
        if attempt >= retry.max_retries {
            tracing::error!(position = %transition.key(), attempts = attempt + 1, "transition abandoned after store failures");
            return outcome;
        }
        attempt += 1;
        std::thread::sleep(retry.delay(attempt));
    }
}

pub struct Pipeline {
    detector: Arc<BitChangeDetector>,
    health: HealthTracker,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Démarre le worker de persistance ; doit être appelé dans un runtime tokio
    pub fn start(
        detector: Arc<BitChangeDetector>,
        tracker: OccurrenceTracker,
        health: HealthTracker,
        config: &PipelineConf,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let retry = RetryPolicy { max_retries: config.max_retries, backoff: config.retry_backoff };

        let worker = tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                match job {
                    Job::Transitions(transitions) => {
                        for transition in &transitions {
                            persist(&tracker, transition, retry);
                        }
                    }
                    Job::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("persistence worker drained");
        });

        Self {
            detector,
            health,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn detector(&self) -> &Arc<BitChangeDetector> {
        &self.detector
    }

    pub async fn ingest(&self, frame: &[u8], captured_at: OffsetDateTime, source: SocketAddr) -> IngestReport {
        let samples = decode_frame(frame, captured_at, source);
        if has_trailing_byte(frame) {
            tracing::debug!(%source, len = frame.len(), "odd-length frame, trailing byte dropped");
        }

        let sender = self.sender.lock().await;
        let Some(tx) = sender.as_ref() else {
            return IngestReport { words: samples.len(), transitions: 0, queued: false };
        };

        let transitions = self.detector.observe(&samples);
        let count = transitions.len();
        self.health.transitions_detected(count);
        if count == 0 {
            return IngestReport { words: samples.len(), transitions: 0, queued: true };
        }

        tracing::debug!(%source, words = samples.len(), transitions = count, "frame detected");
        let queued = tx.send(Job::Transitions(transitions)).await.is_ok();
        if !queued {
            tracing::warn!(%source, "persistence worker gone, transitions dropped");
        }
        IngestReport { words: samples.len(), transitions: count, queued }
    }

    /// Attend que tout ce qui a été mis en file soit persisté
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let sender = self.sender.lock().await;
            let Some(tx) = sender.as_ref() else { return };
            if tx.send(Job::Flush(ack_tx)).await.is_err() {
                return;
            }
        }
        let _ = ack_rx.await;
    }

    /// Ferme la file, laisse le worker la vider puis le rejoint ; idempotent
    pub async fn close(&self) {
        self.sender.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "persistence worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DefinitionMap;
    use crate::models::{FaultDefinition, Occurrence};
    use crate::store::{Activation, FaultStore, LockInfo, MemoryStore, OccurrenceQuery, StoreError, StoreInfo};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conf(queue_capacity: usize) -> PipelineConf {
        PipelineConf { queue_capacity, max_retries: 2, retry_backoff: Duration::from_millis(1) }
    }

    fn setup(capacity: usize) -> (Pipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(DefinitionMap::legacy()), store.clone(), health.clone());
        let pipeline = Pipeline::start(Arc::new(BitChangeDetector::new()), tracker, health, &conf(capacity));
        (pipeline, store)
    }

    fn plc() -> SocketAddr {
        "192.168.0.10:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ingest_opens_and_resolves() {
        let (pipeline, store) = setup(8);
        let now = OffsetDateTime::now_utc();

        let r = pipeline.ingest(&[0x00, 0x00], now, plc()).await;
        assert_eq!(r, IngestReport { words: 1, transitions: 0, queued: true });

        let r = pipeline.ingest(&[0x00, 0x03], now, plc()).await;
        assert_eq!(r.transitions, 2);
        pipeline.flush().await;
        assert_eq!(store.active_for(9001).len(), 1);
        assert_eq!(store.active_for(9002).len(), 1);

        pipeline.ingest(&[0x00, 0x01], now, plc()).await;
        pipeline.flush().await;
        assert_eq!(store.active_for(9001).len(), 1);
        assert!(store.active_for(9002).is_empty());
        assert_eq!(store.history_for(9002).len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_follows_detection_order() {
        let (pipeline, store) = setup(1);
        let now = OffsetDateTime::now_utc();

        // bascules rapides du même bit avec une file minuscule
        for i in 0..21u8 {
            pipeline.ingest(&[0x00, i % 2], now, plc()).await;
        }
        pipeline.flush().await;

        let history = store.history_for(9001);
        assert_eq!(history.len(), 10);
        assert!(history.iter().all(|o| !o.is_active()));
    }

    #[tokio::test]
    async fn test_close_drains_queue() {
        let (pipeline, store) = setup(64);
        let now = OffsetDateTime::now_utc();

        pipeline.ingest(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01], now, plc()).await;
        pipeline.close().await;
        pipeline.close().await;

        assert_eq!(store.occurrences(&OccurrenceQuery::active()).unwrap().len(), 2);

        let r = pipeline.ingest(&[0x00, 0x00], now, plc()).await;
        assert!(!r.queued);
        pipeline.flush().await;
    }

    #[tokio::test]
    async fn test_odd_frame_still_processed() {
        let (pipeline, store) = setup(8);
        let r = pipeline.ingest(&[0x00, 0x01, 0xFF], OffsetDateTime::now_utc(), plc()).await;
        pipeline.flush().await;

        assert_eq!(r.words, 1);
        assert_eq!(store.active_for(9001).len(), 1);
    }

    /// Échoue sur les `failures` premiers appels d'écriture puis délègue
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn trip(&self) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            Ok(())
        }
    }

    impl FaultStore for FlakyStore {
        fn load_definitions(&self) -> Result<Vec<FaultDefinition>, StoreError> {
            self.inner.load_definitions()
        }
        fn upsert_definitions(&self, defs: &[FaultDefinition]) -> Result<usize, StoreError> {
            self.inner.upsert_definitions(defs)
        }
        fn activate(&self, id: i64, at: OffsetDateTime) -> Result<Activation, StoreError> {
            self.trip()?;
            self.inner.activate(id, at)
        }
        fn resolve_active(&self, id: i64, at: OffsetDateTime) -> Result<usize, StoreError> {
            self.trip()?;
            self.inner.resolve_active(id, at)
        }
        fn resolve_occurrence(&self, id: i64, at: OffsetDateTime) -> Result<bool, StoreError> {
            self.inner.resolve_occurrence(id, at)
        }
        fn occurrences(&self, query: &OccurrenceQuery) -> Result<Vec<Occurrence>, StoreError> {
            self.inner.occurrences(query)
        }
        fn locks(&self) -> Result<Vec<LockInfo>, StoreError> {
            self.inner.locks()
        }
        fn info(&self) -> StoreInfo {
            self.inner.info()
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_retried_in_order() {
        let store = Arc::new(FlakyStore { inner: MemoryStore::new(), failures: AtomicU32::new(2) });
        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(DefinitionMap::legacy()), store.clone(), health.clone());
        let pipeline = Pipeline::start(Arc::new(BitChangeDetector::new()), tracker, health, &conf(8));
        let now = OffsetDateTime::now_utc();

        pipeline.ingest(&[0x00, 0x01], now, plc()).await;
        pipeline.ingest(&[0x00, 0x00], now, plc()).await;
        pipeline.flush().await;

        let history = store.inner.history_for(9001);
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_active());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = Arc::new(FlakyStore { inner: MemoryStore::new(), failures: AtomicU32::new(3) });
        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(DefinitionMap::legacy()), store.clone(), health.clone());
        let pipeline = Pipeline::start(Arc::new(BitChangeDetector::new()), tracker, health, &conf(8));
        let now = OffsetDateTime::now_utc();

        // 3 échecs pour 1 + 2 tentatives : la montée est perdue, la suivante passe
        pipeline.ingest(&[0x00, 0x01], now, plc()).await;
        pipeline.ingest(&[0x00, 0x03], now, plc()).await;
        pipeline.flush().await;

        assert!(store.inner.active_for(9001).is_empty());
        assert_eq!(store.inner.active_for(9002).len(), 1);
    }

    #[test]
    fn test_retry_delay_saturates_instead_of_overflowing() {
        let linear = RetryPolicy { max_retries: 3, backoff: Duration::from_millis(200) };
        assert_eq!(linear.delay(1), Duration::from_millis(200));
        assert_eq!(linear.delay(3), Duration::from_millis(600));

        let huge = RetryPolicy { max_retries: u32::MAX, backoff: Duration::MAX };
        assert_eq!(huge.delay(2), MAX_RETRY_DELAY);
        assert_eq!(huge.delay(u32::MAX), MAX_RETRY_DELAY);

        let slow = RetryPolicy { max_retries: 10, backoff: Duration::from_secs(45) };
        assert_eq!(slow.delay(2), MAX_RETRY_DELAY);
    }
}
