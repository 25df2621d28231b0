/**
 * OCCURRENCE TRACKER - Machine à états ACTIVE / RESOLVED par définition
 *
 * - Front montant sur un bit mappé  -> activate (no-op si déjà ACTIVE)
 * - Front descendant sur un bit mappé -> resolve_active (no-op si rien d'ouvert)
 * - Bit non mappé -> ignoré (debug)
 *
 * Les erreurs du store sont journalisées et comptées, jamais propagées :
 * une transition perdue ne doit pas couper l'ingestion.
 */

use crate::health::HealthTracker;
use crate::mapping::DefinitionMap;
use crate::models::BitTransition;
use crate::store::{Activation, FaultStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Unmapped,
    Opened { definition_id: i64, occurrence_id: i64 },
    AlreadyActive { definition_id: i64 },
    Resolved { definition_id: i64, count: usize },
    NothingToResolve { definition_id: i64 },
    Failed { definition_id: i64 },
}

#[derive(Clone)]
pub struct OccurrenceTracker {
    definitions: Arc<DefinitionMap>,
    store: Arc<dyn FaultStore>,
    health: HealthTracker,
}

impl OccurrenceTracker {
    pub fn new(definitions: Arc<DefinitionMap>, store: Arc<dyn FaultStore>, health: HealthTracker) -> Self {
        Self { definitions, store, health }
    }

    pub fn apply(&self, transition: &BitTransition) -> TrackOutcome {
        let Some(def) = self.definitions.lookup(transition.word, transition.bit) else {
            tracing::debug!(position = %transition.key(), rising = transition.is_rising(), "unmapped bit transition");
            return TrackOutcome::Unmapped;
        };
        let definition_id = def.id;

        if transition.is_rising() {
            match self.store.activate(definition_id, transition.at) {
                Ok(Activation::Created(occurrence_id)) => {
                    self.health.occurrence_opened();
                    tracing::info!(
                        code = %def.code,
                        kind = %def.kind,
                        sector = %def.sector_code,
                        position = %transition.key(),
                        occurrence_id,
                        "occurrence opened"
                    );
                    TrackOutcome::Opened { definition_id, occurrence_id }
                }
                Ok(Activation::AlreadyActive) => {
                    tracing::debug!(code = %def.code, "occurrence already active");
                    TrackOutcome::AlreadyActive { definition_id }
                }
                Err(e) => {
                    self.health.store_error();
                    tracing::error!(code = %def.code, error = %e, "failed to open occurrence");
                    TrackOutcome::Failed { definition_id }
                }
            }
        } else {
            match self.store.resolve_active(definition_id, transition.at) {
                Ok(0) => {
                    tracing::debug!(code = %def.code, "no active occurrence to resolve");
                    TrackOutcome::NothingToResolve { definition_id }
                }
                Ok(count) => {
                    self.health.occurrences_resolved(count);
                    tracing::info!(code = %def.code, position = %transition.key(), count, "occurrence resolved");
                    TrackOutcome::Resolved { definition_id, count }
                }
                Err(e) => {
                    self.health.store_error();
                    tracing::error!(code = %def.code, error = %e, "failed to resolve occurrence");
                    TrackOutcome::Failed { definition_id }
                }
            }
        }
    }

    /// Applique les transitions dans l'ordre reçu
    pub fn apply_all(&self, transitions: &[BitTransition]) -> Vec<TrackOutcome> {
        transitions.iter().map(|t| self.apply(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DefinitionSource;
    use crate::models::{FaultDefinition, Occurrence, OccurrenceStatus, ResolvedBy, WordAddress};
    use crate::store::{LockInfo, MemoryStore, OccurrenceQuery, StoreError, StoreInfo};
    use std::net::SocketAddr;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn definition(id: i64, word: WordAddress, bit: u8) -> FaultDefinition {
        FaultDefinition {
            id,
            word,
            bit,
            code: format!("F{id}"),
            kind: "FALHA_OPERACIONAL".into(),
            description: "teste".into(),
            priority: "ALTA".into(),
            message_class: None,
            sector_code: "ENCHIMENTO".into(),
            sector_name: "Enchimento".into(),
            lock_code: "ECL01".into(),
            lock_name: None,
            active: true,
        }
    }

    fn edge(word: WordAddress, bit: u8, old: bool, new: bool, at: OffsetDateTime) -> BitTransition {
        let source: SocketAddr = "10.0.0.5:50200".parse().unwrap();
        BitTransition { word, bit, old, new, at, source }
    }

    fn tracker_with(store: Arc<MemoryStore>) -> OccurrenceTracker {
        let map = DefinitionMap::from_definitions(DefinitionSource::Store, vec![definition(1, 0, 0), definition(2, 0, 1)]).unwrap();
        OccurrenceTracker::new(Arc::new(map), store, HealthTracker::new())
    }

    #[test]
    fn test_rising_then_falling_edge() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(Arc::clone(&store));
        let t0 = datetime!(2024-02-01 10:00 UTC);
        let t1 = datetime!(2024-02-01 10:03 UTC);

        assert_eq!(tracker.apply(&edge(0, 1, false, true, t0)), TrackOutcome::Opened { definition_id: 2, occurrence_id: 1 });
        assert_eq!(tracker.apply(&edge(0, 1, false, true, t0)), TrackOutcome::AlreadyActive { definition_id: 2 });
        assert_eq!(tracker.apply(&edge(0, 1, true, false, t1)), TrackOutcome::Resolved { definition_id: 2, count: 1 });

        let history = store.history_for(2);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].started_at, t0);
        assert_eq!(history[0].ended_at, Some(t1));
        assert_eq!(history[0].resolved_by, Some(ResolvedBy::Plc));
    }

    #[test]
    fn test_falling_edge_without_active_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(Arc::clone(&store));
        let t0 = datetime!(2024-02-01 10:00 UTC);

        assert_eq!(tracker.apply(&edge(0, 0, true, false, t0)), TrackOutcome::NothingToResolve { definition_id: 1 });
        assert_eq!(store.occurrence_count(), 0);
    }

    #[test]
    fn test_unmapped_bit_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(Arc::clone(&store));
        let t0 = datetime!(2024-02-01 10:00 UTC);

        assert_eq!(tracker.apply(&edge(9, 4, false, true, t0)), TrackOutcome::Unmapped);
        assert_eq!(store.occurrence_count(), 0);
    }

    #[test]
    fn test_apply_all_keeps_order() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(Arc::clone(&store));
        let t0 = datetime!(2024-02-01 10:00 UTC);

        let outcomes = tracker.apply_all(&[edge(0, 0, false, true, t0), edge(0, 0, true, false, t0), edge(0, 0, false, true, t0)]);
        assert!(matches!(outcomes[0], TrackOutcome::Opened { .. }));
        assert!(matches!(outcomes[1], TrackOutcome::Resolved { count: 1, .. }));
        assert!(matches!(outcomes[2], TrackOutcome::Opened { occurrence_id: 2, .. }));

        let active = store.occurrences(&OccurrenceQuery::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, OccurrenceStatus::Active);
    }

    struct FailingStore;

    impl FaultStore for FailingStore {
        fn load_definitions(&self) -> Result<Vec<FaultDefinition>, StoreError> {
            Ok(Vec::new())
        }
        fn upsert_definitions(&self, _: &[FaultDefinition]) -> Result<usize, StoreError> {
            Ok(0)
        }
        fn activate(&self, _: i64, _: OffsetDateTime) -> Result<Activation, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
        fn resolve_active(&self, _: i64, _: OffsetDateTime) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
        fn resolve_occurrence(&self, _: i64, _: OffsetDateTime) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn occurrences(&self, _: &OccurrenceQuery) -> Result<Vec<Occurrence>, StoreError> {
            Ok(Vec::new())
        }
        fn locks(&self) -> Result<Vec<LockInfo>, StoreError> {
            Ok(Vec::new())
        }
        fn info(&self) -> StoreInfo {
            StoreInfo { backend: "failing".into(), location: None }
        }
    }

    #[test]
    fn test_store_failure_is_swallowed_and_counted() {
        let map = DefinitionMap::legacy();
        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(map), Arc::new(FailingStore), health.clone());
        let t0 = datetime!(2024-02-01 10:00 UTC);

        assert_eq!(tracker.apply(&edge(10, 0, false, true, t0)), TrackOutcome::Failed { definition_id: 9007 });
        assert_eq!(tracker.apply(&edge(10, 0, true, false, t0)), TrackOutcome::Failed { definition_id: 9007 });

        let snapshot = health.get_health(0, DefinitionSource::LegacyStatic, StoreInfo { backend: "failing".into(), location: None });
        assert_eq!(snapshot.store_errors, 2);
    }
}
