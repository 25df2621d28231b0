//! Store en mémoire : définitions + occurrences derrière un seul verrou.
//! Sert aux tests, au devkit et au mode `backend: memory`.

use super::{Activation, FaultStore, LockInfo, OccurrenceQuery, StoreError, StoreInfo};
use crate::models::{FaultDefinition, Occurrence, OccurrenceStatus, ResolvedBy};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

#[derive(Debug, Default)]
struct Inner {
    definitions: Vec<FaultDefinition>,
    occurrences: Vec<Occurrence>,
    next_id: i64,
}

/// Plus récent d'abord (id décroissant à égalité), puis offset / limit
fn paginate(mut rows: Vec<Occurrence>, query: &OccurrenceQuery) -> Vec<Occurrence> {
    rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
    let rows = rows.into_iter().skip(query.offset.unwrap_or(0));
    match query.limit {
        Some(limit) => rows.take(limit).collect(),
        None => rows.collect(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(definitions: Vec<FaultDefinition>) -> Self {
        let store = Self::new();
        store.inner.lock().definitions = definitions;
        store
    }

    /// Occurrences ACTIVE d'une définition (normalement 0 ou 1)
    pub fn active_for(&self, definition_id: i64) -> Vec<Occurrence> {
        self.inner
            .lock()
            .occurrences
            .iter()
            .filter(|o| o.definition_id == definition_id && o.is_active())
            .cloned()
            .collect()
    }

    /// Historique complet d'une définition, ordre d'insertion
    pub fn history_for(&self, definition_id: i64) -> Vec<Occurrence> {
        self.inner
            .lock()
            .occurrences
            .iter()
            .filter(|o| o.definition_id == definition_id)
            .cloned()
            .collect()
    }

    pub fn occurrence_count(&self) -> usize {
        self.inner.lock().occurrences.len()
    }
}

impl FaultStore for MemoryStore {
    fn load_definitions(&self) -> Result<Vec<FaultDefinition>, StoreError> {
        let mut defs: Vec<FaultDefinition> =
            self.inner.lock().definitions.iter().filter(|d| d.active).cloned().collect();
        defs.sort_by_key(|d| d.key());
        Ok(defs)
    }

    fn upsert_definitions(&self, definitions: &[FaultDefinition]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        for def in definitions {
            match inner.definitions.iter_mut().find(|d| d.id == def.id) {
                Some(existing) => *existing = def.clone(),
                None => inner.definitions.push(def.clone()),
            }
        }
        Ok(definitions.len())
    }

    fn activate(&self, definition_id: i64, at: OffsetDateTime) -> Result<Activation, StoreError> {
        let mut inner = self.inner.lock();
        if inner.occurrences.iter().any(|o| o.definition_id == definition_id && o.is_active()) {
            return Ok(Activation::AlreadyActive);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.occurrences.push(Occurrence {
            id,
            definition_id,
            status: OccurrenceStatus::Active,
            started_at: at,
            ended_at: None,
            resolved_by: None,
        });
        Ok(Activation::Created(id))
    }

    fn resolve_active(&self, definition_id: i64, at: OffsetDateTime) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for occ in inner.occurrences.iter_mut().filter(|o| o.definition_id == definition_id && o.is_active()) {
            occ.status = OccurrenceStatus::Resolved;
            occ.ended_at = Some(at);
            occ.resolved_by = Some(ResolvedBy::Plc);
            count += 1;
        }
        Ok(count)
    }

    fn resolve_occurrence(&self, occurrence_id: i64, at: OffsetDateTime) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.occurrences.iter_mut().find(|o| o.id == occurrence_id && o.is_active()) {
            Some(occ) => {
                occ.status = OccurrenceStatus::Resolved;
                occ.ended_at = Some(at);
                occ.resolved_by = Some(ResolvedBy::Manual);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn occurrences(&self, query: &OccurrenceQuery) -> Result<Vec<Occurrence>, StoreError> {
        let rows = self.inner.lock().occurrences.iter().filter(|o| query.matches(o)).cloned().collect();
        Ok(paginate(rows, query))
    }

    fn locks(&self) -> Result<Vec<LockInfo>, StoreError> {
        let inner = self.inner.lock();
        let mut locks: BTreeMap<&str, (Option<String>, BTreeSet<&str>)> = BTreeMap::new();
        for def in &inner.definitions {
            let entry = locks.entry(def.lock_code.as_str()).or_default();
            if entry.0.is_none() {
                entry.0 = def.lock_name.clone();
            }
            entry.1.insert(def.sector_code.as_str());
        }
        Ok(locks
            .into_iter()
            .map(|(code, (name, sectors))| LockInfo { code: code.to_string(), name, sectors: sectors.len() })
            .collect())
    }

    fn info(&self) -> StoreInfo {
        StoreInfo { backend: "memory".into(), location: None }
    }
}
