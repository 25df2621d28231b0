/**
 * FAULT STORE - Interface de persistance des définitions et occurrences
 *
 * RÔLE :
 * Ce module définit le contrat que le tracker et l'API REST utilisent pour
 * lire les définitions de falhas et écrire les occurrences.
 *
 * FONCTIONNEMENT :
 * - FaultStore trait = opérations communes (load, activate, resolve, query)
 * - SqliteStore = base relationnelle embarquée, schéma provisionné à l'ouverture
 * - MemoryStore = tout en mémoire, pour les tests et le devkit
 * - OccurrenceQuery = filtres + pagination, comme pour tous les lecteurs
 *
 * INVARIANT :
 * Au plus une occurrence ACTIVE par définition. `activate` est atomique :
 * c'est le store qui garantit l'invariant, pas la logique appelante.
 */

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{FaultDefinition, Occurrence, OccurrenceStatus};
use serde::Serialize;
use std::path::Path;
use time::OffsetDateTime;

/// Erreurs possibles sur le store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("seed file error: {0}")]
    Seed(#[from] serde_yaml::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Résultat d'une demande d'activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Nouvelle occurrence ACTIVE créée
    Created(i64),
    /// Une occurrence était déjà ACTIVE pour cette définition
    AlreadyActive,
}

/// Requête d'occurrences : filtres + pagination, résultats du plus récent au plus ancien
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceQuery {
    pub status: Option<OccurrenceStatus>,
    /// Restreint aux définitions listées (filtre secteur / type côté API)
    pub definition_ids: Option<Vec<i64>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Default for OccurrenceQuery {
    /// 100 résultats max par défaut
    fn default() -> Self {
        Self {
            status: None,
            definition_ids: None,
            limit: Some(100),
            offset: None,
        }
    }
}

impl OccurrenceQuery {
    /// Sans limite : pour les statistiques
    pub fn all() -> Self {
        Self { limit: None, ..Self::default() }
    }

    pub fn active() -> Self {
        Self { status: Some(OccurrenceStatus::Active), limit: None, ..Self::default() }
    }

    pub fn matches(&self, occurrence: &Occurrence) -> bool {
        if let Some(status) = self.status {
            if occurrence.status != status {
                return false;
            }
        }
        if let Some(ids) = &self.definition_ids {
            if !ids.contains(&occurrence.definition_id) {
                return false;
            }
        }
        true
    }
}

/// Description du backend, exposée par /health
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub backend: String,
    pub location: Option<String>,
}

/// Eclusa du référentiel et nombre de setores rattachés
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub code: String,
    pub name: Option<String>,
    pub sectors: usize,
}

pub trait FaultStore: Send + Sync {
    /// Définitions actives avec word/bit renseignés, triées par (word, bit)
    fn load_definitions(&self) -> Result<Vec<FaultDefinition>, StoreError>;

    /// Insère ou remplace des définitions (import du fichier seed)
    fn upsert_definitions(&self, definitions: &[FaultDefinition]) -> Result<usize, StoreError>;

    /// Ouvre une occurrence ACTIVE si aucune ne l'est déjà, de façon atomique
    fn activate(&self, definition_id: i64, at: OffsetDateTime) -> Result<Activation, StoreError>;

    /// Passe toutes les occurrences ACTIVE de la définition en RESOLVED ; retourne le nombre touché
    fn resolve_active(&self, definition_id: i64, at: OffsetDateTime) -> Result<usize, StoreError>;

    /// Résolution manuelle d'une occurrence précise ; faux si absente ou déjà résolue
    fn resolve_occurrence(&self, occurrence_id: i64, at: OffsetDateTime) -> Result<bool, StoreError>;

    /// Filtre, tri du plus récent au plus ancien puis pagination, côté backend
    fn occurrences(&self, query: &OccurrenceQuery) -> Result<Vec<Occurrence>, StoreError>;

    /// Eclusas connues, triées par code
    fn locks(&self) -> Result<Vec<LockInfo>, StoreError>;

    fn info(&self) -> StoreInfo;
}

/// Lit un fichier YAML de définitions (liste de FaultDefinition)
pub fn read_seed_file(path: impl AsRef<Path>) -> Result<Vec<FaultDefinition>, StoreError> {
    let txt = std::fs::read_to_string(path.as_ref())?;
    if txt.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(&txt)?)
}
