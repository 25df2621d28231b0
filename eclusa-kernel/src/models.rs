/**
 * MODÈLES ECLUSA - Types partagés par tout le pipeline d'ingestion
 *
 * RÔLE : Échantillons de WORD, définitions de falhas/eventos, transitions de
 * bits et occurrences persistées. Aucun comportement métier ici, seulement les
 * données et leurs petites conversions.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use time::OffsetDateTime;

/// Adresse d'une WORD dans la trame PLC (index depuis le début de la lecture)
pub type WordAddress = u32;

/// Nombre de bits dans une WORD
pub const WORD_BITS: u8 = 16;

/// Une WORD décodée d'une lecture TCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordSample {
    pub address: WordAddress,
    pub value: u16,
    pub captured_at: OffsetDateTime,
    /// Connexion d'origine (adresse distante du PLC)
    pub source: SocketAddr,
}

/// Position d'un bit : clé unique d'une définition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BitKey {
    pub word: WordAddress,
    pub bit: u8,
}

impl BitKey {
    pub fn new(word: WordAddress, bit: u8) -> Self {
        Self { word, bit }
    }
}

impl fmt::Display for BitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}.{}", self.word, self.bit)
    }
}

fn default_active() -> bool {
    true
}

/// Définition d'une falha ou d'un evento : ce que signifie un bit donné
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDefinition {
    pub id: i64,
    pub word: WordAddress,
    pub bit: u8,
    pub code: String,
    /// FALHA_CRITICA, FALHA_OPERACIONAL, EVENTO_SISTEMA, ALARME_PROCESSO...
    pub kind: String,
    pub description: String,
    pub priority: String,
    #[serde(default)]
    pub message_class: Option<String>,
    pub sector_code: String,
    pub sector_name: String,
    pub lock_code: String,
    #[serde(default)]
    pub lock_name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl FaultDefinition {
    pub fn key(&self) -> BitKey {
        BitKey::new(self.word, self.bit)
    }

    /// Les codes de type commençant par FALHA sont des défauts, le reste des événements
    pub fn is_fault(&self) -> bool {
        self.kind.starts_with("FALHA")
    }
}

/// Front montant ou descendant sur un bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTransition {
    pub word: WordAddress,
    pub bit: u8,
    pub old: bool,
    pub new: bool,
    pub at: OffsetDateTime,
    pub source: SocketAddr,
}

impl BitTransition {
    pub fn key(&self) -> BitKey {
        BitKey::new(self.word, self.bit)
    }

    pub fn is_rising(&self) -> bool {
        !self.old && self.new
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccurrenceStatus {
    Active,
    Resolved,
}

impl OccurrenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceStatus::Active => "ACTIVE",
            OccurrenceStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for OccurrenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(OccurrenceStatus::Active),
            "RESOLVED" => Ok(OccurrenceStatus::Resolved),
            other => Err(format!("unknown occurrence status: {other}")),
        }
    }
}

/// Qui a fermé l'occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolvedBy {
    Plc,
    Manual,
}

impl ResolvedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedBy::Plc => "PLC",
            ResolvedBy::Manual => "MANUAL",
        }
    }
}

impl FromStr for ResolvedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLC" => Ok(ResolvedBy::Plc),
            "MANUAL" => Ok(ResolvedBy::Manual),
            other => Err(format!("unknown resolution source: {other}")),
        }
    }
}

/// Intervalle actif d'une falha, tel que persisté
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: i64,
    pub definition_id: i64,
    pub status: OccurrenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Présent si et seulement si RESOLVED
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub resolved_by: Option<ResolvedBy>,
}

impl Occurrence {
    pub fn is_active(&self) -> bool {
        self.status == OccurrenceStatus::Active
    }

    /// Durée de l'occurrence ; une occurrence ouverte court jusqu'à `now`
    pub fn duration(&self, now: OffsetDateTime) -> time::Duration {
        self.ended_at.unwrap_or(now) - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_status_round_trip_through_str() {
        assert_eq!("ACTIVE".parse::<OccurrenceStatus>().unwrap(), OccurrenceStatus::Active);
        assert_eq!("resolved".parse::<OccurrenceStatus>().unwrap(), OccurrenceStatus::Resolved);
        assert!("ATIVO".parse::<OccurrenceStatus>().is_err());
        assert_eq!(OccurrenceStatus::Resolved.as_str(), "RESOLVED");
    }

    #[test]
    fn test_open_occurrence_duration_runs_until_now() {
        let occ = Occurrence {
            id: 1,
            definition_id: 7,
            status: OccurrenceStatus::Active,
            started_at: datetime!(2024-05-01 10:00 UTC),
            ended_at: None,
            resolved_by: None,
        };
        let now = datetime!(2024-05-01 12:30 UTC);
        assert_eq!(occ.duration(now), time::Duration::minutes(150));
    }

    #[test]
    fn test_definition_yaml_defaults() {
        let yaml = r#"
id: 3
word: 2
bit: 1
code: PJ_FECHADA
kind: EVENTO_SISTEMA
description: Porta jusante fechada
priority: BAIXA
sector_code: PORTA_JUSANTE
sector_name: Porta Jusante
lock_code: ECL01
"#;
        let def: FaultDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.active);
        assert_eq!(def.key(), BitKey::new(2, 1));
        assert!(!def.is_fault());
        assert_eq!(def.message_class, None);
    }
}
