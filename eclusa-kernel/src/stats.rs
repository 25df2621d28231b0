/**
 * STATISTIQUES DASHBOARD - Agrégats calculés à la volée
 *
 * Fonctions pures sur (occurrences, carte des définitions, maintenant) :
 * rien n'est stocké, l'API recalcule à chaque appel.
 * Une occurrence dont la définition n'est plus dans la carte compte dans les
 * totaux mais tombe dans le secteur UNKNOWN.
 */

use crate::mapping::DefinitionMap;
use crate::models::{FaultDefinition, Occurrence};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use time::{Duration, OffsetDateTime};

const UNKNOWN: &str = "UNKNOWN";
const TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequentDefinition {
    pub definition_id: i64,
    pub code: Option<String>,
    pub description: Option<String>,
    pub sector_code: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub active: usize,
    pub faults_last_24h: usize,
    pub events_last_24h: usize,
    pub total: usize,
    pub by_sector: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub top_definitions: Vec<FrequentDefinition>,
    pub mean_resolution_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorStats {
    pub code: String,
    pub name: String,
    pub active: usize,
    pub total: usize,
    pub mean_resolution_hours: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_occurrence: Option<OffsetDateTime>,
}

fn hours(d: Duration) -> f64 {
    d.as_seconds_f64() / 3600.0
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Durées des occurrences résolues, en heures
fn resolution_hours<'a>(occurrences: impl Iterator<Item = &'a Occurrence>) -> Vec<f64> {
    occurrences.filter_map(|o| o.ended_at.map(|end| hours(end - o.started_at))).collect()
}

pub fn dashboard(occurrences: &[Occurrence], definitions: &DefinitionMap, now: OffsetDateTime) -> DashboardStats {
    let since = now - Duration::hours(24);
    let mut stats = DashboardStats {
        active: 0,
        faults_last_24h: 0,
        events_last_24h: 0,
        total: occurrences.len(),
        by_sector: BTreeMap::new(),
        by_priority: BTreeMap::new(),
        top_definitions: Vec::new(),
        mean_resolution_hours: mean(&resolution_hours(occurrences.iter())),
    };
    let mut frequency: HashMap<i64, usize> = HashMap::new();

    for occ in occurrences {
        let def = definitions.by_id(occ.definition_id);
        if occ.is_active() {
            stats.active += 1;
        }
        if occ.started_at >= since {
            match def.map(|d| d.kind.as_str()) {
                Some(kind) if kind.starts_with("FALHA") => stats.faults_last_24h += 1,
                Some(kind) if kind.starts_with("EVENTO") => stats.events_last_24h += 1,
                _ => {}
            }
        }
        let sector = def.map_or(UNKNOWN, |d| d.sector_code.as_str());
        *stats.by_sector.entry(sector.to_string()).or_default() += 1;
        let priority = def.map_or(UNKNOWN, |d| d.priority.as_str());
        *stats.by_priority.entry(priority.to_string()).or_default() += 1;
        *frequency.entry(occ.definition_id).or_default() += 1;
    }

    let mut ranked: Vec<(i64, usize)> = frequency.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    stats.top_definitions = ranked
        .into_iter()
        .take(TOP_N)
        .map(|(definition_id, count)| {
            let def: Option<&FaultDefinition> = definitions.by_id(definition_id);
            FrequentDefinition {
                definition_id,
                code: def.map(|d| d.code.clone()),
                description: def.map(|d| d.description.clone()),
                sector_code: def.map(|d| d.sector_code.clone()),
                count,
            }
        })
        .collect();

    stats
}

/// Une ligne par secteur connu de la carte, plus UNKNOWN si nécessaire
pub fn sector_stats(occurrences: &[Occurrence], definitions: &DefinitionMap) -> Vec<SectorStats> {
    let mut grouped: BTreeMap<String, Vec<&Occurrence>> = definitions
        .sectors()
        .into_iter()
        .map(|s| (s.code, Vec::new()))
        .collect();
    for occ in occurrences {
        let sector = definitions.by_id(occ.definition_id).map_or(UNKNOWN, |d| d.sector_code.as_str());
        grouped.entry(sector.to_string()).or_default().push(occ);
    }

    let names: HashMap<String, String> = definitions.sectors().into_iter().map(|s| (s.code, s.name)).collect();

    grouped
        .into_iter()
        .map(|(code, occs)| SectorStats {
            name: names.get(&code).cloned().unwrap_or_else(|| code.clone()),
            active: occs.iter().filter(|o| o.is_active()).count(),
            total: occs.len(),
            mean_resolution_hours: mean(&resolution_hours(occs.iter().copied())),
            last_occurrence: occs.iter().map(|o| o.started_at).max(),
            code,
        })
        .collect()
}
