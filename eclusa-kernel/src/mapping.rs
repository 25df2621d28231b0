/**
 * DEFINITION MAP - Index (word, bit) -> définition de falha/evento
 *
 * RÔLE : Construit une fois au démarrage depuis le store, puis partagé en
 * lecture seule (Arc) par le tracker et l'API REST.
 *
 * DÉGRADÉ : si le store ne répond pas, on bascule sur une table statique
 * héritée (quelques bits d'enchimento/esvaziamento/portas). Le mode est
 * explicite via `DefinitionSource` et exposé par /health.
 */

use crate::models::{BitKey, FaultDefinition, WordAddress, WORD_BITS};
use crate::store::FaultStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionSource {
    Store,
    LegacyStatic,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("definitions {first} and {second} share position {key}")]
    DuplicatePosition { key: BitKey, first: i64, second: i64 },
    #[error("definition {id} has bit index {bit} outside 0..=15")]
    BitOutOfRange { id: i64, bit: u8 },
    #[error("definition id {id} used at both {first} and {second}")]
    DuplicateId { id: i64, first: BitKey, second: BitKey },
}

/// Secteur tel que vu par l'API (dérivé des définitions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorSummary {
    pub code: String,
    pub name: String,
    pub lock_code: String,
    pub definitions: usize,
}

#[derive(Debug, Clone)]
pub struct DefinitionMap {
    source: DefinitionSource,
    by_key: BTreeMap<BitKey, FaultDefinition>,
    key_by_id: HashMap<i64, BitKey>,
}

impl DefinitionMap {
    /// Charge depuis le store ; table héritée si le chargement échoue
    pub fn load(store: &dyn FaultStore) -> Self {
        match store.load_definitions() {
            Ok(defs) => {
                let map = Self::lenient(DefinitionSource::Store, defs);
                tracing::info!(definitions = map.len(), "definition map loaded from store");
                map
            }
            Err(e) => {
                tracing::warn!(error = %e, "definition load failed, using legacy static table");
                Self::legacy()
            }
        }
    }

    /// Constructeur strict : toute ligne invalide est une erreur
    pub fn from_definitions(source: DefinitionSource, defs: Vec<FaultDefinition>) -> Result<Self, MappingError> {
        let mut map = Self::empty(source);
        for def in defs {
            map.insert(def)?;
        }
        Ok(map)
    }

    /// Table statique de compatibilité
    pub fn legacy() -> Self {
        Self::lenient(DefinitionSource::LegacyStatic, legacy_definitions())
    }

    fn empty(source: DefinitionSource) -> Self {
        Self { source, by_key: BTreeMap::new(), key_by_id: HashMap::new() }
    }

    fn lenient(source: DefinitionSource, defs: Vec<FaultDefinition>) -> Self {
        let mut map = Self::empty(source);
        for def in defs {
            if let Err(e) = map.insert(def) {
                tracing::warn!(error = %e, "skipping definition");
            }
        }
        map
    }

    fn insert(&mut self, def: FaultDefinition) -> Result<(), MappingError> {
        if def.bit >= WORD_BITS {
            return Err(MappingError::BitOutOfRange { id: def.id, bit: def.bit });
        }
        let key = def.key();
        if let Some(existing) = self.by_key.get(&key) {
            return Err(MappingError::DuplicatePosition { key, first: existing.id, second: def.id });
        }
        if let Some(first) = self.key_by_id.get(&def.id) {
            return Err(MappingError::DuplicateId { id: def.id, first: *first, second: key });
        }
        self.key_by_id.insert(def.id, key);
        self.by_key.insert(key, def);
        Ok(())
    }

    pub fn lookup(&self, word: WordAddress, bit: u8) -> Option<&FaultDefinition> {
        self.by_key.get(&BitKey::new(word, bit))
    }

    pub fn by_id(&self, id: i64) -> Option<&FaultDefinition> {
        self.key_by_id.get(&id).and_then(|k| self.by_key.get(k))
    }

    pub fn by_code(&self, code: &str) -> Option<&FaultDefinition> {
        self.by_key.values().find(|d| d.code == code)
    }

    pub fn by_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a FaultDefinition> + 'a {
        self.by_key.values().filter(move |d| d.kind == kind)
    }

    pub fn by_sector<'a>(&'a self, sector_code: &'a str) -> impl Iterator<Item = &'a FaultDefinition> + 'a {
        self.by_key.values().filter(move |d| d.sector_code == sector_code)
    }

    /// Secteurs distincts, triés par code
    pub fn sectors(&self) -> Vec<SectorSummary> {
        let mut sectors: BTreeMap<&str, SectorSummary> = BTreeMap::new();
        for def in self.by_key.values() {
            sectors
                .entry(def.sector_code.as_str())
                .or_insert_with(|| SectorSummary {
                    code: def.sector_code.clone(),
                    name: def.sector_name.clone(),
                    lock_code: def.lock_code.clone(),
                    definitions: 0,
                })
                .definitions += 1;
        }
        sectors.into_values().collect()
    }

    /// Parcours dans l'ordre (word, bit)
    pub fn iter(&self) -> impl Iterator<Item = &FaultDefinition> {
        self.by_key.values()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn source(&self) -> DefinitionSource {
        self.source
    }

    pub fn is_degraded(&self) -> bool {
        self.source == DefinitionSource::LegacyStatic
    }
}

fn legacy(id: i64, word: WordAddress, bit: u8, code: &str, kind: &str, description: &str, sector: (&str, &str)) -> FaultDefinition {
    FaultDefinition {
        id,
        word,
        bit,
        code: code.into(),
        kind: kind.into(),
        description: description.into(),
        priority: if kind.starts_with("FALHA") { "ALTA" } else { "MEDIA" }.into(),
        message_class: None,
        sector_code: sector.0.into(),
        sector_name: sector.1.into(),
        lock_code: "ECL01".into(),
        lock_name: None,
        active: true,
    }
}

fn legacy_definitions() -> Vec<FaultDefinition> {
    const ENCHIMENTO: (&str, &str) = ("ENCHIMENTO", "Enchimento");
    const ESVAZIAMENTO: (&str, &str) = ("ESVAZIAMENTO", "Esvaziamento");
    const JUSANTE: (&str, &str) = ("PORTA_JUSANTE", "Porta Jusante");
    const MONTANTE: (&str, &str) = ("PORTA_MONTANTE", "Porta Montante");

    vec![
        legacy(9001, 0, 0, "ENCHIMENTO_VALVULA_01", "EVENTO_SISTEMA", "Valvula de enchimento 01 aberta", ENCHIMENTO),
        legacy(9002, 0, 1, "ENCHIMENTO_SENSOR_NIVEL", "EVENTO_SISTEMA", "Sensor de nivel de enchimento", ENCHIMENTO),
        legacy(9003, 1, 0, "ESVAZIAMENTO_VALVULA_01", "EVENTO_SISTEMA", "Valvula de esvaziamento 01 aberta", ESVAZIAMENTO),
        legacy(9004, 2, 0, "PORTA_JUSANTE_ABERTA", "EVENTO_SISTEMA", "Porta jusante aberta", JUSANTE),
        legacy(9005, 2, 1, "PORTA_JUSANTE_FECHADA", "EVENTO_SISTEMA", "Porta jusante fechada", JUSANTE),
        legacy(9006, 3, 0, "PORTA_MONTANTE_ABERTA", "EVENTO_SISTEMA", "Porta montante aberta", MONTANTE),
        legacy(9007, 10, 0, "FALHA_VALVULA_ENCHIMENTO", "FALHA_CRITICA", "Falha na valvula de enchimento", ENCHIMENTO),
        legacy(9008, 11, 0, "FALHA_VALVULA_ESVAZIAMENTO", "FALHA_CRITICA", "Falha na valvula de esvaziamento", ESVAZIAMENTO),
    ]
}
