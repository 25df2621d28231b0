/**
 * SQLITE STORE - Persistance relationnelle embarquée
 *
 * SCHÉMA (provisionné à l'ouverture, idempotent) :
 * - locks / sectors : référentiel eclusa -> setores
 * - fault_definitions : une ligne par position (word_index, bit_index)
 * - occurrences : intervalles ACTIVE / RESOLVED
 *
 * L'unicité de l'occurrence ACTIVE est portée par un index unique partiel ;
 * `activate` fait un INSERT OR IGNORE et lit le nombre de lignes touchées.
 * Les horodatages sont stockés en RFC3339 UTC à largeur fixe (nanosecondes),
 * l'ordre du texte est donc l'ordre chronologique et ORDER BY started_at
 * profite de l'index.
 */

use super::{Activation, FaultStore, LockInfo, OccurrenceQuery, StoreError, StoreInfo};
use crate::models::{FaultDefinition, Occurrence, OccurrenceStatus, ResolvedBy};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS locks (
    code TEXT PRIMARY KEY,
    name TEXT
);

CREATE TABLE IF NOT EXISTS sectors (
    code      TEXT PRIMARY KEY,
    name      TEXT NOT NULL,
    lock_code TEXT NOT NULL REFERENCES locks(code)
);

CREATE TABLE IF NOT EXISTS fault_definitions (
    id            INTEGER PRIMARY KEY,
    word_index    INTEGER,
    bit_index     INTEGER,
    code          TEXT NOT NULL,
    kind          TEXT NOT NULL,
    description   TEXT NOT NULL,
    priority      TEXT NOT NULL,
    message_class TEXT,
    sector_code   TEXT NOT NULL REFERENCES sectors(code),
    active        INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS ix_fault_definitions_position
    ON fault_definitions(word_index, bit_index);

CREATE TABLE IF NOT EXISTS occurrences (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    definition_id INTEGER NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('ACTIVE', 'RESOLVED')),
    started_at    TEXT NOT NULL,
    ended_at      TEXT,
    resolved_by   TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_occurrences_single_active
    ON occurrences(definition_id) WHERE status = 'ACTIVE';

CREATE INDEX IF NOT EXISTS ix_occurrences_started_at
    ON occurrences(started_at);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: Option<PathBuf>,
}

impl SqliteStore {
    /// Ouvre (ou crée) la base et provisionne le schéma
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::provision(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::provision(Connection::open_in_memory()?, None)
    }

    fn provision(conn: Connection, location: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(location = ?location, "sqlite schema ready");
        Ok(Self { conn: Mutex::new(conn), location })
    }

    /// Une occurrence par id, quel que soit son statut
    pub fn occurrence(&self, occurrence_id: i64) -> Result<Option<Occurrence>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT id, definition_id, status, started_at, ended_at, resolved_by
                 FROM occurrences WHERE id = ?1",
                params![occurrence_id],
                RawOccurrence::from_row,
            )
            .optional()?;
        raw.map(RawOccurrence::into_occurrence).transpose()
    }
}

fn format_ts(at: OffsetDateTime) -> Result<String, StoreError> {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"))
        .map_err(|e| StoreError::Corrupt(format!("timestamp format: {e}")))
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

struct RawOccurrence {
    id: i64,
    definition_id: i64,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    resolved_by: Option<String>,
}

impl RawOccurrence {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            definition_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            resolved_by: row.get(5)?,
        })
    }

    fn into_occurrence(self) -> Result<Occurrence, StoreError> {
        let status = self.status.parse::<OccurrenceStatus>().map_err(StoreError::Corrupt)?;
        let resolved_by = self
            .resolved_by
            .as_deref()
            .map(str::parse::<ResolvedBy>)
            .transpose()
            .map_err(StoreError::Corrupt)?;
        Ok(Occurrence {
            id: self.id,
            definition_id: self.definition_id,
            status,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            resolved_by,
        })
    }
}

struct RawDefinition {
    id: i64,
    word: i64,
    bit: i64,
    code: String,
    kind: String,
    description: String,
    priority: String,
    message_class: Option<String>,
    sector_code: String,
    sector_name: String,
    lock_code: String,
    lock_name: Option<String>,
}

impl RawDefinition {
    fn into_definition(self) -> Result<FaultDefinition, StoreError> {
        let word = u32::try_from(self.word)
            .map_err(|_| StoreError::Corrupt(format!("definition {}: word {}", self.id, self.word)))?;
        let bit = u8::try_from(self.bit)
            .map_err(|_| StoreError::Corrupt(format!("definition {}: bit {}", self.id, self.bit)))?;
        Ok(FaultDefinition {
            id: self.id,
            word,
            bit,
            code: self.code,
            kind: self.kind,
            description: self.description,
            priority: self.priority,
            message_class: self.message_class,
            sector_code: self.sector_code,
            sector_name: self.sector_name,
            lock_code: self.lock_code,
            lock_name: self.lock_name,
            active: true,
        })
    }
}

impl FaultStore for SqliteStore {
    fn load_definitions(&self) -> Result<Vec<FaultDefinition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.word_index, d.bit_index, d.code, d.kind, d.description, d.priority,
                    d.message_class, d.sector_code, s.name, s.lock_code, l.name
             FROM fault_definitions d
             JOIN sectors s ON s.code = d.sector_code
             LEFT JOIN locks l ON l.code = s.lock_code
             WHERE d.active = 1 AND d.word_index IS NOT NULL AND d.bit_index IS NOT NULL
             ORDER BY d.word_index, d.bit_index, d.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawDefinition {
                id: row.get(0)?,
                word: row.get(1)?,
                bit: row.get(2)?,
                code: row.get(3)?,
                kind: row.get(4)?,
                description: row.get(5)?,
                priority: row.get(6)?,
                message_class: row.get(7)?,
                sector_code: row.get(8)?,
                sector_name: row.get(9)?,
                lock_code: row.get(10)?,
                lock_name: row.get(11)?,
            })
        })?;

        let mut definitions = Vec::new();
        for raw in rows {
            match raw?.into_definition() {
                Ok(def) => definitions.push(def),
                Err(e) => tracing::warn!(error = %e, "skipping definition row"),
            }
        }
        Ok(definitions)
    }

    fn upsert_definitions(&self, definitions: &[FaultDefinition]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for def in definitions {
            tx.execute(
                "INSERT INTO locks (code, name) VALUES (?1, ?2)
                 ON CONFLICT(code) DO UPDATE SET name = COALESCE(excluded.name, locks.name)",
                params![def.lock_code, def.lock_name],
            )?;
            tx.execute(
                "INSERT INTO sectors (code, name, lock_code) VALUES (?1, ?2, ?3)
                 ON CONFLICT(code) DO UPDATE SET name = excluded.name, lock_code = excluded.lock_code",
                params![def.sector_code, def.sector_name, def.lock_code],
            )?;
            tx.execute(
                "INSERT INTO fault_definitions
                    (id, word_index, bit_index, code, kind, description, priority, message_class, sector_code, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    word_index = excluded.word_index,
                    bit_index = excluded.bit_index,
                    code = excluded.code,
                    kind = excluded.kind,
                    description = excluded.description,
                    priority = excluded.priority,
                    message_class = excluded.message_class,
                    sector_code = excluded.sector_code,
                    active = excluded.active",
                params![
                    def.id,
                    def.word,
                    def.bit,
                    def.code,
                    def.kind,
                    def.description,
                    def.priority,
                    def.message_class,
                    def.sector_code,
                    def.active,
                ],
            )?;
        }
        tx.commit()?;
        Ok(definitions.len())
    }

    fn activate(&self, definition_id: i64, at: OffsetDateTime) -> Result<Activation, StoreError> {
        let started_at = format_ts(at)?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO occurrences (definition_id, status, started_at)
             VALUES (?1, 'ACTIVE', ?2)",
            params![definition_id, started_at],
        )?;
        if inserted == 0 {
            Ok(Activation::AlreadyActive)
        } else {
            Ok(Activation::Created(conn.last_insert_rowid()))
        }
    }

    fn resolve_active(&self, definition_id: i64, at: OffsetDateTime) -> Result<usize, StoreError> {
        let ended_at = format_ts(at)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE occurrences SET status = 'RESOLVED', ended_at = ?1, resolved_by = 'PLC'
             WHERE definition_id = ?2 AND status = 'ACTIVE'",
            params![ended_at, definition_id],
        )?;
        Ok(updated)
    }

    fn resolve_occurrence(&self, occurrence_id: i64, at: OffsetDateTime) -> Result<bool, StoreError> {
        let ended_at = format_ts(at)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE occurrences SET status = 'RESOLVED', ended_at = ?1, resolved_by = 'MANUAL'
             WHERE id = ?2 AND status = 'ACTIVE'",
            params![ended_at, occurrence_id],
        )?;
        Ok(updated > 0)
    }

    fn occurrences(&self, query: &OccurrenceQuery) -> Result<Vec<Occurrence>, StoreError> {
        let mut sql = String::from(
            "SELECT id, definition_id, status, started_at, ended_at, resolved_by FROM occurrences WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(ids) = &query.definition_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND definition_id IN ({placeholders})"));
            values.extend(ids.iter().map(|id| Value::Integer(*id)));
        }

        // LIMIT -1 = sans limite ; OFFSET exige un LIMIT
        sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?");
        values.push(Value::Integer(query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))));
        values.push(Value::Integer(query.offset.map_or(0, |o| i64::try_from(o).unwrap_or(i64::MAX))));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), RawOccurrence::from_row)?;

        let mut occurrences = Vec::new();
        for raw in rows {
            match raw?.into_occurrence() {
                Ok(occ) => occurrences.push(occ),
                Err(e) => tracing::warn!(error = %e, "skipping occurrence row"),
            }
        }
        Ok(occurrences)
    }

    fn locks(&self) -> Result<Vec<LockInfo>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT l.code, l.name, COUNT(s.code)
             FROM locks l
             LEFT JOIN sectors s ON s.lock_code = l.code
             GROUP BY l.code, l.name
             ORDER BY l.code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LockInfo {
                code: row.get(0)?,
                name: row.get(1)?,
                sectors: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            backend: "sqlite".into(),
            location: Some(
                self.location
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| ":memory:".into()),
            ),
        }
    }
}
