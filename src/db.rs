use std::path::Path;

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::{params, Connection};
use tracing::{error, info, warn};

use crate::config::{ConflictPolicy, PersistConfig};
use crate::error::{is_row_error, IngestError, Result};
use crate::neo::NeoObject;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS asteroids (
            id                                INTEGER PRIMARY KEY,
            name                              TEXT NOT NULL,
            absolute_magnitude_h              REAL NOT NULL,
            estimated_diameter_min_km         REAL NOT NULL,
            estimated_diameter_max_km         REAL NOT NULL,
            is_potentially_hazardous_asteroid BOOLEAN NOT NULL
        );

        CREATE TABLE IF NOT EXISTS close_approaches (
            id                     INTEGER PRIMARY KEY,
            neo_reference_id       INTEGER NOT NULL REFERENCES asteroids(id),
            close_approach_date    TEXT NOT NULL,
            relative_velocity_kmph REAL NOT NULL CHECK(relative_velocity_kmph >= 0),
            astronomical_au        REAL NOT NULL CHECK(astronomical_au >= 0),
            miss_distance_km       REAL NOT NULL CHECK(miss_distance_km >= 0),
            miss_distance_lunar    REAL NOT NULL CHECK(miss_distance_lunar >= 0),
            orbiting_body          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_approaches_neo ON close_approaches(neo_reference_id);
        CREATE INDEX IF NOT EXISTS idx_approaches_date ON close_approaches(close_approach_date);
        ",
    )?;
    Ok(())
}

// ── Persisting ──

const INSERT_ASTEROID: &str = "INSERT INTO asteroids
     (id, name, absolute_magnitude_h, estimated_diameter_min_km,
      estimated_diameter_max_km, is_potentially_hazardous_asteroid)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT(id) DO NOTHING";

const REFRESH_ASTEROID: &str = "UPDATE asteroids
     SET name = ?2, absolute_magnitude_h = ?3, estimated_diameter_min_km = ?4,
         estimated_diameter_max_km = ?5, is_potentially_hazardous_asteroid = ?6
     WHERE id = ?1";

const INSERT_APPROACH: &str = "INSERT INTO close_approaches
     (neo_reference_id, close_approach_date, relative_velocity_kmph,
      astronomical_au, miss_distance_km, miss_distance_lunar, orbiting_body)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Row counts of one persistence run. Only rows that were actually written count.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted_objects: usize,
    pub inserted_approaches: usize,
    /// Existing asteroid rows overwritten under [`ConflictPolicy::UpsertLatest`].
    pub refreshed_objects: usize,
    pub skipped: usize,
    pub commits: usize,
}

struct RecordOutcome {
    object_inserted: bool,
    object_refreshed: bool,
    approach_inserted: bool,
}

/// Writes records into `asteroids` and `close_approaches`, committing every
/// `batch_size` records.
///
/// A record whose rows violate a constraint is rolled back to its own savepoint and
/// skipped. Any other database error rolls back the open window and ends the run
/// with [`IngestError::PersistenceFatal`]; windows committed before it stay.
pub struct Persister<'c> {
    conn: &'c Connection,
    config: PersistConfig,
}

impl<'c> Persister<'c> {
    pub fn new(conn: &'c Connection, config: PersistConfig) -> Self {
        Self { conn, config }
    }

    pub fn persist(&self, records: &[NeoObject]) -> Result<PersistReport> {
        let pb = self.progress_bar(records.len());
        let mut report = PersistReport::default();
        let mut processed = 0usize;

        for window in records.chunks(self.config.batch_size.max(1)) {
            let tx = self
                .conn
                .unchecked_transaction()
                .map_err(IngestError::PersistenceFatal)?;

            for record in window {
                match self.persist_one(&tx, record) {
                    Ok(outcome) => {
                        report.inserted_objects += outcome.object_inserted as usize;
                        report.refreshed_objects += outcome.object_refreshed as usize;
                        report.inserted_approaches += outcome.approach_inserted as usize;
                    }
                    Err(IngestError::PersistenceRow { id, source }) => {
                        warn!(id, "Failed to insert asteroid: {}", source);
                        report.skipped += 1;
                    }
                    Err(e) => {
                        error!(id = record.id, "Database transaction failed: {}", e);
                        if let Err(rb) = tx.rollback() {
                            error!("Rollback failed: {}", rb);
                        }
                        pb.abandon();
                        return Err(e);
                    }
                }
                pb.inc(1);
            }

            tx.commit().map_err(IngestError::PersistenceFatal)?;
            processed += window.len();
            report.commits += 1;
            info!(processed, "Committed batch");
        }

        pb.finish_and_clear();
        info!(
            inserted_objects = report.inserted_objects,
            inserted_approaches = report.inserted_approaches,
            refreshed_objects = report.refreshed_objects,
            skipped = report.skipped,
            "All data committed"
        );
        Ok(report)
    }

    /// Write one record inside its own savepoint so it lands completely or not at all.
    fn persist_one(&self, conn: &Connection, record: &NeoObject) -> Result<RecordOutcome> {
        conn.execute_batch("SAVEPOINT neo_record")
            .map_err(IngestError::PersistenceFatal)?;

        match self.write_record(conn, record) {
            Ok(outcome) => {
                conn.execute_batch("RELEASE neo_record")
                    .map_err(IngestError::PersistenceFatal)?;
                Ok(outcome)
            }
            Err(e) if is_row_error(&e) => {
                conn.execute_batch("ROLLBACK TO neo_record; RELEASE neo_record")
                    .map_err(IngestError::PersistenceFatal)?;
                Err(IngestError::PersistenceRow {
                    id: record.id,
                    source: e,
                })
            }
            Err(e) => Err(IngestError::PersistenceFatal(e)),
        }
    }

    fn write_record(&self, conn: &Connection, r: &NeoObject) -> rusqlite::Result<RecordOutcome> {
        let asteroid = params![
            r.id,
            r.name,
            r.absolute_magnitude,
            r.diameter_min_km,
            r.diameter_max_km,
            r.is_potentially_hazardous,
        ];

        let object_inserted = conn.prepare_cached(INSERT_ASTEROID)?.execute(asteroid)? > 0;
        let object_refreshed = !object_inserted
            && self.config.on_conflict == ConflictPolicy::UpsertLatest
            && conn.prepare_cached(REFRESH_ASTEROID)?.execute(asteroid)? > 0;

        let a = &r.approach;
        let approach_inserted = conn.prepare_cached(INSERT_APPROACH)?.execute(params![
            r.reference_id,
            a.date,
            a.relative_velocity_kmph,
            a.miss_distance_au,
            a.miss_distance_km,
            a.miss_distance_lunar,
            a.orbiting_body,
        ])? > 0;

        Ok(RecordOutcome {
            object_inserted,
            object_refreshed,
            approach_inserted,
        })
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

// ── Stats ──

pub struct Stats {
    pub asteroids: usize,
    pub approaches: usize,
    pub hazardous: usize,
    pub max_velocity_kmph: Option<f64>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let asteroids: usize = conn.query_row("SELECT COUNT(*) FROM asteroids", [], |r| r.get(0))?;
    let approaches: usize =
        conn.query_row("SELECT COUNT(*) FROM close_approaches", [], |r| r.get(0))?;
    let hazardous: usize = conn.query_row(
        "SELECT COUNT(*) FROM asteroids WHERE is_potentially_hazardous_asteroid = 1",
        [],
        |r| r.get(0),
    )?;
    let max_velocity_kmph: Option<f64> = conn.query_row(
        "SELECT MAX(relative_velocity_kmph) FROM close_approaches",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        asteroids,
        approaches,
        hazardous,
        max_velocity_kmph,
    })
}

// ── Approach search ──

#[derive(Debug, Default, Clone)]
pub struct ApproachFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub max_lunar: Option<f64>,
    pub hazardous_only: bool,
    pub earth_only: bool,
    pub limit: usize,
}

#[derive(Debug)]
pub struct ApproachRow {
    pub id: i64,
    pub name: String,
    pub date: NaiveDate,
    pub velocity_kmph: f64,
    pub miss_distance_au: f64,
    pub miss_distance_lunar: f64,
    pub diameter_max_km: f64,
    pub hazardous: bool,
    pub orbiting_body: String,
}

pub fn search_approaches(conn: &Connection, filter: &ApproachFilter) -> Result<Vec<ApproachRow>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(from) = filter.from {
        conditions.push(format!("ap.close_approach_date >= ?{}", params.len() + 1));
        params.push(Box::new(from));
    }
    if let Some(to) = filter.to {
        conditions.push(format!("ap.close_approach_date <= ?{}", params.len() + 1));
        params.push(Box::new(to));
    }
    if let Some(lunar) = filter.max_lunar {
        conditions.push(format!("ap.miss_distance_lunar <= ?{}", params.len() + 1));
        params.push(Box::new(lunar));
    }
    if filter.hazardous_only {
        conditions.push("a.is_potentially_hazardous_asteroid = 1".to_string());
    }
    if filter.earth_only {
        conditions.push("ap.orbiting_body = 'Earth'".to_string());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT a.id, a.name, ap.close_approach_date, ap.relative_velocity_kmph,
                ap.astronomical_au, ap.miss_distance_lunar, a.estimated_diameter_max_km,
                a.is_potentially_hazardous_asteroid, ap.orbiting_body
         FROM close_approaches ap
         JOIN asteroids a ON a.id = ap.neo_reference_id{}
         ORDER BY ap.close_approach_date DESC, ap.miss_distance_lunar ASC
         LIMIT {}",
        where_clause, filter.limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(ApproachRow {
                id: row.get(0)?,
                name: row.get(1)?,
                date: row.get(2)?,
                velocity_kmph: row.get(3)?,
                miss_distance_au: row.get(4)?,
                miss_distance_lunar: row.get(5)?,
                diameter_max_km: row.get(6)?,
                hazardous: row.get(7)?,
                orbiting_body: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
