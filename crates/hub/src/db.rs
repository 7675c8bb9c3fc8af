use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::actuator::DeviceState;
use crate::history::{EventLog, IrrigationEvent};
use crate::program::{DeviceId, DeviceInterval, Program, RunState};
use crate::sun::SunriseSunset;

const DATE_FORMAT: &str = "%Y-%m-%d";

// ---------------------------------------------------------------------------
// Repository contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("program '{0}' not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

/// The only fields the scheduler ever writes. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramUpdate {
    pub run_state: Option<RunState>,
    pub next_run_date: Option<NaiveDate>,
}

impl ProgramUpdate {
    pub fn start_run(device_intervals: Vec<DeviceInterval>, next_run_date: NaiveDate) -> Self {
        Self {
            run_state: Some(RunState::Running(device_intervals)),
            next_run_date: Some(next_run_date),
        }
    }

    /// Clear the run; `next_run_date` stays as written at start.
    pub fn finish_run() -> Self {
        Self {
            run_state: Some(RunState::Idle),
            next_run_date: None,
        }
    }

    #[cfg(test)]
    pub fn apply(self, program: &mut Program) {
        if let Some(run_state) = self.run_state {
            program.run_state = run_state;
        }
        if let Some(date) = self.next_run_date {
            program.next_run_date = Some(date);
        }
    }
}

#[async_trait]
pub trait ProgramRepository: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Program>, StoreError>;

    async fn update(&self, id: &str, update: ProgramUpdate) -> Result<Program, StoreError>;

    /// Last day of an active rain delay, if one is set.
    async fn rain_delay(&self) -> Result<Option<NaiveDate>, StoreError>;
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct ProgramRow {
    id: String,
    name: String,
    duration: i64,
    watering_period: i64,
    start_times: String,
    device_ids: String,
    simultaneous_irrigation: bool,
    next_run_date: Option<String>,
    device_intervals: Option<String>,
}

fn codec_err(id: &str, field: &str, e: impl Display) -> StoreError {
    StoreError::Codec(format!("program '{id}' {field}: {e}"))
}

impl TryFrom<ProgramRow> for Program {
    type Error = StoreError;

    fn try_from(r: ProgramRow) -> Result<Self, StoreError> {
        let id = r.id.as_str();
        let duration = u32::try_from(r.duration).map_err(|e| codec_err(id, "duration", e))?;
        let watering_period =
            u32::try_from(r.watering_period).map_err(|e| codec_err(id, "watering_period", e))?;
        let start_times =
            serde_json::from_str(&r.start_times).map_err(|e| codec_err(id, "start_times", e))?;
        let device_ids =
            serde_json::from_str(&r.device_ids).map_err(|e| codec_err(id, "device_ids", e))?;
        let next_run_date = r
            .next_run_date
            .as_deref()
            .map(|s| NaiveDate::parse_from_str(s, DATE_FORMAT))
            .transpose()
            .map_err(|e| codec_err(id, "next_run_date", e))?;
        let run_state = match r.device_intervals.as_deref() {
            None => RunState::Idle,
            Some(json) => RunState::Running(
                serde_json::from_str(json).map_err(|e| codec_err(id, "device_intervals", e))?,
            ),
        };

        Ok(Program {
            id: r.id,
            name: r.name,
            duration,
            watering_period,
            start_times,
            device_ids,
            simultaneous_irrigation: r.simultaneous_irrigation,
            next_run_date,
            run_state,
        })
    }
}

fn encode_run_state(id: &str, run_state: &RunState) -> Result<Option<String>, StoreError> {
    match run_state {
        RunState::Idle => Ok(None),
        RunState::Running(intervals) => serde_json::to_string(intervals)
            .map(Some)
            .map_err(|e| codec_err(id, "device_intervals", e)),
    }
}

fn encode_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format(DATE_FORMAT).to_string())
}

fn encode_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_date(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| StoreError::Codec(format!("date {s:?}: {e}")))
}

#[derive(Debug, FromRow)]
struct EventRow {
    at: String,
    program_id: String,
    device_id: i64,
    state: String,
    error: Option<String>,
}

impl TryFrom<EventRow> for IrrigationEvent {
    type Error = StoreError;

    fn try_from(r: EventRow) -> Result<Self, StoreError> {
        let bad = |field: &str, e: &dyn Display| {
            StoreError::Codec(format!("irrigation event {}: {field}: {e}", r.at))
        };
        let at = DateTime::parse_from_rfc3339(&r.at)
            .map_err(|e| bad("at", &e))?
            .with_timezone(&Utc);
        let device_id = DeviceId::try_from(r.device_id).map_err(|e| bad("device_id", &e))?;
        let state = match r.state.as_str() {
            "on" => DeviceState::On,
            "off" => DeviceState::Off,
            other => return Err(bad("state", &other)),
        };

        Ok(IrrigationEvent {
            at,
            program_id: r.program_id,
            device_id,
            state,
            error: r.error,
        })
    }
}

const EVENT_COLUMNS: &str = "at, program_id, device_id, state, error";

const PROGRAM_COLUMNS: &str = "id, name, duration, watering_period, start_times, device_ids, \
     simultaneous_irrigation, next_run_date, device_intervals";

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database,
        // so keep exactly one alive for the lifetime of the pool.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Programs
    // ----------------------------

    /// All programs ordered by id. Rows that no longer decode are logged
    /// and skipped.
    pub async fn load_programs(&self) -> Result<Vec<Program>, StoreError> {
        let rows: Vec<ProgramRow> =
            sqlx::query_as(&format!("SELECT {PROGRAM_COLUMNS} FROM programs ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match Program::try_from(row) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("skipping unreadable program: {e}");
                    None
                }
            })
            .collect())
    }

    pub async fn get_program(&self, id: &str) -> Result<Option<Program>, StoreError> {
        let row: Option<ProgramRow> =
            sqlx::query_as(&format!("SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Program::try_from).transpose()
    }

    /// Insert a program, or refresh the definition of an existing one.
    /// An existing program keeps its run state and next run date.
    pub async fn upsert_program(&self, p: &Program) -> Result<(), StoreError> {
        let start_times =
            serde_json::to_string(&p.start_times).map_err(|e| codec_err(&p.id, "start_times", e))?;
        let device_ids =
            serde_json::to_string(&p.device_ids).map_err(|e| codec_err(&p.id, "device_ids", e))?;
        let device_intervals = encode_run_state(&p.id, &p.run_state)?;

        sqlx::query(
            r#"
            INSERT INTO programs (
              id, name, duration, watering_period, start_times, device_ids,
              simultaneous_irrigation, next_run_date, device_intervals
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              duration=excluded.duration,
              watering_period=excluded.watering_period,
              start_times=excluded.start_times,
              device_ids=excluded.device_ids,
              simultaneous_irrigation=excluded.simultaneous_irrigation
            "#,
        )
        .bind(&p.id)
        .bind(&p.name)
        .bind(i64::from(p.duration))
        .bind(i64::from(p.watering_period))
        .bind(start_times)
        .bind(device_ids)
        .bind(p.simultaneous_irrigation)
        .bind(encode_date(p.next_run_date))
        .bind(device_intervals)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write the scheduler-owned fields of one program.
    ///
    /// One statement with no read first, so concurrent updates queue on the
    /// write lock instead of failing on a stale snapshot (SQLITE_BUSY).
    pub async fn update_program(
        &self,
        id: &str,
        update: ProgramUpdate,
    ) -> Result<Program, StoreError> {
        let (set_run_state, device_intervals) = match &update.run_state {
            Some(run_state) => (true, encode_run_state(id, run_state)?),
            None => (false, None),
        };

        // Read every returned row so the statement runs to completion.
        let rows: Vec<ProgramRow> = sqlx::query_as(&format!(
            r#"
            UPDATE programs SET
              device_intervals = CASE WHEN ? THEN ? ELSE device_intervals END,
              next_run_date = COALESCE(?, next_run_date)
            WHERE id = ?
            RETURNING {PROGRAM_COLUMNS}
            "#
        ))
        .bind(set_run_state)
        .bind(device_intervals)
        .bind(encode_date(update.next_run_date))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        match rows.into_iter().next() {
            Some(row) => Program::try_from(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    // ----------------------------
    // Rain delay
    // ----------------------------

    pub async fn get_rain_delay(&self) -> Result<Option<NaiveDate>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT resume_watering_after FROM rain_delay WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        row.and_then(|(date,)| date)
            .as_deref()
            .map(decode_date)
            .transpose()
    }

    /// `None` lifts the delay.
    pub async fn set_rain_delay(&self, until: Option<NaiveDate>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rain_delay (id, resume_watering_after) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET
              resume_watering_after=excluded.resume_watering_after
            "#,
        )
        .bind(encode_date(until))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----------------------------
    // Irrigation events
    // ----------------------------

    pub async fn insert_events(&self, events: &[IrrigationEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO irrigation_events ({EVENT_COLUMNS}) "));
        qb.push_values(events, |mut b, e| {
            b.push_bind(encode_instant(e.at))
                .push_bind(e.program_id.clone())
                .push_bind(i64::from(e.device_id))
                .push_bind(e.state.as_path())
                .push_bind(e.error.clone());
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Newest first, failures included.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<IrrigationEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM irrigation_events ORDER BY at DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IrrigationEvent::try_from).collect()
    }

    /// Accepted commands in `[start, end)`, oldest first.
    pub async fn switches_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IrrigationEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM irrigation_events
            WHERE error IS NULL AND at >= ? AND at < ?
            ORDER BY at, id
            "#
        ))
        .bind(encode_instant(start))
        .bind(encode_instant(end))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IrrigationEvent::try_from).collect()
    }

    pub async fn last_switch_before(
        &self,
        device_id: DeviceId,
        at: DateTime<Utc>,
    ) -> Result<Option<IrrigationEvent>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM irrigation_events
            WHERE error IS NULL AND device_id = ? AND at < ?
            ORDER BY at DESC, id DESC LIMIT 1
            "#
        ))
        .bind(i64::from(device_id))
        .bind(encode_instant(at))
        .fetch_optional(&self.pool)
        .await?;
        row.map(IrrigationEvent::try_from).transpose()
    }

    pub async fn first_switch_after(
        &self,
        device_id: DeviceId,
        at: DateTime<Utc>,
    ) -> Result<Option<IrrigationEvent>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM irrigation_events
            WHERE error IS NULL AND device_id = ? AND at >= ?
            ORDER BY at, id LIMIT 1
            "#
        ))
        .bind(i64::from(device_id))
        .bind(encode_instant(at))
        .fetch_optional(&self.pool)
        .await?;
        row.map(IrrigationEvent::try_from).transpose()
    }

    // ----------------------------
    // Sunrise/sunset cache
    // ----------------------------

    pub async fn get_sun_times(&self, date: NaiveDate) -> Result<Option<SunriseSunset>, StoreError> {
        let key = date.format(DATE_FORMAT).to_string();
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT sunrise, sunset FROM sunrise_sunset WHERE date = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;

        let Some((sunrise, sunset)) = row else {
            return Ok(None);
        };
        let parse = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Codec(format!("sunrise_sunset {key}: {e}")))
        };
        Ok(Some(SunriseSunset {
            sunrise: parse(&sunrise)?,
            sunset: parse(&sunset)?,
        }))
    }

    pub async fn put_sun_times(&self, date: NaiveDate, sun: &SunriseSunset) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sunrise_sunset (date, sunrise, sunset)
            VALUES (?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
              sunrise=excluded.sunrise,
              sunset=excluded.sunset
            "#,
        )
        .bind(date.format(DATE_FORMAT).to_string())
        .bind(sun.sunrise.to_rfc3339())
        .bind(sun.sunset.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgramRepository for Db {
    async fn find_all(&self) -> Result<Vec<Program>, StoreError> {
        self.load_programs().await
    }

    async fn update(&self, id: &str, update: ProgramUpdate) -> Result<Program, StoreError> {
        self.update_program(id, update).await
    }

    async fn rain_delay(&self) -> Result<Option<NaiveDate>, StoreError> {
        self.get_rain_delay().await
    }
}

#[async_trait]
impl EventLog for Db {
    async fn append(&self, events: &[IrrigationEvent]) -> Result<(), StoreError> {
        self.insert_events(events).await
    }
}

/// File-backed database with a full connection pool, for tests where
/// several connections must contend. Files are removed on drop.
#[cfg(test)]
pub(crate) struct TempFileDb {
    pub db: Db,
    path: std::path::PathBuf,
}

#[cfg(test)]
impl TempFileDb {
    pub async fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "irrigation-{name}-{}.db",
            std::process::id()
        ));
        remove_db_files(&path);
        let db = Db::connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        Self { db, path }
    }
}

#[cfg(test)]
impl Drop for TempFileDb {
    fn drop(&mut self) {
        remove_db_files(&self.path);
    }
}

#[cfg(test)]
fn remove_db_files(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::TimeWindow;
    use chrono::TimeZone;
    use futures::future::join_all;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn test_program(id: &str) -> Program {
        Program {
            id: id.into(),
            name: "Back beds".into(),
            duration: 10,
            watering_period: 3,
            start_times: vec!["06:00".parse().unwrap(), "sunset-30".parse().unwrap()],
            device_ids: vec![7, 3],
            simultaneous_irrigation: false,
            next_run_date: None,
            run_state: RunState::Idle,
        }
    }

    fn interval(device_id: u32, start_h: u32, end_h: u32) -> DeviceInterval {
        DeviceInterval {
            device_id,
            interval: TimeWindow {
                start: Utc.with_ymd_and_hms(2026, 6, 1, start_h, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2026, 6, 1, end_h, 0, 0).unwrap(),
            },
        }
    }

    fn june(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, day).unwrap()
    }

    // -- Programs ------------------------------------------------------------

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let db = test_db().await;
        db.upsert_program(&test_program("b")).await.unwrap();
        db.upsert_program(&test_program("a")).await.unwrap();

        let programs = db.load_programs().await.unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0].id, "a");
        assert_eq!(programs[1], test_program("b"));
    }

    #[tokio::test]
    async fn get_program_missing_is_none() {
        let db = test_db().await;
        assert!(db.get_program("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_run_persists_intervals_and_next_date() {
        let db = test_db().await;
        db.upsert_program(&test_program("p")).await.unwrap();

        let intervals = vec![interval(7, 6, 7), interval(3, 7, 8)];
        let updated = db
            .update_program("p", ProgramUpdate::start_run(intervals.clone(), june(4)))
            .await
            .unwrap();
        assert_eq!(updated.run_state, RunState::Running(intervals.clone()));

        let stored = db.get_program("p").await.unwrap().unwrap();
        assert_eq!(stored.run_state, RunState::Running(intervals));
        assert_eq!(stored.next_run_date, Some(june(4)));
    }

    #[tokio::test]
    async fn finish_run_clears_intervals_but_keeps_next_date() {
        let db = test_db().await;
        db.upsert_program(&test_program("p")).await.unwrap();
        db.update_program("p", ProgramUpdate::start_run(vec![interval(7, 6, 7)], june(4)))
            .await
            .unwrap();

        db.update_program("p", ProgramUpdate::finish_run())
            .await
            .unwrap();

        let stored = db.get_program("p").await.unwrap().unwrap();
        assert_eq!(stored.run_state, RunState::Idle);
        assert_eq!(stored.next_run_date, Some(june(4)));
    }

    #[tokio::test]
    async fn update_missing_program_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_program("ghost", ProgramUpdate::finish_run())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn upsert_existing_keeps_run_state() {
        let db = test_db().await;
        db.upsert_program(&test_program("p")).await.unwrap();
        db.update_program("p", ProgramUpdate::start_run(vec![interval(7, 6, 7)], june(4)))
            .await
            .unwrap();

        let mut redefined = test_program("p");
        redefined.duration = 25;
        redefined.next_run_date = Some(june(20));
        db.upsert_program(&redefined).await.unwrap();

        let stored = db.get_program("p").await.unwrap().unwrap();
        assert_eq!(stored.duration, 25);
        assert!(stored.run_state.is_running());
        assert_eq!(stored.next_run_date, Some(june(4)));
    }

    #[tokio::test]
    async fn unreadable_row_is_skipped() {
        let db = test_db().await;
        db.upsert_program(&test_program("good")).await.unwrap();
        sqlx::query(
            r#"INSERT INTO programs (id, name, duration, watering_period, start_times, device_ids)
               VALUES ('bad', 'Bad', 10, 1, '["whenever"]', '[1]')"#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let programs = db.load_programs().await.unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].id, "good");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_on_file_db_all_land() {
        let tmp = TempFileDb::new("concurrent-updates").await;
        let ids: Vec<String> = (0..8).map(|i| format!("p{i}")).collect();
        for id in &ids {
            tmp.db.upsert_program(&test_program(id)).await.unwrap();
        }

        let starts = join_all(ids.iter().map(|id| {
            tmp.db
                .update_program(id, ProgramUpdate::start_run(vec![interval(7, 6, 7)], june(4)))
        }))
        .await;
        for (id, result) in ids.iter().zip(&starts) {
            assert!(result.is_ok(), "start of {id} failed: {result:?}");
        }
        for program in tmp.db.load_programs().await.unwrap() {
            assert!(program.run_state.is_running(), "{} not running", program.id);
        }

        let finishes = join_all(
            ids.iter()
                .map(|id| tmp.db.update_program(id, ProgramUpdate::finish_run())),
        )
        .await;
        assert!(finishes.iter().all(Result::is_ok), "{finishes:?}");
        for program in tmp.db.load_programs().await.unwrap() {
            assert_eq!(program.run_state, RunState::Idle);
            assert_eq!(program.next_run_date, Some(june(4)));
        }
    }

    #[tokio::test]
    async fn next_run_date_only_update_keeps_run_state() {
        let db = test_db().await;
        db.upsert_program(&test_program("p")).await.unwrap();
        db.update_program("p", ProgramUpdate::start_run(vec![interval(7, 6, 7)], june(4)))
            .await
            .unwrap();

        let updated = db
            .update_program(
                "p",
                ProgramUpdate {
                    run_state: None,
                    next_run_date: Some(june(9)),
                },
            )
            .await
            .unwrap();

        assert!(updated.run_state.is_running());
        assert_eq!(updated.next_run_date, Some(june(9)));
    }

    // -- Rain delay ----------------------------------------------------------

    #[tokio::test]
    async fn rain_delay_set_and_lift() {
        let db = test_db().await;
        assert_eq!(db.get_rain_delay().await.unwrap(), None);

        db.set_rain_delay(Some(june(3))).await.unwrap();
        assert_eq!(db.rain_delay().await.unwrap(), Some(june(3)));

        db.set_rain_delay(Some(june(5))).await.unwrap();
        assert_eq!(db.get_rain_delay().await.unwrap(), Some(june(5)));

        db.set_rain_delay(None).await.unwrap();
        assert_eq!(db.get_rain_delay().await.unwrap(), None);
    }

    // -- Irrigation events ---------------------------------------------------

    fn event(
        device_id: u32,
        state: DeviceState,
        minute: u32,
        error: Option<&str>,
    ) -> IrrigationEvent {
        IrrigationEvent {
            at: Utc.with_ymd_and_hms(2026, 6, 1, 14, minute, 0).unwrap(),
            program_id: "p".into(),
            device_id,
            state,
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn events_are_listed_newest_first_with_failures() {
        let db = test_db().await;
        let events = vec![
            event(7, DeviceState::On, 0, None),
            event(3, DeviceState::On, 0, Some("device 3 rejected command with status 503")),
            event(7, DeviceState::Off, 15, None),
        ];
        db.append(&events).await.unwrap();
        db.append(&[]).await.unwrap();

        let recent = db.recent_events(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0], events[2]);
        assert_eq!(recent[1], events[1]);

        assert_eq!(db.recent_events(1).await.unwrap(), vec![events[2].clone()]);
    }

    #[tokio::test]
    async fn switch_queries_skip_failed_commands() {
        let db = test_db().await;
        db.append(&[
            event(7, DeviceState::On, 0, None),
            event(7, DeviceState::Off, 10, Some("timeout")),
            event(7, DeviceState::Off, 15, None),
        ])
        .await
        .unwrap();
        let at = |minute| Utc.with_ymd_and_hms(2026, 6, 1, 14, minute, 0).unwrap();

        let between = db.switches_between(at(0), at(15)).await.unwrap();
        assert_eq!(between, vec![event(7, DeviceState::On, 0, None)]);

        let after = db.first_switch_after(7, at(1)).await.unwrap();
        assert_eq!(after, Some(event(7, DeviceState::Off, 15, None)));

        let before = db.last_switch_before(7, at(14)).await.unwrap();
        assert_eq!(before, Some(event(7, DeviceState::On, 0, None)));
        assert_eq!(db.last_switch_before(8, at(59)).await.unwrap(), None);
    }

    // -- Sunrise/sunset cache ------------------------------------------------

    #[tokio::test]
    async fn sun_times_round_trip() {
        let db = test_db().await;
        assert!(db.get_sun_times(june(1)).await.unwrap().is_none());

        let sun = SunriseSunset {
            sunrise: Utc.with_ymd_and_hms(2026, 6, 1, 12, 17, 0).unwrap(),
            sunset: Utc.with_ymd_and_hms(2026, 6, 2, 2, 41, 0).unwrap(),
        };
        db.put_sun_times(june(1), &sun).await.unwrap();
        assert_eq!(db.get_sun_times(june(1)).await.unwrap(), Some(sun));
    }
}
