//! Minute-by-minute program scheduler: starts due programs, switches devices
//! on the edges of their intervals, and clears programs whose last interval
//! has ended.
//!
//! All run state lives in the program store (`RunState::Running` holds the
//! whole day's device intervals), so a restart picks up where it left off
//! on the next tick.
//!
//! ## Per-program state machine
//!
//! ```text
//!            [next_run_date <= today && earliest start == this minute]
//!  Idle ─────────────────────────────────────────────────────────────▶ Running
//!   ▲        persist intervals + next_run_date, then switch devices      │
//!   │                                                                    │
//!   └────────────[latest interval end <= now] persist Idle ◀─────────────┘
//! ```
//!
//! Each tick:
//! 1. sunrise/sunset for today, falling back to the configured defaults
//! 2. load every program; a failure here aborts the tick
//! 3. classify each program; while a rain delay covers today, due programs
//!    sit out (runs already in progress carry on)
//! 4. persist a fresh run for every due program (failures only drop that one)
//! 5. running set = already running + just started
//! 6. OFF/ON commands for this minute, one at a time with the metering pause,
//!    then append the outcomes to the event log
//! 7. persist Idle for every completed program

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::actuator::Actuator;
use crate::db::{ProgramRepository, ProgramUpdate};
use crate::history::{EventLog, IrrigationEvent};
use crate::program::{truncate_to_minute, Program, ProgramStatus, RunState};
use crate::sequencer::{execute, plan_commands, CommandOutcome, SequenceReport};
use crate::state::SharedState;
use crate::sun::{DefaultSunTimes, SunriseSunset, SunriseSunsetSource};

/// Ticks fire this far past the minute boundary so timer jitter can never
/// land one in the previous minute.
const TICK_SETTLE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Configuration & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub timezone: Tz,
    pub default_sun: DefaultSunTimes,
    /// Pause after every device command.
    pub metering_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Completed,
    /// Programs could not be loaded; nothing was done.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub outcome: TickOutcome,
    pub used_default_sun: bool,
    pub programs: usize,
    pub started: Vec<String>,
    /// Due this minute but held back by the rain delay.
    pub rain_delayed: Vec<String>,
    pub completed: Vec<String>,
    pub commands: SequenceReport,
}

impl TickReport {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            outcome: TickOutcome::Completed,
            used_default_sun: false,
            programs: 0,
            started: Vec::new(),
            rain_delayed: Vec::new(),
            completed: Vec::new(),
            commands: SequenceReport::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    programs: Arc<dyn ProgramRepository>,
    sun: Option<Arc<dyn SunriseSunsetSource>>,
    actuator: Arc<dyn Actuator>,
    events: Option<Arc<dyn EventLog>>,
    config: SchedulerConfig,
    shared: SharedState,
}

impl Scheduler {
    pub fn new(
        programs: Arc<dyn ProgramRepository>,
        sun: Option<Arc<dyn SunriseSunsetSource>>,
        actuator: Arc<dyn Actuator>,
        config: SchedulerConfig,
        shared: SharedState,
    ) -> Self {
        Self {
            programs,
            sun,
            actuator,
            events: None,
            config,
            shared,
        }
    }

    /// Persist every command outcome to `log`.
    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.events = Some(log);
        self
    }

    /// One tick at the current time.
    pub async fn run(&self) {
        let now = Utc::now().with_timezone(&self.config.timezone);
        self.run_at(now).await;
    }

    /// One tick at `now`. Never fails: every collaborator error is logged,
    /// recorded in the shared state, and handled locally.
    pub async fn run_at(&self, now: DateTime<Tz>) -> TickReport {
        let tz = self.config.timezone;
        let today = now.date_naive();
        let minute = truncate_to_minute(now.with_timezone(&Utc));
        let mut report = TickReport::new(minute);

        // ── 1. Sunrise / sunset ──────────────────────────────────────
        let (sun, used_default_sun) = self.sun_times(today).await;
        report.used_default_sun = used_default_sun;

        // ── 2. Programs ──────────────────────────────────────────────
        let programs = match self.programs.find_all().await {
            Ok(programs) => programs,
            Err(e) => {
                error!("tick aborted, failed to load programs: {e}");
                report.outcome = TickOutcome::Aborted;
                let mut st = self.shared.write().await;
                st.record_error(format!("tick aborted, failed to load programs: {e}"));
                st.record_tick(report.clone());
                return report;
            }
        };
        report.programs = programs.len();

        // ── 3. Classify ──────────────────────────────────────────────
        let rain_delay = self.rain_delay(today).await;
        let mut running: Vec<Program> = Vec::new();
        let mut due: Vec<(Program, Vec<DateTime<Utc>>)> = Vec::new();
        for program in programs {
            let starts = program.actual_start_times(today, &sun, &tz);
            match program.status(&starts, &now) {
                ProgramStatus::Running | ProgramStatus::Completed => running.push(program),
                ProgramStatus::DueToStart if rain_delay.is_some() => {
                    report.rain_delayed.push(program.id);
                }
                ProgramStatus::DueToStart => due.push((program, starts)),
                ProgramStatus::Idle => {}
            }
        }
        if let Some(until) = rain_delay.filter(|_| !report.rain_delayed.is_empty()) {
            info!(programs = ?report.rain_delayed, %until, "rain delay, not starting");
            self.shared.write().await.record_scheduler(format!(
                "rain delay until {until}: held {}",
                report.rain_delayed.join(", ")
            ));
        }

        // ── 4 + 5. Start due programs ────────────────────────────────
        let started: Vec<Program> = join_all(
            due.into_iter()
                .map(|(program, starts)| self.start_program(program, starts, today)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();
        report.started = started.iter().map(|p| p.id.clone()).collect();
        running.extend(started);

        // ── 6. Actuate ───────────────────────────────────────────────
        let commands = plan_commands(
            running
                .iter()
                .map(|p| (p.id.as_str(), p.run_state.intervals())),
            minute,
        );
        let outcomes = execute(
            self.actuator.as_ref(),
            commands,
            self.config.metering_interval,
        )
        .await;
        report.commands = SequenceReport::from_outcomes(&outcomes);
        self.record_outcomes(&outcomes).await;
        self.log_outcomes(&outcomes).await;

        // ── 7. Clear completed programs ──────────────────────────────
        let finishing = running
            .iter()
            .filter(|p| is_completed(p, &now))
            .map(|p| self.finish_program(&p.id));
        report.completed = join_all(finishing).await.into_iter().flatten().collect();

        if report.started.is_empty() && report.completed.is_empty() && report.commands.issued == 0
        {
            debug!(programs = report.programs, %minute, "tick: nothing to do");
        } else {
            info!(
                started = ?report.started,
                completed = ?report.completed,
                commands = report.commands.issued,
                failed = report.commands.failed,
                default_sun = report.used_default_sun,
                "tick complete"
            );
        }
        self.shared.write().await.record_tick(report.clone());
        report
    }

    /// Tick once a minute until the task is dropped.
    pub async fn run_forever(self: Arc<Self>) {
        info!(
            timezone = %self.config.timezone,
            metering_ms = self.config.metering_interval.as_millis() as u64,
            actuator = self.actuator.name(),
            sun_source = self.sun.is_some(),
            event_log = self.events.is_some(),
            "scheduler started"
        );
        self.shared
            .write()
            .await
            .record_scheduler(format!("scheduler started ({})", self.config.timezone));

        loop {
            tokio::time::sleep(until_next_minute(Utc::now()) + TICK_SETTLE).await;

            let started = Utc::now();
            self.run().await;
            let finished = Utc::now();

            if truncate_to_minute(finished) > truncate_to_minute(started) {
                warn!(
                    elapsed_ms = (finished - started).num_milliseconds(),
                    "tick overran its minute; skipping to the next one"
                );
                self.shared
                    .write()
                    .await
                    .record_error(format!("tick at {started} overran its minute"));
            }
        }
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    async fn sun_times(&self, today: NaiveDate) -> (SunriseSunset, bool) {
        if let Some(source) = &self.sun {
            match source.get(today).await {
                Ok(sun) => return (sun, false),
                Err(e) => {
                    warn!(%today, "sunrise/sunset unavailable, using defaults: {e}");
                }
            }
        }
        (
            self.config
                .default_sun
                .for_date(today, &self.config.timezone),
            true,
        )
    }

    /// The rain delay's last day if it covers `today`. A store failure counts
    /// as no delay.
    async fn rain_delay(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self.programs.rain_delay().await {
            Ok(until) => until.filter(|until| today <= *until),
            Err(e) => {
                warn!("failed to read rain delay, ignoring it: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("failed to read rain delay: {e}"));
                None
            }
        }
    }

    /// Persist a fresh run. Returns the program in its running state, or
    /// `None` if it must sit out this tick.
    async fn start_program(
        &self,
        mut program: Program,
        starts: Vec<DateTime<Utc>>,
        today: NaiveDate,
    ) -> Option<Program> {
        let Some(plan) = program.plan_run(&starts, today) else {
            warn!(program_id = %program.id, "program has nothing to run; skipping");
            return None;
        };

        let update = ProgramUpdate::start_run(plan.device_intervals.clone(), plan.next_run_date);
        if let Err(e) = self.programs.update(&program.id, update).await {
            error!(program_id = %program.id, "failed to persist program start: {e}");
            self.shared.write().await.record_error(format!(
                "program {}: failed to persist start: {e}",
                program.id
            ));
            return None;
        }

        info!(
            program_id = %program.id,
            intervals = plan.device_intervals.len(),
            next_run_date = %plan.next_run_date,
            "program started"
        );
        self.shared
            .write()
            .await
            .record_scheduler(format!("program {} started", program.id));

        program.run_state = RunState::Running(plan.device_intervals);
        program.next_run_date = Some(plan.next_run_date);
        Some(program)
    }

    /// Persist Idle. Returns the id on success; on failure the program stays
    /// running in storage and the next tick tries again.
    async fn finish_program(&self, id: &str) -> Option<String> {
        match self.programs.update(id, ProgramUpdate::finish_run()).await {
            Ok(_) => {
                info!(program_id = %id, "program completed");
                self.shared
                    .write()
                    .await
                    .record_scheduler(format!("program {id} completed"));
                Some(id.to_string())
            }
            Err(e) => {
                error!(program_id = %id, "failed to clear completed program: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("program {id}: failed to clear run: {e}"));
                None
            }
        }
    }

    async fn record_outcomes(&self, outcomes: &[CommandOutcome]) {
        if outcomes.is_empty() {
            return;
        }
        let mut st = self.shared.write().await;
        for outcome in outcomes {
            let c = &outcome.command;
            match &outcome.error {
                None => st.record_valve(&c.program_id, c.device_id, c.state),
                Some(e) => st.record_error(format!(
                    "program {}: device {} {} failed: {e}",
                    c.program_id, c.device_id, c.state
                )),
            }
        }
    }

    async fn log_outcomes(&self, outcomes: &[CommandOutcome]) {
        let Some(log) = &self.events else {
            return;
        };
        if outcomes.is_empty() {
            return;
        }
        let events: Vec<IrrigationEvent> = outcomes.iter().map(IrrigationEvent::from).collect();
        if let Err(e) = log.append(&events).await {
            warn!(events = events.len(), "failed to store irrigation events: {e}");
            self.shared
                .write()
                .await
                .record_error(format!("failed to store {} irrigation events: {e}", events.len()));
        }
    }
}

/// Start times only matter for idle programs.
fn is_completed(program: &Program, now: &DateTime<Tz>) -> bool {
    program.status(&[], now) == ProgramStatus::Completed
}

/// Time left until the next wall-clock minute starts.
fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = Duration::from_secs(now.second().into())
        + Duration::from_nanos(now.nanosecond().min(999_999_999).into());
    Duration::from_secs(60).saturating_sub(into_minute)
}

// ===========================================================================
// Tests
// ===========================================================================
