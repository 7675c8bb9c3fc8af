//! Irrigation program model and the pure scheduling rules built on it:
//! resolving start-time expressions, laying out per-device intervals, and
//! deciding whether a program is idle, due, running or finished.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Days, DurationRound, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::sun::SunriseSunset;

/// Maker API device identifier.
pub type DeviceId = u32;

// ---------------------------------------------------------------------------
// Start-time expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolarAnchor {
    Sunrise,
    Sunset,
}

impl SolarAnchor {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sunrise => "sunrise",
            Self::Sunset => "sunset",
        }
    }
}

/// One configured start time: a wall-clock `HH:MM`, or `sunrise`/`sunset`
/// with an optional signed offset in minutes (`sunset-30`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartTime {
    Clock(NaiveTime),
    Solar {
        anchor: SolarAnchor,
        offset_minutes: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid start time '{0}' (expected HH:MM or sunrise|sunset[+|-minutes])")]
pub struct StartTimeParseError(String);

impl FromStr for StartTime {
    type Err = StartTimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StartTimeParseError(s.to_string());

        for anchor in [SolarAnchor::Sunrise, SolarAnchor::Sunset] {
            if let Some(rest) = s.strip_prefix(anchor.as_str()) {
                let offset_minutes = parse_offset(rest).ok_or_else(invalid)?;
                return Ok(Self::Solar {
                    anchor,
                    offset_minutes,
                });
            }
        }

        parse_clock_time(s).map(Self::Clock).ok_or_else(invalid)
    }
}

impl TryFrom<String> for StartTime {
    type Error = StartTimeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StartTime> for String {
    fn from(s: StartTime) -> Self {
        s.to_string()
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Clock(t) => write!(f, "{}", t.format("%H:%M")),
            Self::Solar {
                anchor,
                offset_minutes: 0,
            } => write!(f, "{}", anchor.as_str()),
            Self::Solar {
                anchor,
                offset_minutes,
            } => write!(f, "{}{offset_minutes:+}", anchor.as_str()),
        }
    }
}

/// Strict 24-hour `HH:MM` (two digits each).
pub fn parse_clock_time(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 || !(h.bytes().chain(m.bytes())).all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// Offset suffix after `sunrise`/`sunset`. Empty means zero; an unsigned
/// number counts as positive.
fn parse_offset(rest: &str) -> Option<i32> {
    if rest.is_empty() {
        return Some(0);
    }
    let (sign, digits) = match rest.strip_prefix('-') {
        Some(d) => (-1, d),
        None => (1, rest.strip_prefix('+').unwrap_or(rest)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i32>().ok().map(|m| sign * m)
}

impl StartTime {
    /// Concrete instant for `today`, truncated to the minute.
    pub fn resolve(&self, today: NaiveDate, sun: &SunriseSunset, tz: &Tz) -> DateTime<Utc> {
        let instant = match *self {
            Self::Clock(time) => local_to_utc(tz, today.and_time(time)),
            Self::Solar {
                anchor,
                offset_minutes,
            } => {
                let base = sun.anchor(anchor);
                base.checked_add_signed(TimeDelta::minutes(offset_minutes.into()))
                    .unwrap_or(base)
            }
        };
        truncate_to_minute(instant)
    }
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Interpret a wall-clock time in `tz`. Ambiguous times (DST fall-back) take
/// the earlier instant; times skipped by a spring-forward gap are shifted one
/// hour later.
pub fn local_to_utc(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            local
                .checked_add_signed(TimeDelta::hours(1))
                .and_then(|shifted| tz.from_local_datetime(&shifted).earliest())
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(instant)
}

// ---------------------------------------------------------------------------
// Program record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Window during which one device must be held open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInterval {
    pub device_id: DeviceId,
    pub interval: TimeWindow,
}

/// Whether a program has a run in progress. The intervals of a run are
/// computed once, when it starts, and cover every start time and device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "intervals", rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running(Vec<DeviceInterval>),
}

impl RunState {
    pub fn intervals(&self) -> &[DeviceInterval] {
        match self {
            Self::Idle => &[],
            Self::Running(intervals) => intervals,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    /// Latest end across every interval of the run. Intervals are not
    /// assumed to be ordered by end time.
    pub fn finishes_at(&self) -> Option<DateTime<Utc>> {
        self.intervals().iter().map(|d| d.interval.end).max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub id: String,
    pub name: String,
    /// Minutes each device stays open per turn.
    pub duration: u32,
    /// Days between runs.
    pub watering_period: u32,
    pub start_times: Vec<StartTime>,
    /// Sequencing order when irrigation is not simultaneous.
    pub device_ids: Vec<DeviceId>,
    pub simultaneous_irrigation: bool,
    /// Earliest date the program may start again. `None` means today.
    pub next_run_date: Option<NaiveDate>,
    pub run_state: RunState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    /// Not running, and not starting this minute.
    Idle,
    DueToStart,
    Running,
    /// Running, and every interval has ended.
    Completed,
}

/// Intervals and next run date computed when a program starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRun {
    pub device_intervals: Vec<DeviceInterval>,
    pub next_run_date: NaiveDate,
}

impl Program {
    /// Every start time resolved for `today`, ascending.
    pub fn actual_start_times(
        &self,
        today: NaiveDate,
        sun: &SunriseSunset,
        tz: &Tz,
    ) -> Vec<DateTime<Utc>> {
        let mut starts: Vec<DateTime<Utc>> = self
            .start_times
            .iter()
            .map(|s| s.resolve(today, sun, tz))
            .collect();
        starts.sort_unstable();
        starts
    }

    /// A missing or past `next_run_date` is treated like today, so missed
    /// days (hub downtime) still run rather than being skipped forever.
    pub fn runs_on(&self, date: NaiveDate) -> bool {
        self.next_run_date.map_or(true, |next| next <= date)
    }

    /// Classify the program at `now`. `starts` must come from
    /// [`Program::actual_start_times`]; only the earliest one triggers a run.
    pub fn status(&self, starts: &[DateTime<Utc>], now: &DateTime<Tz>) -> ProgramStatus {
        let now_utc = now.with_timezone(&Utc);
        match &self.run_state {
            RunState::Running(_) => {
                // An empty run has nothing left to do; treat it as finished
                // so the stored state gets cleared.
                if self.run_state.finishes_at().map_or(true, |end| end <= now_utc) {
                    ProgramStatus::Completed
                } else {
                    ProgramStatus::Running
                }
            }
            RunState::Idle => {
                let this_minute = truncate_to_minute(now_utc);
                if self.runs_on(now.date_naive()) && starts.first() == Some(&this_minute) {
                    ProgramStatus::DueToStart
                } else {
                    ProgramStatus::Idle
                }
            }
        }
    }

    /// Lay out the whole day's run. Returns `None` when the run would be
    /// empty (no start times, no devices, zero duration).
    pub fn plan_run(&self, starts: &[DateTime<Utc>], today: NaiveDate) -> Option<PlannedRun> {
        if self.duration == 0 || self.device_ids.is_empty() || starts.is_empty() {
            return None;
        }

        let turn = TimeDelta::minutes(self.duration.into());
        let device_intervals = starts
            .iter()
            .flat_map(|&anchor| {
                self.device_ids
                    .iter()
                    .enumerate()
                    .map(move |(position, &device_id)| {
                        let start = if self.simultaneous_irrigation {
                            anchor
                        } else {
                            anchor + turn * position as i32
                        };
                        DeviceInterval {
                            device_id,
                            interval: TimeWindow {
                                start,
                                end: start + turn,
                            },
                        }
                    })
            })
            .collect();

        let next_run_date = today
            .checked_add_days(Days::new(self.watering_period.into()))
            .unwrap_or(NaiveDate::MAX);

        Some(PlannedRun {
            device_intervals,
            next_run_date,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
