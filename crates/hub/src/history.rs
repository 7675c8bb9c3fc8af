//! Irrigation history: every device command the scheduler issues is stored
//! as an [`IrrigationEvent`], and successful ON/OFF pairs are folded back
//! into watering windows for the API.
//!
//! Pairing per device, oldest first:
//!
//! ```text
//!  ON  then OFF   -> window start..end
//!  ON  then ON    -> window start.., missing_off
//!  ON  (last)     -> start..now if the device is still on, else missing_off
//!  OFF (unpaired) -> window at the OFF time, missing_on
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::actuator::DeviceState;
use crate::db::{Db, StoreError};
use crate::program::{truncate_to_minute, DeviceId};
use crate::sequencer::CommandOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationEvent {
    pub at: DateTime<Utc>,
    pub program_id: String,
    pub device_id: DeviceId,
    pub state: DeviceState,
    /// Actuator error text; `None` when the command was accepted.
    pub error: Option<String>,
}

impl From<&CommandOutcome> for IrrigationEvent {
    fn from(outcome: &CommandOutcome) -> Self {
        Self {
            at: outcome.at,
            program_id: outcome.command.program_id.clone(),
            device_id: outcome.command.device_id,
            state: outcome.command.state,
            error: outcome.error.clone(),
        }
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, events: &[IrrigationEvent]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    /// Only the OFF was recorded; the window shows the OFF time.
    MissingOn,
    /// Only the ON was recorded; the window shows the ON time.
    MissingOff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationWindow {
    pub device_id: DeviceId,
    pub program_id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<Warning>,
    pub currently_on: bool,
}

impl IrrigationWindow {
    fn new(event: &IrrigationEvent) -> Self {
        Self {
            device_id: event.device_id,
            program_id: event.program_id.clone(),
            start: truncate_to_minute(event.at),
            end: None,
            warning: None,
            currently_on: false,
        }
    }

    fn warn(mut self, warning: Warning) -> Self {
        self.warning = Some(warning);
        self
    }
}

/// Fold one device's successful switches, oldest first, into windows.
/// `currently_on` is the device's last commanded state, used to tell a
/// running window from a lost OFF.
pub fn device_windows(
    events: &[IrrigationEvent],
    currently_on: bool,
    now: DateTime<Utc>,
) -> Vec<IrrigationWindow> {
    let mut windows = Vec::new();
    let mut i = 0;

    while i < events.len() {
        let event = &events[i];
        let next = events.get(i + 1);

        match (event.state, next.map(|n| n.state)) {
            (DeviceState::On, Some(DeviceState::Off)) => {
                let mut window = IrrigationWindow::new(event);
                window.end = next.map(|n| truncate_to_minute(n.at));
                windows.push(window);
                i += 2;
            }
            (DeviceState::On, Some(DeviceState::On)) => {
                windows.push(IrrigationWindow::new(event).warn(Warning::MissingOff));
                i += 1;
            }
            (DeviceState::On, None) if currently_on => {
                let mut window = IrrigationWindow::new(event);
                window.end = Some(truncate_to_minute(now));
                window.currently_on = true;
                windows.push(window);
                i += 1;
            }
            (DeviceState::On, None) => {
                windows.push(IrrigationWindow::new(event).warn(Warning::MissingOff));
                i += 1;
            }
            (DeviceState::Off, _) => {
                windows.push(IrrigationWindow::new(event).warn(Warning::MissingOn));
                i += 1;
            }
        }
    }

    windows
}

/// Windows for every device switched within `[start, end)`, ordered by
/// device then time. A window that straddles either bound is completed
/// with the matching switch just outside it.
pub async fn load_windows(
    db: &Db,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    is_on: impl Fn(DeviceId) -> bool,
) -> Result<Vec<IrrigationWindow>, StoreError> {
    let mut by_device: BTreeMap<DeviceId, Vec<IrrigationEvent>> = BTreeMap::new();
    for event in db.switches_between(start, end).await? {
        by_device.entry(event.device_id).or_default().push(event);
    }

    for (device_id, events) in by_device.iter_mut() {
        if events.first().is_some_and(|e| e.state == DeviceState::Off) {
            if let Some(prev) = db.last_switch_before(*device_id, start).await? {
                if prev.state == DeviceState::On {
                    events.insert(0, prev);
                }
            }
        }
        if events.last().is_some_and(|e| e.state == DeviceState::On) {
            if let Some(next) = db.first_switch_after(*device_id, end).await? {
                if next.state == DeviceState::Off {
                    events.push(next);
                }
            }
        }
    }

    Ok(by_device
        .into_iter()
        .flat_map(|(device_id, events)| device_windows(&events, is_on(device_id), now))
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, hour, minute, second).unwrap()
    }

    fn switch(device_id: DeviceId, state: DeviceState, at: DateTime<Utc>) -> IrrigationEvent {
        IrrigationEvent {
            at,
            program_id: "lawn".into(),
            device_id,
            state,
            error: None,
        }
    }

    fn on(at: DateTime<Utc>) -> IrrigationEvent {
        switch(1, DeviceState::On, at)
    }

    fn off(at: DateTime<Utc>) -> IrrigationEvent {
        switch(1, DeviceState::Off, at)
    }

    // -- Pairing -------------------------------------------------------------

    #[test]
    fn on_then_off_is_one_window_truncated_to_minutes() {
        let windows = device_windows(&[on(t(7, 0, 2)), off(t(7, 15, 1))], false, t(9, 0, 0));

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, t(7, 0, 0));
        assert_eq!(windows[0].end, Some(t(7, 15, 0)));
        assert_eq!(windows[0].warning, None);
        assert!(!windows[0].currently_on);
    }

    #[test]
    fn two_ons_in_a_row_flag_missing_off() {
        let windows = device_windows(
            &[on(t(7, 0, 0)), on(t(8, 0, 0)), off(t(8, 15, 0))],
            false,
            t(9, 0, 0),
        );

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].warning, Some(Warning::MissingOff));
        assert_eq!(windows[0].end, None);
        assert_eq!(windows[1].start, t(8, 0, 0));
        assert_eq!(windows[1].end, Some(t(8, 15, 0)));
    }

    #[test]
    fn trailing_on_runs_until_now_while_device_is_on() {
        let windows = device_windows(&[on(t(7, 0, 0))], true, t(7, 9, 30));

        assert_eq!(windows[0].end, Some(t(7, 9, 0)));
        assert!(windows[0].currently_on);
        assert_eq!(windows[0].warning, None);
    }

    #[test]
    fn trailing_on_with_device_off_flags_missing_off() {
        let windows = device_windows(&[on(t(7, 0, 0))], false, t(7, 9, 30));

        assert_eq!(windows[0].warning, Some(Warning::MissingOff));
        assert!(!windows[0].currently_on);
    }

    #[test]
    fn unpaired_off_flags_missing_on() {
        let windows = device_windows(
            &[off(t(7, 15, 0)), on(t(8, 0, 0)), off(t(8, 5, 0))],
            false,
            t(9, 0, 0),
        );

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, t(7, 15, 0));
        assert_eq!(windows[0].warning, Some(Warning::MissingOn));
        assert_eq!(windows[1].warning, None);
    }

    #[test]
    fn warning_serializes_as_code() {
        let window = IrrigationWindow::new(&off(t(7, 0, 0))).warn(Warning::MissingOn);
        let json = serde_json::to_value(window).unwrap();
        assert_eq!(json["warning"], "missing_on");

        let json = serde_json::to_value(IrrigationWindow::new(&on(t(7, 0, 0)))).unwrap();
        assert!(json.get("warning").is_none());
    }

    // -- Loading from the store ----------------------------------------------

    async fn db_with(events: &[IrrigationEvent]) -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.append(events).await.unwrap();
        db
    }

    #[tokio::test]
    async fn windows_straddling_the_range_are_completed() {
        let db = db_with(&[
            on(t(5, 50, 0)),
            off(t(6, 5, 0)),
            on(t(6, 50, 0)),
            off(t(7, 5, 0)),
            switch(2, DeviceState::On, t(6, 30, 0)),
        ])
        .await;

        let windows = load_windows(&db, t(6, 0, 0), t(7, 0, 0), t(9, 0, 0), |_| false)
            .await
            .unwrap();

        assert_eq!(windows.len(), 3);
        assert_eq!((windows[0].start, windows[0].end), (t(5, 50, 0), Some(t(6, 5, 0))));
        assert_eq!((windows[1].start, windows[1].end), (t(6, 50, 0), Some(t(7, 5, 0))));
        assert_eq!(windows[2].device_id, 2);
        assert_eq!(windows[2].warning, Some(Warning::MissingOff));
    }

    #[tokio::test]
    async fn failed_commands_are_not_paired() {
        let mut failed_off = off(t(7, 15, 0));
        failed_off.error = Some("device 1 rejected command with status 503".into());
        let db = db_with(&[on(t(7, 0, 0)), failed_off]).await;

        let windows = load_windows(&db, t(6, 0, 0), t(8, 0, 0), t(9, 0, 0), |id| id == 1)
            .await
            .unwrap();

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].end, Some(t(9, 0, 0)));
        assert!(windows[0].currently_on);
    }
}
