//! TOML config file loading, environment overrides, validation, and
//! database seeding for irrigation programs.

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::Db;
use crate::program::{parse_clock_time, DeviceId, Program, RunState, StartTime};
use crate::scheduler::SchedulerConfig;
use crate::sun::DefaultSunTimes;

/// Every command plus its pause has to fit inside one tick.
const MAX_METERING_INTERVAL_MS: u64 = 60_000;

const MAX_NAME_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub sunrise_sunset: Option<SunriseSunsetSection>,
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub timezone: String,
    pub default_sunrise: String,
    pub default_sunset: String,
    pub metering_interval_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            timezone: "UTC".into(),
            default_sunrise: "06:30".into(),
            default_sunset: "18:30".into(),
            metering_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActuatorConfig {
    MakerApi {
        url: String,
        access_token: String,
    },
    Mqtt {
        #[serde(default = "default_mqtt_host")]
        host: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default = "default_mqtt_client_id")]
        client_id: String,
    },
    #[default]
    DryRun,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".into()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "irrigation-scheduler".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SunriseSunsetSection {
    #[serde(default = "default_sunrise_sunset_url")]
    pub url: String,
    pub latitude: f64,
    pub longitude: f64,
}

fn default_sunrise_sunset_url() -> String {
    "https://api.sunrise-sunset.org/json".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramEntry {
    pub id: String,
    pub name: String,
    pub duration: i64,
    pub watering_period: i64,
    pub start_times: Vec<String>,
    pub device_ids: Vec<i64>,
    #[serde(default)]
    pub simultaneous_irrigation: bool,
    #[serde(default)]
    pub next_run_date: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply the recognised environment variables on top of the file.
    /// `get` is `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("DEFAULT_SUNRISE_TIME") {
            self.scheduler.default_sunrise = v;
        }
        if let Some(v) = get("DEFAULT_SUNSET_TIME") {
            self.scheduler.default_sunset = v;
        }
        if let Some(v) = get("SCHEDULER_TIMEZONE") {
            self.scheduler.timezone = v;
        }
        if let Some(v) = get("SWITCH_METERING_INTERVAL") {
            self.scheduler.metering_interval_ms = v
                .trim()
                .parse()
                .with_context(|| format!("SWITCH_METERING_INTERVAL is not a number: {v:?}"))?;
        }

        let env_url = get("MAKER_API_URL");
        let env_token = get("MAKER_API_ACCESS_TOKEN");
        if env_url.is_some() || env_token.is_some() {
            let (url, access_token) = match &self.actuator {
                ActuatorConfig::MakerApi { url, access_token } => {
                    (url.clone(), access_token.clone())
                }
                _ => (String::new(), String::new()),
            };
            self.actuator = ActuatorConfig::MakerApi {
                url: env_url.unwrap_or(url),
                access_token: env_token.unwrap_or(access_token),
            };
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_scheduler(&mut errors);
        self.validate_actuator(&mut errors);
        self.validate_sunrise_sunset(&mut errors);
        self.validate_programs(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;

        if s.timezone.parse::<Tz>().is_err() {
            errors.push(format!(
                "scheduler: timezone '{}' is not an IANA timezone name",
                s.timezone
            ));
        }
        if parse_clock_time(&s.default_sunrise).is_none() {
            errors.push(format!(
                "scheduler: default_sunrise '{}' is not HH:MM",
                s.default_sunrise
            ));
        }
        if parse_clock_time(&s.default_sunset).is_none() {
            errors.push(format!(
                "scheduler: default_sunset '{}' is not HH:MM",
                s.default_sunset
            ));
        }
        if s.metering_interval_ms >= MAX_METERING_INTERVAL_MS {
            errors.push(format!(
                "scheduler: metering_interval_ms {} must be below {MAX_METERING_INTERVAL_MS}",
                s.metering_interval_ms
            ));
        }
    }

    fn validate_actuator(&self, errors: &mut Vec<String>) {
        match &self.actuator {
            ActuatorConfig::MakerApi { url, access_token } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(format!("actuator: maker_api url '{url}' is not an http(s) url"));
                }
                if access_token.trim().is_empty() {
                    errors.push("actuator: maker_api access_token is empty".into());
                }
            }
            ActuatorConfig::Mqtt {
                host,
                port,
                client_id,
            } => {
                if host.trim().is_empty() {
                    errors.push("actuator: mqtt host is empty".into());
                }
                if *port == 0 {
                    errors.push("actuator: mqtt port must be non-zero".into());
                }
                if client_id.trim().is_empty() {
                    errors.push("actuator: mqtt client_id is empty".into());
                }
            }
            ActuatorConfig::DryRun => {}
        }
    }

    fn validate_sunrise_sunset(&self, errors: &mut Vec<String>) {
        let Some(s) = &self.sunrise_sunset else {
            return;
        };
        if s.url.trim().is_empty() {
            errors.push("sunrise_sunset: url is empty".into());
        }
        if !(-90.0..=90.0).contains(&s.latitude) {
            errors.push(format!(
                "sunrise_sunset: latitude {} out of range [-90, 90]",
                s.latitude
            ));
        }
        if !(-180.0..=180.0).contains(&s.longitude) {
            errors.push(format!(
                "sunrise_sunset: longitude {} out of range [-180, 180]",
                s.longitude
            ));
        }
    }

    fn validate_programs(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.programs.iter().enumerate() {
            let ctx = || {
                if p.id.is_empty() {
                    format!("programs[{i}]")
                } else {
                    format!("program '{}'", p.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&p.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if p.name.chars().count() > MAX_NAME_LEN {
                errors.push(format!(
                    "{}: name is longer than {MAX_NAME_LEN} characters",
                    ctx()
                ));
            }

            // ── Timing ──────────────────────────────────────────
            if p.duration <= 0 || u32::try_from(p.duration).is_err() {
                errors.push(format!(
                    "{}: duration must be a positive number of minutes, got {}",
                    ctx(),
                    p.duration
                ));
            }
            if p.watering_period <= 0 || u32::try_from(p.watering_period).is_err() {
                errors.push(format!(
                    "{}: watering_period must be a positive number of days, got {}",
                    ctx(),
                    p.watering_period
                ));
            }

            if p.start_times.is_empty() {
                errors.push(format!("{}: start_times is empty", ctx()));
            }
            for s in &p.start_times {
                if let Err(e) = s.parse::<StartTime>() {
                    errors.push(format!("{}: {e}", ctx()));
                }
            }

            if let Some(date) = &p.next_run_date {
                if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
                    errors.push(format!(
                        "{}: next_run_date '{date}' is not YYYY-MM-DD",
                        ctx()
                    ));
                }
            }

            // ── Devices ─────────────────────────────────────────
            if p.device_ids.is_empty() {
                errors.push(format!("{}: device_ids is empty", ctx()));
            }
            let mut seen_devices: HashSet<i64> = HashSet::new();
            for &d in &p.device_ids {
                if d <= 0 || DeviceId::try_from(d).is_err() {
                    errors.push(format!("{}: device id {d} out of range", ctx()));
                } else if !seen_devices.insert(d) {
                    errors.push(format!("{}: device id {d} listed twice", ctx()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl Config {
    /// Scheduler settings. Call after [`Config::validate`].
    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let s = &self.scheduler;
        let timezone: Tz = s
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid timezone '{}': {e}", s.timezone))?;
        let sunrise = parse_clock_time(&s.default_sunrise)
            .with_context(|| format!("invalid default_sunrise '{}'", s.default_sunrise))?;
        let sunset = parse_clock_time(&s.default_sunset)
            .with_context(|| format!("invalid default_sunset '{}'", s.default_sunset))?;

        Ok(SchedulerConfig {
            timezone,
            default_sun: DefaultSunTimes { sunrise, sunset },
            metering_interval: Duration::from_millis(s.metering_interval_ms),
        })
    }
}

impl ProgramEntry {
    pub fn to_program(&self) -> Result<Program> {
        let start_times = self
            .start_times
            .iter()
            .map(|s| s.parse::<StartTime>())
            .collect::<Result<Vec<_>, _>>()?;
        let device_ids = self
            .device_ids
            .iter()
            .map(|&d| DeviceId::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("program '{}': device id out of range", self.id))?;
        let next_run_date = self
            .next_run_date
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .with_context(|| format!("program '{}': invalid next_run_date", self.id))?;

        Ok(Program {
            id: self.id.clone(),
            name: self.name.clone(),
            duration: u32::try_from(self.duration)
                .with_context(|| format!("program '{}': invalid duration", self.id))?,
            watering_period: u32::try_from(self.watering_period)
                .with_context(|| format!("program '{}': invalid watering_period", self.id))?,
            start_times,
            device_ids,
            simultaneous_irrigation: self.simultaneous_irrigation,
            next_run_date,
            run_state: RunState::Idle,
        })
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, apply process env overrides, and validate a config file.
pub fn load(path: &str) -> Result<Config> {
    load_with_env(path, |key| std::env::var(key).ok())
}

pub fn load_with_env<F>(path: &str, get: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env_overrides(get)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every program definition from the config into the database.
/// Run state already stored for a program is left alone.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for entry in &config.programs {
        let program = entry.to_program()?;
        db.upsert_program(&program)
            .await
            .with_context(|| format!("failed to upsert program '{}'", entry.id))?;
    }

    tracing::info!(programs = config.programs.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_program() -> ProgramEntry {
        ProgramEntry {
            id: "front-lawn".into(),
            name: "Front lawn".into(),
            duration: 15,
            watering_period: 2,
            start_times: vec!["07:00".into(), "sunset-30".into()],
            device_ids: vec![1, 2],
            simultaneous_irrigation: false,
            next_run_date: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            programs: vec![valid_program()],
            ..Default::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[scheduler]
timezone = "America/Phoenix"
default_sunrise = "05:45"
metering_interval_ms = 750

[actuator]
kind = "maker_api"
url = "http://hub.local/apps/api/1/devices"
access_token = "secret"

[sunrise_sunset]
latitude = 33.45
longitude = -112.07

[[programs]]
id = "front-lawn"
name = "Front lawn"
duration = 15
watering_period = 2
start_times = ["07:00", "sunset-30"]
device_ids = [1, 2]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.timezone, "America/Phoenix");
        assert_eq!(config.scheduler.default_sunrise, "05:45");
        assert_eq!(config.scheduler.default_sunset, "18:30");
        assert_eq!(config.scheduler.metering_interval_ms, 750);
        assert!(matches!(config.actuator, ActuatorConfig::MakerApi { .. }));
        let sun = config.sunrise_sunset.as_ref().unwrap();
        assert_eq!(sun.url, "https://api.sunrise-sunset.org/json");
        assert_eq!(config.programs.len(), 1);
        assert!(!config.programs[0].simultaneous_irrigation);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.timezone, "UTC");
        assert_eq!(config.scheduler.default_sunrise, "06:30");
        assert_eq!(config.scheduler.metering_interval_ms, 500);
        assert_eq!(config.actuator, ActuatorConfig::DryRun);
        assert!(config.sunrise_sunset.is_none());
        assert!(config.programs.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_mqtt_actuator_defaults() {
        let config: Config = toml::from_str("[actuator]\nkind = \"mqtt\"\n").unwrap();
        assert_eq!(
            config.actuator,
            ActuatorConfig::Mqtt {
                host: "127.0.0.1".into(),
                port: 1883,
                client_id: "irrigation-scheduler".into(),
            }
        );
    }

    #[test]
    fn parse_unknown_actuator_kind_fails() {
        assert!(toml::from_str::<Config>("[actuator]\nkind = \"carrier_pigeon\"\n").is_err());
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_scheduler_values() {
        let mut cfg = valid_config();
        cfg.apply_env_overrides(env(&[
            ("DEFAULT_SUNRISE_TIME", "05:00"),
            ("DEFAULT_SUNSET_TIME", "20:15"),
            ("SWITCH_METERING_INTERVAL", "1200"),
            ("SCHEDULER_TIMEZONE", "Europe/Berlin"),
        ]))
        .unwrap();

        assert_eq!(cfg.scheduler.default_sunrise, "05:00");
        assert_eq!(cfg.scheduler.default_sunset, "20:15");
        assert_eq!(cfg.scheduler.metering_interval_ms, 1200);
        assert_eq!(cfg.scheduler.timezone, "Europe/Berlin");
        cfg.validate().unwrap();
    }

    #[test]
    fn env_metering_must_be_numeric() {
        let mut cfg = valid_config();
        let err = cfg
            .apply_env_overrides(env(&[("SWITCH_METERING_INTERVAL", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("SWITCH_METERING_INTERVAL"));
    }

    #[test]
    fn env_maker_api_switches_actuator() {
        let mut cfg = valid_config();
        cfg.apply_env_overrides(env(&[
            ("MAKER_API_URL", "http://10.0.0.2/apps/api/3/devices"),
            ("MAKER_API_ACCESS_TOKEN", "abc"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.actuator,
            ActuatorConfig::MakerApi {
                url: "http://10.0.0.2/apps/api/3/devices".into(),
                access_token: "abc".into(),
            }
        );
    }

    #[test]
    fn env_token_alone_keeps_file_url() {
        let mut cfg = valid_config();
        cfg.actuator = ActuatorConfig::MakerApi {
            url: "http://hub.local/devices".into(),
            access_token: "old".into(),
        };
        cfg.apply_env_overrides(env(&[("MAKER_API_ACCESS_TOKEN", "new")]))
            .unwrap();
        assert_eq!(
            cfg.actuator,
            ActuatorConfig::MakerApi {
                url: "http://hub.local/devices".into(),
                access_token: "new".into(),
            }
        );
    }

    #[test]
    fn no_env_leaves_config_untouched() {
        let mut cfg = valid_config();
        cfg.apply_env_overrides(env(&[])).unwrap();
        assert_eq!(cfg.actuator, ActuatorConfig::DryRun);
        assert_eq!(cfg.scheduler.metering_interval_ms, 500);
    }

    // -- Validation: scheduler / actuator / sunrise_sunset ----------------

    #[test]
    fn unknown_timezone_rejected() {
        let mut cfg = valid_config();
        cfg.scheduler.timezone = "Mars/Olympus_Mons".into();
        assert_validation_err(&cfg, "not an IANA timezone");
    }

    #[test]
    fn bad_default_sun_times_rejected() {
        let mut cfg = valid_config();
        cfg.scheduler.default_sunrise = "6:30".into();
        cfg.scheduler.default_sunset = "24:00".into();
        assert_validation_err(&cfg, "default_sunrise '6:30'");
        assert_validation_err(&cfg, "default_sunset '24:00'");
    }

    #[test]
    fn metering_interval_bounded_by_tick() {
        let mut cfg = valid_config();
        cfg.scheduler.metering_interval_ms = 60_000;
        assert_validation_err(&cfg, "metering_interval_ms");
    }

    #[test]
    fn maker_api_requires_url_and_token() {
        let mut cfg = valid_config();
        cfg.actuator = ActuatorConfig::MakerApi {
            url: "hub.local".into(),
            access_token: " ".into(),
        };
        assert_validation_err(&cfg, "not an http(s) url");
        assert_validation_err(&cfg, "access_token is empty");
    }

    #[test]
    fn mqtt_port_zero_rejected() {
        let mut cfg = valid_config();
        cfg.actuator = ActuatorConfig::Mqtt {
            host: "broker".into(),
            port: 0,
            client_id: "hub".into(),
        };
        assert_validation_err(&cfg, "mqtt port");
    }

    #[test]
    fn coordinates_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.sunrise_sunset = Some(SunriseSunsetSection {
            url: default_sunrise_sunset_url(),
            latitude: 91.0,
            longitude: -181.0,
        });
        assert_validation_err(&cfg, "latitude 91");
        assert_validation_err(&cfg, "longitude -181");
    }

    // -- Validation: programs ---------------------------------------------

    #[test]
    fn program_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].id = "".into();
        assert_validation_err(&cfg, "programs[0]: id is empty");
    }

    #[test]
    fn program_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.programs.push(valid_program());
        assert_validation_err(&cfg, "duplicate id");
    }

    #[test]
    fn program_name_length_checked() {
        let mut cfg = valid_config();
        cfg.programs[0].name = "x".repeat(256);
        assert_validation_err(&cfg, "longer than 255");

        cfg.programs[0].name = "x".repeat(255);
        cfg.validate().unwrap();
    }

    #[test]
    fn program_non_positive_timing_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].duration = 0;
        cfg.programs[0].watering_period = -1;
        assert_validation_err(&cfg, "duration must be a positive");
        assert_validation_err(&cfg, "watering_period must be a positive");
    }

    #[test]
    fn program_bad_start_time_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].start_times = vec!["07:00".into(), "noon".into()];
        assert_validation_err(&cfg, "invalid start time 'noon'");
    }

    #[test]
    fn program_needs_start_times_and_devices() {
        let mut cfg = valid_config();
        cfg.programs[0].start_times.clear();
        cfg.programs[0].device_ids.clear();
        assert_validation_err(&cfg, "start_times is empty");
        assert_validation_err(&cfg, "device_ids is empty");
    }

    #[test]
    fn program_device_ids_checked() {
        let mut cfg = valid_config();
        cfg.programs[0].device_ids = vec![3, 0, 3, 5_000_000_000];
        assert_validation_err(&cfg, "device id 0 out of range");
        assert_validation_err(&cfg, "device id 3 listed twice");
        assert_validation_err(&cfg, "device id 5000000000 out of range");
    }

    #[test]
    fn program_bad_next_run_date_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].next_run_date = Some("06/01/2026".into());
        assert_validation_err(&cfg, "next_run_date '06/01/2026'");
    }

    #[test]
    fn all_errors_are_reported_together() {
        let mut cfg = valid_config();
        cfg.scheduler.timezone = "Nowhere".into();
        cfg.programs[0].duration = 0;
        cfg.programs[0].device_ids.clear();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    // -- Conversions ------------------------------------------------------

    #[test]
    fn scheduler_config_from_defaults() {
        let cfg = valid_config();
        let sc = cfg.scheduler_config().unwrap();
        assert_eq!(sc.timezone, chrono_tz::UTC);
        assert_eq!(sc.metering_interval, Duration::from_millis(500));
        assert_eq!(sc.default_sun.sunrise.to_string(), "06:30:00");
        assert_eq!(sc.default_sun.sunset.to_string(), "18:30:00");
    }

    #[test]
    fn program_entry_converts() {
        let mut entry = valid_program();
        entry.next_run_date = Some("2026-06-03".into());
        let p = entry.to_program().unwrap();
        assert_eq!(p.id, "front-lawn");
        assert_eq!(p.duration, 15);
        assert_eq!(p.device_ids, vec![1, 2]);
        assert_eq!(p.start_times.len(), 2);
        assert_eq!(p.next_run_date, NaiveDate::from_ymd_opt(2026, 6, 3));
        assert_eq!(p.run_state, RunState::Idle);
    }

    // -- Load + apply -----------------------------------------------------

    #[test]
    fn load_missing_file_fails() {
        let err = load_with_env("/nonexistent/irrigation.toml", |_| None).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn load_reads_file_and_env() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-config-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "[scheduler]\ntimezone = \"America/Phoenix\"\n\n[[programs]]\nid = \"a\"\nname = \"A\"\nduration = 5\nwatering_period = 1\nstart_times = [\"sunrise\"]\ndevice_ids = [9]\n",
        )
        .unwrap();

        let cfg = load_with_env(path.to_str().unwrap(), env(&[("DEFAULT_SUNSET_TIME", "19:00")]))
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cfg.scheduler.timezone, "America/Phoenix");
        assert_eq!(cfg.scheduler.default_sunset, "19:00");
        assert_eq!(cfg.programs[0].device_ids, vec![9]);
    }

    #[tokio::test]
    async fn apply_seeds_programs() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        apply(&valid_config(), &db).await.unwrap();
        apply(&valid_config(), &db).await.unwrap();

        let programs = db.load_programs().await.unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].name, "Front lawn");
        assert_eq!(programs[0].run_state, RunState::Idle);
    }
}
