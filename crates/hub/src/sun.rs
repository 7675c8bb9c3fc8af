//! Sunrise/sunset times for a calendar date: the value the start-time
//! resolver consumes, the configured fallback pair, and an HTTP source
//! (sunrise-sunset.org) cached per date in SQLite.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::Db;
use crate::program::{local_to_utc, truncate_to_minute, SolarAnchor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunriseSunset {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
}

impl SunriseSunset {
    pub fn anchor(&self, anchor: SolarAnchor) -> DateTime<Utc> {
        match anchor {
            SolarAnchor::Sunrise => self.sunrise,
            SolarAnchor::Sunset => self.sunset,
        }
    }
}

/// Configured fallback used whenever the source cannot answer. Stored as
/// wall-clock times and placed on the requested date each time it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultSunTimes {
    pub sunrise: NaiveTime,
    pub sunset: NaiveTime,
}

impl DefaultSunTimes {
    pub fn for_date(&self, date: NaiveDate, tz: &Tz) -> SunriseSunset {
        SunriseSunset {
            sunrise: truncate_to_minute(local_to_utc(tz, date.and_time(self.sunrise))),
            sunset: truncate_to_minute(local_to_utc(tz, date.and_time(self.sunset))),
        }
    }
}

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SourceUnavailable {
    #[error("sunrise/sunset request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sunrise/sunset api returned status {0}")]
    Status(String),

    #[error("sunrise/sunset api returned malformed results: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait SunriseSunsetSource: Send + Sync {
    async fn get(&self, date: NaiveDate) -> Result<SunriseSunset, SourceUnavailable>;
}

// ---------------------------------------------------------------------------
// sunrise-sunset.org client
// ---------------------------------------------------------------------------

/// On errors the api sends `"results": ""`, so results are only decoded
/// once the status says OK.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    results: serde_json::Value,
    status: String,
}

/// With `formatted=0` both values are ISO 8601 instants.
#[derive(Debug, Deserialize)]
struct ApiResults {
    sunrise: DateTime<FixedOffset>,
    sunset: DateTime<FixedOffset>,
}

fn into_sun_times(response: ApiResponse) -> Result<SunriseSunset, SourceUnavailable> {
    if response.status != "OK" {
        return Err(SourceUnavailable::Status(response.status));
    }
    let results: ApiResults = serde_json::from_value(response.results)
        .map_err(|e| SourceUnavailable::Malformed(e.to_string()))?;
    Ok(SunriseSunset {
        sunrise: results.sunrise.with_timezone(&Utc),
        sunset: results.sunset.with_timezone(&Utc),
    })
}

pub struct SunriseSunsetApi {
    client: reqwest::Client,
    url: String,
    latitude: f64,
    longitude: f64,
    tzid: String,
    cache: Option<Db>,
}

impl SunriseSunsetApi {
    pub fn new(
        url: &str,
        latitude: f64,
        longitude: f64,
        tzid: &str,
        cache: Option<Db>,
    ) -> Result<Self, SourceUnavailable> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            latitude,
            longitude,
            tzid: tzid.to_string(),
            cache,
        })
    }

    async fn fetch(&self, date: NaiveDate) -> Result<SunriseSunset, SourceUnavailable> {
        let response: ApiResponse = self
            .client
            .get(&self.url)
            .query(&[
                ("lat", self.latitude.to_string()),
                ("lng", self.longitude.to_string()),
                ("formatted", "0".to_string()),
                ("date", date.format("%Y-%m-%d").to_string()),
                ("tzid", self.tzid.clone()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        into_sun_times(response)
    }
}

#[async_trait]
impl SunriseSunsetSource for SunriseSunsetApi {
    async fn get(&self, date: NaiveDate) -> Result<SunriseSunset, SourceUnavailable> {
        if let Some(db) = &self.cache {
            match db.get_sun_times(date).await {
                Ok(Some(cached)) => return Ok(cached),
                Ok(None) => {}
                Err(e) => warn!(%date, "sunrise/sunset cache read failed: {e}"),
            }
        }

        let fetched = self.fetch(date).await?;
        debug!(%date, sunrise = %fetched.sunrise, sunset = %fetched.sunset, "fetched sunrise/sunset");

        if let Some(db) = &self.cache {
            if let Err(e) = db.put_sun_times(date, &fetched).await {
                warn!(%date, "sunrise/sunset cache write failed: {e}");
            }
        }
        Ok(fetched)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
