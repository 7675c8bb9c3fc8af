//! Switching devices on and off. The scheduler only sees the [`Actuator`]
//! trait; the backend is picked by `[actuator] kind` in the config file.
//!
//! - `maker_api`: Hubitat Maker API, `GET {url}/{device_id}/{on|off}`
//! - `mqtt`: publishes `ON`/`OFF` to `valve/<device_id>/set`
//! - `dry_run`: remembers the last state per device and logs it

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ActuatorConfig;
use crate::program::DeviceId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    /// Path segment used by the Maker API.
    pub fn as_path(self) -> &'static str {
        match self {
            DeviceState::On => "on",
            DeviceState::Off => "off",
        }
    }

    /// MQTT payload.
    pub fn as_payload(self) -> &'static str {
        match self {
            DeviceState::On => "ON",
            DeviceState::Off => "OFF",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_payload())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("device request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device {device_id} rejected command with status {status}")]
    Rejected { device_id: DeviceId, status: u16 },

    #[error("mqtt publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

#[async_trait]
pub trait Actuator: Send + Sync {
    async fn set_state(&self, device_id: DeviceId, state: DeviceState)
        -> Result<(), ActuatorError>;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Maker API
// ---------------------------------------------------------------------------

/// No `Debug`: the access token must not end up in logs.
pub struct MakerApiClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl MakerApiClient {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, ActuatorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn command_url(&self, device_id: DeviceId, state: DeviceState) -> String {
        format!("{}/{device_id}/{}", self.base_url, state.as_path())
    }
}

#[async_trait]
impl Actuator for MakerApiClient {
    async fn set_state(
        &self,
        device_id: DeviceId,
        state: DeviceState,
    ) -> Result<(), ActuatorError> {
        let response = self
            .client
            .get(self.command_url(device_id, state))
            .query(&[("access_token", &self.access_token)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ActuatorError::Rejected {
                device_id,
                status: status.as_u16(),
            });
        }
        debug!(device_id, %state, "maker api command accepted");
        Ok(())
    }

    fn name(&self) -> &str {
        "maker_api"
    }
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// Topic a valve node listens on.
pub fn valve_topic(device_id: DeviceId) -> String {
    format!("valve/{device_id}/set")
}

pub struct MqttActuator {
    client: AsyncClient,
}

impl MqttActuator {
    /// Connect and drive the event loop on a background task.
    pub fn connect(host: &str, port: u16, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 20);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt connected"),
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. reconnecting...");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client }
    }

    #[cfg(test)]
    fn from_client(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Actuator for MqttActuator {
    async fn set_state(
        &self,
        device_id: DeviceId,
        state: DeviceState,
    ) -> Result<(), ActuatorError> {
        self.client
            .publish(
                valve_topic(device_id),
                QoS::AtLeastOnce,
                false,
                state.as_payload(),
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "mqtt"
    }
}

// ---------------------------------------------------------------------------
// Dry run (no hardware)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DryRunActuator {
    devices: Mutex<HashMap<DeviceId, DeviceState>>,
}

impl DryRunActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last state sent to a device, `None` if it was never switched.
    #[cfg(test)]
    pub fn state_of(&self, device_id: DeviceId) -> Option<DeviceState> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.get(&device_id).copied()
    }
}

#[async_trait]
impl Actuator for DryRunActuator {
    async fn set_state(
        &self,
        device_id: DeviceId,
        state: DeviceState,
    ) -> Result<(), ActuatorError> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.insert(device_id, state);
        info!(device_id, %state, "[dry-run] device switched");
        Ok(())
    }

    fn name(&self) -> &str {
        "dry_run"
    }
}

// ---------------------------------------------------------------------------
// Construction from config
// ---------------------------------------------------------------------------

pub fn from_config(cfg: &ActuatorConfig) -> Result<Arc<dyn Actuator>> {
    let actuator: Arc<dyn Actuator> = match cfg {
        ActuatorConfig::MakerApi { url, access_token } => {
            Arc::new(MakerApiClient::new(url, access_token)?)
        }
        ActuatorConfig::Mqtt {
            host,
            port,
            client_id,
        } => Arc::new(MqttActuator::connect(host, *port, client_id)),
        ActuatorConfig::DryRun => Arc::new(DryRunActuator::new()),
    };
    info!(backend = actuator.name(), "actuator ready");
    Ok(actuator)
}

// ===========================================================================
// Tests
// ===========================================================================
