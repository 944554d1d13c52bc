use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::{ConfigStore, ConfigUpdate, SettingsBackend, TimingConfig},
    error::DecodeError,
    hardware::Actuators,
    identity::DeviceIdentity,
    topics::{topic_for, Channel},
    types::{LinkMetrics, SensorSnapshot},
};

pub const MAX_INBOUND_PAYLOAD_BYTES: usize = 512;
pub const FIRMWARE_VERSION: &str = "1.0.0";
pub const EVENT_MOTION_DETECTED: &str = "motion_detected";
pub const STATUS_EXECUTED: &str = "executed";
pub const STATUS_ONLINE: &str = "online";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RelayOn,
    RelayOff,
    Buzzer { duration_ms: u64 },
    Restart,
    FactoryReset,
    Unknown { raw: String },
}

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    command: String,
    #[serde(default)]
    duration: Option<serde_json::Value>,
}

// Integers, floats and numeric strings are accepted; anything else means the default.
fn duration_ms(raw: Option<&serde_json::Value>, default_ms: u64) -> u64 {
    let parsed = match raw {
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|ms| ms.is_finite()).map(|ms| ms as i64)),
        Some(serde_json::Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|ms| ms.is_finite())
            .map(|ms| ms as i64),
        _ => None,
    };
    match parsed {
        Some(ms) => ms.max(0) as u64,
        None => {
            if let Some(value) = raw {
                warn!("unusable buzzer duration {value}, using {default_ms}ms");
            }
            default_ms
        }
    }
}

impl Command {
    pub fn decode(text: &str, default_buzzer_ms: u64) -> Result<Self, DecodeError> {
        let envelope: CommandEnvelope = serde_json::from_str(text)?;
        let command = match envelope.command.as_str() {
            "relay_on" => Self::RelayOn,
            "relay_off" => Self::RelayOff,
            "buzzer" => Self::Buzzer {
                duration_ms: duration_ms(envelope.duration.as_ref(), default_buzzer_ms),
            },
            "restart" => Self::Restart,
            "factory_reset" => Self::FactoryReset,
            _ => Self::Unknown {
                raw: envelope.command,
            },
        };
        Ok(command)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::RelayOn => "relay_on",
            Self::RelayOff => "relay_off",
            Self::Buzzer { .. } => "buzzer",
            Self::Restart => "restart",
            Self::FactoryReset => "factory_reset",
            Self::Unknown { raw } => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    fn json<T: Serialize>(topic: String, body: &T) -> serde_json::Result<Self> {
        Ok(Self {
            topic,
            payload: serde_json::to_vec(body)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct TelemetryPayload<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    timestamp: i64,
    temperature: f32,
    humidity: f32,
    pressure: f32,
    #[serde(rename = "gasResistance")]
    gas_resistance: f32,
    #[serde(rename = "lightLevel")]
    light_level: f32,
    #[serde(rename = "soundLevel")]
    sound_level: f32,
    motion: bool,
    battery: f32,
    rssi: i32,
    #[serde(rename = "freeMemory")]
    free_memory: u64,
}

#[derive(Debug, Serialize)]
struct HeartbeatPayload<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    status: &'static str,
    uptime: u64,
    #[serde(rename = "wifiRssi")]
    wifi_rssi: i32,
    #[serde(rename = "freeMemory")]
    free_memory: u64,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    event: &'a str,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct ResponsePayload<'a> {
    command: &'a str,
    status: &'static str,
    timestamp: i64,
}

pub fn build_telemetry(
    snapshot: &SensorSnapshot,
    identity: &DeviceIdentity,
    link: LinkMetrics,
) -> serde_json::Result<Message> {
    let body = TelemetryPayload {
        device_id: identity.as_str(),
        timestamp: snapshot.captured_at,
        temperature: snapshot.temperature,
        humidity: snapshot.humidity,
        pressure: snapshot.pressure,
        gas_resistance: snapshot.gas_resistance,
        light_level: snapshot.light_level,
        sound_level: snapshot.sound_level,
        motion: snapshot.motion_status,
        battery: snapshot.battery_level,
        rssi: link.rssi,
        free_memory: link.free_memory,
    };
    Message::json(topic_for(identity, Channel::Data), &body)
}

pub fn build_heartbeat(
    identity: &DeviceIdentity,
    uptime_ms: u64,
    link: LinkMetrics,
) -> serde_json::Result<Message> {
    let body = HeartbeatPayload {
        device_id: identity.as_str(),
        status: STATUS_ONLINE,
        uptime: uptime_ms,
        wifi_rssi: link.rssi,
        free_memory: link.free_memory,
        version: FIRMWARE_VERSION,
    };
    Message::json(topic_for(identity, Channel::Heartbeat), &body)
}

pub fn build_event(
    identity: &DeviceIdentity,
    event: &str,
    timestamp: i64,
) -> serde_json::Result<Message> {
    let body = EventPayload {
        device_id: identity.as_str(),
        event,
        timestamp,
    };
    Message::json(topic_for(identity, Channel::Events), &body)
}

pub fn build_response(
    identity: &DeviceIdentity,
    command: &str,
    timestamp: i64,
) -> serde_json::Result<Message> {
    let body = ResponsePayload {
        command,
        status: STATUS_EXECUTED,
        timestamp,
    };
    Message::json(topic_for(identity, Channel::Response), &body)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub response: Option<Message>,
    pub restart_requested: bool,
}

pub struct MessageRouter {
    identity: DeviceIdentity,
    buzzer_default_ms: u64,
    buzzer_max_ms: u64,
}

impl MessageRouter {
    pub fn new(identity: DeviceIdentity, timing: &TimingConfig) -> Self {
        Self {
            identity,
            buzzer_default_ms: timing.buzzer_default_ms,
            buzzer_max_ms: timing.buzzer_max_ms,
        }
    }

    pub fn handle_inbound<A, B>(
        &self,
        topic: &str,
        payload: &[u8],
        actuators: &mut A,
        store: &mut ConfigStore<B>,
        epoch_secs: i64,
    ) -> Outcome
    where
        A: Actuators + ?Sized,
        B: SettingsBackend,
    {
        let (channel, text) = match decode_inbound(topic, payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("dropping inbound message on {topic}: {err}");
                return Outcome::default();
            }
        };

        match channel {
            Channel::Commands => match Command::decode(text, self.buzzer_default_ms) {
                Ok(command) => self.dispatch(command, actuators, store, epoch_secs),
                Err(err) => {
                    warn!("dropping command on {topic}: {err}");
                    Outcome::default()
                }
            },
            Channel::Config => {
                match serde_json::from_str::<ConfigUpdate>(text) {
                    Ok(update) if update.is_empty() => info!("config update carried no fields"),
                    Ok(update) => {
                        if let Err(err) = store.apply_update(&update) {
                            warn!("config update kept in memory only: {err}");
                        }
                    }
                    Err(err) => warn!("dropping config update on {topic}: {err}"),
                }
                Outcome::default()
            }
            _ => Outcome::default(),
        }
    }

    fn dispatch<A, B>(
        &self,
        command: Command,
        actuators: &mut A,
        store: &mut ConfigStore<B>,
        epoch_secs: i64,
    ) -> Outcome
    where
        A: Actuators + ?Sized,
        B: SettingsBackend,
    {
        info!("command: {}", command.name());
        let mut restart_requested = false;

        match &command {
            Command::RelayOn => actuators.set_relay(true),
            Command::RelayOff => actuators.set_relay(false),
            Command::Buzzer { duration_ms } => {
                let pulse_ms = (*duration_ms).min(self.buzzer_max_ms);
                if pulse_ms < *duration_ms {
                    warn!("buzzer duration {duration_ms}ms clamped to {pulse_ms}ms");
                }
                actuators.set_buzzer(true);
                actuators.delay_ms(pulse_ms);
                actuators.set_buzzer(false);
            }
            Command::Restart => restart_requested = true,
            Command::FactoryReset => {
                if let Err(err) = store.clear() {
                    warn!("factory reset could not wipe settings: {err}");
                }
                restart_requested = true;
            }
            Command::Unknown { raw } => warn!("unknown command `{raw}` ignored"),
        }

        let response = match build_response(&self.identity, command.name(), epoch_secs) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!("response serialization failed: {err}");
                None
            }
        };
        Outcome {
            response,
            restart_requested,
        }
    }
}

fn decode_inbound<'a>(topic: &str, payload: &'a [u8]) -> Result<(Channel, &'a str), DecodeError> {
    if payload.len() > MAX_INBOUND_PAYLOAD_BYTES {
        return Err(DecodeError::Oversized {
            len: payload.len(),
            limit: MAX_INBOUND_PAYLOAD_BYTES,
        });
    }
    let channel = Channel::inbound_from_topic(topic)
        .ok_or_else(|| DecodeError::UnroutedTopic(topic.to_string()))?;
    let text = core::str::from_utf8(payload)?;
    Ok((channel, text))
}
