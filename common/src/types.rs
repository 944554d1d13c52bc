use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    #[serde(rename = "gasResistance")]
    pub gas_resistance: f32,
    #[serde(rename = "lightLevel")]
    pub light_level: f32,
    #[serde(rename = "soundLevel")]
    pub sound_level: f32,
    #[serde(rename = "motionStatus")]
    pub motion_status: bool,
    #[serde(rename = "batteryLevel")]
    pub battery_level: f32,
    #[serde(rename = "capturedAt")]
    pub captured_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkMetrics {
    pub rssi: i32,
    pub free_memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    NetworkJoining,
    NetworkJoined,
    BrokerConnecting,
    BrokerSessionActive,
    ConfigAccessPointActive,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::NetworkJoining => "NETWORK_JOINING",
            Self::NetworkJoined => "NETWORK_JOINED",
            Self::BrokerConnecting => "BROKER_CONNECTING",
            Self::BrokerSessionActive => "BROKER_SESSION_ACTIVE",
            Self::ConfigAccessPointActive => "CONFIG_ACCESS_POINT_ACTIVE",
        }
    }
}

impl core::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTime {
    pub monotonic_ms: u64,
    pub epoch_secs: i64,
}
