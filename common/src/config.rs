use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;

pub const SETTINGS_NAMESPACE: &str = "iot-config";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_SAMPLING_INTERVAL_MS: &str = "sample_ms";

pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 30_000;
pub const MIN_SAMPLING_INTERVAL_MS: u64 = 1_000;
pub const MAX_SAMPLING_INTERVAL_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub button_hold_ms: u64,
    pub buzzer_default_ms: u64,
    pub buzzer_max_ms: u64,
    pub tick_quantum_ms: u64,
    pub max_inbound_per_tick: usize,
    pub network_join_attempts: u32,
    pub network_join_backoff_ms: u64,
    pub broker_retry_backoff_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 60_000,
            button_hold_ms: 5_000,
            buzzer_default_ms: 1_000,
            buzzer_max_ms: 5_000,
            tick_quantum_ms: 100,
            max_inbound_per_tick: 8,
            network_join_attempts: 5,
            network_join_backoff_ms: 3_000,
            broker_retry_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "mqtt.iot-system.com".to_string(),
            port: 8883,
            user: String::new(),
            pass: String::new(),
            tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub status_led: i32,
    pub config_button: i32,
    pub motion: i32,
    pub one_wire: i32,
    pub dht: i32,
    pub relay: i32,
    pub buzzer: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            status_led: 2,
            config_button: 0,
            motion: 4,
            one_wire: 5,
            dht: 16,
            relay: 6,
            buzzer: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub timing: TimingConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub pins: PinConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub sampling_interval_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
        }
    }
}

impl NodeSettings {
    pub fn sanitize(&mut self) {
        self.sampling_interval_ms = self
            .sampling_interval_ms
            .clamp(MIN_SAMPLING_INTERVAL_MS, MAX_SAMPLING_INTERVAL_MS);
    }

    pub fn has_network_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "samplingIntervalMs", default)]
    pub sampling_interval_ms: Option<u64>,
    #[serde(rename = "wifiSsid", default)]
    pub network_ssid: Option<String>,
    #[serde(rename = "wifiPassword", default)]
    pub network_password: Option<String>,
}

impl ConfigUpdate {
    pub fn changes_network(&self) -> bool {
        self.network_ssid.is_some() || self.network_password.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.sampling_interval_ms.is_none()
            && self.network_ssid.is_none()
            && self.network_password.is_none()
    }
}

pub trait SettingsBackend {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;
}

// Memory holds what the operator asked for; keys the backend rejected are rewritten on the
// next update.
pub struct ConfigStore<B> {
    backend: B,
    current: NodeSettings,
    unpersisted: Vec<&'static str>,
}

impl<B: SettingsBackend> ConfigStore<B> {
    pub fn open(backend: B) -> Self {
        let mut store = Self {
            backend,
            current: NodeSettings::default(),
            unpersisted: Vec::new(),
        };
        store.current = store.load().unwrap_or_else(|err| {
            warn!("failed to load settings, running on defaults: {err}");
            NodeSettings::default()
        });
        store
    }

    pub fn load(&mut self) -> Result<NodeSettings, StoreError> {
        let mut settings = NodeSettings::default();

        if let Some(ssid) = self.backend.get_str(KEY_WIFI_SSID)? {
            settings.wifi_ssid = ssid;
        }
        if let Some(pass) = self.backend.get_str(KEY_WIFI_PASS)? {
            settings.wifi_pass = pass;
        }
        if let Some(raw) = self.backend.get_str(KEY_SAMPLING_INTERVAL_MS)? {
            match raw.trim().parse::<u64>() {
                Ok(interval_ms) => settings.sampling_interval_ms = interval_ms,
                Err(_) => {
                    let err = StoreError::Invalid {
                        key: KEY_SAMPLING_INTERVAL_MS,
                        value: raw,
                    };
                    warn!("{err}; using {DEFAULT_SAMPLING_INTERVAL_MS}ms");
                }
            }
        }

        settings.sanitize();
        Ok(settings)
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.current
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn apply_update(&mut self, update: &ConfigUpdate) -> Result<bool, StoreError> {
        if let Some(interval_ms) = update.sampling_interval_ms {
            let clamped = interval_ms.clamp(MIN_SAMPLING_INTERVAL_MS, MAX_SAMPLING_INTERVAL_MS);
            if clamped != interval_ms {
                warn!("sampling interval {interval_ms}ms out of range, clamped to {clamped}ms");
            }
            if self.current.sampling_interval_ms != clamped {
                self.current.sampling_interval_ms = clamped;
                self.mark_unpersisted(KEY_SAMPLING_INTERVAL_MS);
            }
        }
        if let Some(ssid) = update.network_ssid.as_ref() {
            if self.current.wifi_ssid != *ssid {
                self.current.wifi_ssid = ssid.clone();
                self.mark_unpersisted(KEY_WIFI_SSID);
            }
        }
        if let Some(pass) = update.network_password.as_ref() {
            if self.current.wifi_pass != *pass {
                self.current.wifi_pass = pass.clone();
                self.mark_unpersisted(KEY_WIFI_PASS);
            }
        }

        if self.unpersisted.is_empty() {
            return Ok(false);
        }

        let mut first_error = None;
        let mut written = Vec::new();
        for key in std::mem::take(&mut self.unpersisted) {
            let value = self.persisted_value(key);
            match self.backend.set_str(key, &value) {
                Ok(()) => written.push(key),
                Err(err) => {
                    warn!("failed to persist `{key}`, will retry on next update: {err}");
                    self.unpersisted.push(key);
                    first_error.get_or_insert(err);
                }
            }
        }

        if !written.is_empty() {
            info!("settings updated: {}", written.join(", "));
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.current = NodeSettings::default();
        self.unpersisted.clear();
        self.backend.clear()
    }

    fn mark_unpersisted(&mut self, key: &'static str) {
        if !self.unpersisted.contains(&key) {
            self.unpersisted.push(key);
        }
    }

    fn persisted_value(&self, key: &str) -> String {
        match key {
            KEY_WIFI_SSID => self.current.wifi_ssid.clone(),
            KEY_WIFI_PASS => self.current.wifi_pass.clone(),
            _ => self.current.sampling_interval_ms.to_string(),
        }
    }
}
