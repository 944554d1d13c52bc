use std::collections::{BTreeMap, VecDeque};

use crate::{
    config::SettingsBackend,
    connectivity::{BrokerLink, InboundMessage},
    error::{LinkError, SensorError, StoreError},
    hardware::{Actuators, NodeHardware},
    sensors::{Reading, SensorDriver},
    types::LinkMetrics,
};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<String, String>,
    writes: usize,
    pub fail_writes: bool,
    pub reject_key: Option<&'static str>,
}

impl MemoryBackend {
    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SettingsBackend for MemoryBackend {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes || self.reject_key == Some(key) {
            return Err(StoreError::Backend("flash write rejected".to_string()));
        }
        self.writes += 1;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Backend("flash erase rejected".to_string()));
        }
        self.entries.clear();
        Ok(())
    }
}

pub struct ScriptedSensor {
    name: &'static str,
    script: VecDeque<Result<Reading, SensorError>>,
}

impl ScriptedSensor {
    pub fn new(name: &'static str, script: Vec<Result<Reading, SensorError>>) -> Self {
        Self {
            name,
            script: script.into(),
        }
    }
}

impl SensorDriver for ScriptedSensor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        self.script
            .pop_front()
            .unwrap_or(Err(SensorError::Missing { sensor: self.name }))
    }
}

#[derive(Debug, Default)]
pub struct FakeLink {
    pub join_ok: bool,
    pub session_ok: bool,
    pub require_credentials: bool,
    pub network_up: bool,
    pub session_up: bool,
    pub join_calls: u32,
    pub client_ids: Vec<String>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub inbound: VecDeque<InboundMessage>,
    pub access_point: Option<String>,
    pub access_point_starts: u32,
    nonce: u16,
}

impl FakeLink {
    pub fn healthy() -> Self {
        Self {
            join_ok: true,
            session_ok: true,
            ..Default::default()
        }
    }

    pub fn queue_inbound(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn published_topics(&self) -> Vec<&str> {
        self.published
            .iter()
            .map(|(topic, _)| topic.as_str())
            .collect()
    }

    pub fn published_on(&self, suffix: &str) -> Vec<serde_json::Value> {
        self.published
            .iter()
            .filter(|(topic, _)| topic.ends_with(suffix))
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

impl BrokerLink for FakeLink {
    fn join_network(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        if self.require_credentials && ssid.is_empty() {
            return Err(LinkError::MissingCredentials);
        }
        self.join_calls += 1;
        if !self.join_ok {
            return Err(LinkError::Join("no ap answered".to_string()));
        }
        self.network_up = true;
        Ok(())
    }

    fn network_up(&self) -> bool {
        self.network_up
    }

    fn open_session(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.client_ids.push(client_id.to_string());
        if !self.session_ok {
            return Err(LinkError::Session("connection refused".to_string()));
        }
        self.session_up = true;
        Ok(())
    }

    fn session_connected(&self) -> bool {
        self.session_up
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.pop_front()
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        self.access_point_starts += 1;
        self.access_point = Some(ssid.to_string());
        Ok(())
    }

    fn metrics(&self) -> LinkMetrics {
        LinkMetrics {
            rssi: -61,
            free_memory: 182_000,
        }
    }

    fn session_nonce(&mut self) -> u16 {
        self.nonce = self.nonce.wrapping_add(1);
        self.nonce
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwEvent {
    Relay(bool),
    Buzzer(bool),
    Delay(u64),
    Restart,
}

#[derive(Debug, Default)]
pub struct FakeHardware {
    pub motion: bool,
    pub button: bool,
    pub led: bool,
    pub relay: bool,
    pub events: Vec<HwEvent>,
}

impl FakeHardware {
    pub fn restarts(&self) -> usize {
        self.events
            .iter()
            .filter(|event| **event == HwEvent::Restart)
            .count()
    }
}

impl Actuators for FakeHardware {
    fn set_relay(&mut self, on: bool) {
        self.relay = on;
        self.events.push(HwEvent::Relay(on));
    }

    fn set_buzzer(&mut self, on: bool) {
        self.events.push(HwEvent::Buzzer(on));
    }

    fn delay_ms(&mut self, ms: u64) {
        self.events.push(HwEvent::Delay(ms));
    }
}

impl NodeHardware for FakeHardware {
    fn motion_active(&mut self) -> bool {
        self.motion
    }

    fn config_button_pressed(&mut self) -> bool {
        self.button
    }

    fn set_status_led(&mut self, on: bool) {
        self.led = on;
    }

    fn restart(&mut self) {
        self.events.push(HwEvent::Restart);
    }
}
