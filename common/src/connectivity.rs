use tracing::{debug, info, warn};

use crate::{
    config::{NodeSettings, TimingConfig},
    error::LinkError,
    identity::DeviceIdentity,
    topics::{topic_for, Channel},
    types::{ConnectivityState, LinkMetrics},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

// Only join_network and open_session may block, and only for one bounded attempt.
pub trait BrokerLink {
    fn join_network(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;
    fn network_up(&self) -> bool;
    fn open_session(&mut self, client_id: &str) -> Result<(), LinkError>;
    fn session_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;
    fn poll_inbound(&mut self) -> Option<InboundMessage>;
    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError>;
    fn metrics(&self) -> LinkMetrics;
    fn session_nonce(&mut self) -> u16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    SessionEstablished,
    SessionLost,
    NetworkLost,
    AccessPointEntered,
}

pub struct ConnectivityManager<L> {
    link: L,
    identity: DeviceIdentity,
    state: ConnectivityState,
    join_attempts: u32,
    retry_at_ms: u64,
    max_join_attempts: u32,
    join_backoff_ms: u64,
    broker_backoff_ms: u64,
}

impl<L: BrokerLink> ConnectivityManager<L> {
    pub fn new(link: L, identity: DeviceIdentity, timing: &TimingConfig) -> Self {
        Self {
            link,
            identity,
            state: ConnectivityState::Disconnected,
            join_attempts: 0,
            retry_at_ms: 0,
            max_join_attempts: timing.network_join_attempts.max(1),
            join_backoff_ms: timing.network_join_backoff_ms,
            broker_backoff_ms: timing.broker_retry_backoff_ms,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn metrics(&self) -> LinkMetrics {
        self.link.metrics()
    }

    pub fn ensure_connected(&mut self, now_ms: u64, settings: &NodeSettings) -> Option<LinkEvent> {
        match self.state {
            ConnectivityState::ConfigAccessPointActive => None,
            ConnectivityState::Disconnected | ConnectivityState::NetworkJoining => {
                self.step_join(now_ms, settings)
            }
            ConnectivityState::NetworkJoined | ConnectivityState::BrokerConnecting => {
                self.step_session(now_ms)
            }
            ConnectivityState::BrokerSessionActive => {
                if self.link.session_connected() {
                    return None;
                }
                warn!("broker session lost; reconnecting");
                self.state = ConnectivityState::BrokerConnecting;
                self.retry_at_ms = now_ms;
                Some(LinkEvent::SessionLost)
            }
        }
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if self.state != ConnectivityState::BrokerSessionActive {
            debug!("dropping publish to {topic}: link is {}", self.state);
            return false;
        }

        match self.link.publish(topic, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!("{err}");
                false
            }
        }
    }

    pub fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if self.state != ConnectivityState::BrokerSessionActive {
            return None;
        }
        self.link.poll_inbound()
    }

    pub fn enter_config_access_point(&mut self) -> bool {
        if self.state == ConnectivityState::ConfigAccessPointActive {
            return false;
        }

        let ssid = self.identity.access_point_ssid();
        self.state = ConnectivityState::ConfigAccessPointActive;
        match self.link.start_access_point(&ssid) {
            Ok(()) => info!("configuration access point `{ssid}` started"),
            Err(err) => warn!("{err}; staying in configuration mode until restart"),
        }
        true
    }

    fn step_join(&mut self, now_ms: u64, settings: &NodeSettings) -> Option<LinkEvent> {
        if now_ms < self.retry_at_ms {
            return None;
        }

        self.state = ConnectivityState::NetworkJoining;
        self.join_attempts = self.join_attempts.saturating_add(1);
        info!(
            "network join attempt {}/{} (`{}`)",
            self.join_attempts, self.max_join_attempts, settings.wifi_ssid
        );

        match self
            .link
            .join_network(&settings.wifi_ssid, &settings.wifi_pass)
        {
            Ok(()) => {
                info!("network joined on attempt {}", self.join_attempts);
                self.state = ConnectivityState::NetworkJoined;
                self.join_attempts = 0;
                self.retry_at_ms = now_ms;
                None
            }
            Err(LinkError::MissingCredentials) => {
                warn!("network credentials missing; entering configuration mode");
                self.enter_config_access_point();
                Some(LinkEvent::AccessPointEntered)
            }
            Err(err) => {
                warn!("network join attempt {} failed: {err}", self.join_attempts);
                if self.join_attempts >= self.max_join_attempts {
                    warn!(
                        "all {} network join attempts failed; entering configuration mode",
                        self.max_join_attempts
                    );
                    self.enter_config_access_point();
                    return Some(LinkEvent::AccessPointEntered);
                }
                self.retry_at_ms = now_ms.saturating_add(self.join_backoff_ms);
                None
            }
        }
    }

    fn step_session(&mut self, now_ms: u64) -> Option<LinkEvent> {
        if !self.link.network_up() {
            warn!("network link down; rejoining");
            self.state = ConnectivityState::Disconnected;
            self.join_attempts = 0;
            self.retry_at_ms = now_ms;
            return Some(LinkEvent::NetworkLost);
        }
        if now_ms < self.retry_at_ms {
            return None;
        }

        self.state = ConnectivityState::BrokerConnecting;
        let client_id = self.identity.session_client_id(self.link.session_nonce());
        info!("opening broker session as `{client_id}`");

        if let Err(err) = self.open_and_subscribe(&client_id) {
            warn!("{err}; retrying in {}ms", self.broker_backoff_ms);
            self.retry_at_ms = now_ms.saturating_add(self.broker_backoff_ms);
            return None;
        }

        info!("broker session active");
        self.state = ConnectivityState::BrokerSessionActive;
        Some(LinkEvent::SessionEstablished)
    }

    fn open_and_subscribe(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.link.open_session(client_id)?;
        for channel in Channel::SUBSCRIPTIONS {
            let topic = topic_for(&self.identity, channel);
            self.link.subscribe(&topic)?;
        }
        Ok(())
    }
}
