pub mod config;
pub mod connectivity;
pub mod error;
pub mod hardware;
pub mod identity;
pub mod led;
pub mod protocol;
pub mod scheduler;
pub mod sensors;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{
    BrokerConfig, ConfigStore, ConfigUpdate, NodeSettings, PinConfig, RuntimeConfig,
    SettingsBackend, TimingConfig,
};
pub use connectivity::{BrokerLink, ConnectivityManager, InboundMessage, LinkEvent};
pub use error::{DecodeError, LinkError, SensorError, StoreError};
pub use hardware::{Actuators, NodeHardware};
pub use identity::DeviceIdentity;
pub use protocol::{Command, Message, MessageRouter, Outcome};
pub use scheduler::{DeviceContext, LocalRequest, Scheduler};
pub use sensors::{Quantity, Reading, SensorBank, SensorDriver};
pub use topics::*;
pub use types::{ConnectivityState, LinkMetrics, SensorSnapshot, TickTime};
