use crate::identity::DeviceIdentity;

pub const TOPIC_ROOT: &str = "devices";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Commands,
    Config,
    Data,
    Heartbeat,
    Events,
    Response,
}

impl Channel {
    pub const SUBSCRIPTIONS: [Channel; 2] = [Channel::Commands, Channel::Config];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Config => "config",
            Self::Data => "data",
            Self::Heartbeat => "heartbeat",
            Self::Events => "events",
            Self::Response => "response",
        }
    }

    pub fn inbound_from_topic(topic: &str) -> Option<Self> {
        match topic.rsplit('/').next()? {
            "commands" => Some(Self::Commands),
            "config" => Some(Self::Config),
            _ => None,
        }
    }
}

pub fn topic_for(identity: &DeviceIdentity, channel: Channel) -> String {
    format!("{TOPIC_ROOT}/{}/{}", identity.as_str(), channel.suffix())
}
