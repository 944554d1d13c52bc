use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("network credentials are not configured")]
    MissingCredentials,
    #[error("network join failed: {0}")]
    Join(String),
    #[error("broker session failed: {0}")]
    Session(String),
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("access point start failed: {0}")]
    AccessPoint(String),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{sensor} read failed: {reason}")]
    Read { sensor: &'static str, reason: String },
    #[error("{sensor} did not answer within its read timeout")]
    Timeout { sensor: &'static str },
    #[error("{sensor} is not present on the bus")]
    Missing { sensor: &'static str },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings backend failure: {0}")]
    Backend(String),
    #[error("stored value for `{key}` is invalid: `{value}`")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is {len} bytes, limit is {limit}")]
    Oversized { len: usize, limit: usize },
    #[error("payload is not valid utf-8")]
    NotUtf8(#[from] core::str::Utf8Error),
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no inbound channel is routed for topic `{0}`")]
    UnroutedTopic(String),
}
