use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("Event payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EventBusError>;
