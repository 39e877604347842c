//! Error types for the orchestration core

use crate::events::EventType;
use crate::service::CapabilityType;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Queue full: lane {lane} holds {capacity} items")]
    QueueFull { lane: String, capacity: usize },

    #[error("JSON parsing error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No handler registered for {0}")]
    NoHandler(EventType),

    #[error("Event expired: {0}")]
    Expired(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler {handler} timed out after {timeout:?}")]
    HandlerTimeout { handler: String, timeout: Duration },

    #[error("No available {0} service")]
    ServiceUnavailable(CapabilityType),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Service fault in {service_id}: {message}")]
    ServiceFault { service_id: String, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("No candidate services to select from")]
    NoCandidates,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Faults that take a service instance out of rotation for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ServiceFault { .. })
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
